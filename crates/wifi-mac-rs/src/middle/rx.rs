use crate::frame::{Mac48Address, Packet, WifiMacHeader};
use crate::types::Tid;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// Receive-side state kept per originator (or per originator and TID).
#[derive(Debug, Clone)]
pub struct OriginatorRxStatus {
    last_sequence_control: u16,
    defragmenting: bool,
    fragments: Vec<Packet>,
    last_fragment_us: u64,
}

impl Default for OriginatorRxStatus {
    fn default() -> Self {
        Self {
            // Matches no real sequence control, so the first frame is never a duplicate.
            last_sequence_control: 0xffff,
            defragmenting: false,
            fragments: Vec::new(),
            last_fragment_us: 0,
        }
    }
}

impl OriginatorRxStatus {
    pub fn is_de_fragmenting(&self) -> bool {
        self.defragmenting
    }

    pub fn last_sequence_control(&self) -> u16 {
        self.last_sequence_control
    }

    pub fn set_sequence_control(&mut self, seq_ctl: u16) {
        self.last_sequence_control = seq_ctl;
    }

    /// Same sequence number, fragment number one higher than the last one seen.
    pub fn is_next_fragment(&self, seq_ctl: u16) -> bool {
        (seq_ctl >> 4) == (self.last_sequence_control >> 4)
            && (seq_ctl & 0x0f) == (self.last_sequence_control & 0x0f) + 1
    }

    pub fn accumulate_first_fragment(&mut self, packet: Packet, now_us: u64) {
        debug_assert!(!self.defragmenting);
        self.defragmenting = true;
        self.fragments.clear();
        self.fragments.push(packet);
        self.last_fragment_us = now_us;
    }

    pub fn accumulate_fragment(&mut self, packet: Packet, now_us: u64) {
        debug_assert!(self.defragmenting);
        self.fragments.push(packet);
        self.last_fragment_us = now_us;
    }

    /// Completes reassembly. The result carries the uid of the first fragment.
    pub fn accumulate_last_fragment(&mut self, packet: Packet) -> Packet {
        debug_assert!(self.defragmenting);
        let mut fragments = core::mem::take(&mut self.fragments).into_iter();
        let mut full = fragments.next().unwrap_or_else(Packet::empty);
        for fragment in fragments {
            full.add_at_end(&fragment);
        }
        full.add_at_end(&packet);
        self.defragmenting = false;
        full
    }

    fn abort_reassembly(&mut self) {
        self.defragmenting = false;
        self.fragments.clear();
    }

    fn is_stale(&self, now_us: u64, timeout_us: u64) -> bool {
        self.defragmenting
            && timeout_us > 0
            && now_us.saturating_sub(self.last_fragment_us) >= timeout_us
    }
}

/// Duplicate filtering and defragmentation of received data and management frames.
#[derive(Debug, Clone, Default)]
pub struct MacRxMiddle {
    originators: BTreeMap<Mac48Address, OriginatorRxStatus>,
    qos_originators: BTreeMap<(Mac48Address, Tid), OriginatorRxStatus>,
    reassembly_timeout_us: u64,
}

impl MacRxMiddle {
    /// `reassembly_timeout_us` bounds the gap between two fragments of one MSDU;
    /// 0 waits forever.
    pub fn new(reassembly_timeout_us: u64) -> Self {
        Self {
            reassembly_timeout_us,
            ..Self::default()
        }
    }

    pub fn set_reassembly_timeout(&mut self, timeout_us: u64) {
        self.reassembly_timeout_us = timeout_us;
    }

    /// Drops every partial MSDU whose next fragment is overdue, whoever sent it.
    pub fn expire(&mut self, now_us: u64) {
        let timeout_us = self.reassembly_timeout_us;
        let originators = self
            .originators
            .iter_mut()
            .map(|(address, status)| (*address, status));
        let qos = self
            .qos_originators
            .iter_mut()
            .map(|((address, _), status)| (*address, status));
        for (address, status) in originators.chain(qos) {
            if status.is_stale(now_us, timeout_us) {
                warn!(
                    "Reassembly from {} timed out, discarding {} fragment(s)",
                    address,
                    status.fragments.len()
                );
                status.abort_reassembly();
            }
        }
    }

    fn lookup(&mut self, hdr: &WifiMacHeader) -> &mut OriginatorRxStatus {
        if hdr.is_qos_data() && !hdr.addr2.is_group() {
            self.qos_originators
                .entry((hdr.addr2, hdr.qos_tid()))
                .or_default()
        } else {
            self.originators.entry(hdr.addr2).or_default()
        }
    }

    pub fn originator(&self, hdr: &WifiMacHeader) -> Option<&OriginatorRxStatus> {
        if hdr.is_qos_data() && !hdr.addr2.is_group() {
            self.qos_originators.get(&(hdr.addr2, hdr.qos_tid()))
        } else {
            self.originators.get(&hdr.addr2)
        }
    }

    /// Feeds one received frame through duplicate detection and reassembly.
    /// Returns the complete MSDU once it is available.
    pub fn receive(
        &mut self,
        packet: Packet,
        hdr: WifiMacHeader,
        now_us: u64,
    ) -> Option<(Packet, WifiMacHeader)> {
        debug_assert!(hdr.is_data() || hdr.is_mgt());
        if hdr.is_ctl() {
            return None;
        }
        self.expire(now_us);
        let originator = self.lookup(&hdr);
        let seq_ctl = hdr.sequence_control();

        if hdr.retry && originator.last_sequence_control == seq_ctl {
            debug!(
                "Dropping duplicate frame from {} (seq={}, frag={})",
                hdr.addr2, hdr.sequence_number, hdr.fragment_number
            );
            return None;
        }

        let complete = Self::handle_fragments(packet, &hdr, originator, now_us)?;
        if !hdr.addr1.is_group() {
            originator.set_sequence_control(seq_ctl);
        }
        Some((complete, hdr))
    }

    fn handle_fragments(
        packet: Packet,
        hdr: &WifiMacHeader,
        originator: &mut OriginatorRxStatus,
        now_us: u64,
    ) -> Option<Packet> {
        let seq_ctl = hdr.sequence_control();
        if originator.is_de_fragmenting() {
            if !originator.is_next_fragment(seq_ctl) {
                warn!(
                    "Dropping non-ordered fragment from {} (seq={}, frag={})",
                    hdr.addr2, hdr.sequence_number, hdr.fragment_number
                );
                return None;
            }
            if hdr.more_fragments {
                trace!("Accumulating fragment {}", hdr.fragment_number);
                originator.accumulate_fragment(packet, now_us);
                originator.set_sequence_control(seq_ctl);
                None
            } else {
                trace!("Last fragment {}, reassembly complete", hdr.fragment_number);
                Some(originator.accumulate_last_fragment(packet))
            }
        } else if hdr.fragment_number != 0 {
            warn!(
                "Dropping fragment {} from {} without its predecessors (seq={})",
                hdr.fragment_number, hdr.addr2, hdr.sequence_number
            );
            None
        } else if hdr.more_fragments {
            trace!("First fragment of seq={}", hdr.sequence_number);
            originator.accumulate_first_fragment(packet, now_us);
            originator.set_sequence_control(seq_ctl);
            None
        } else {
            Some(packet)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::WifiMacType;
    use alloc::vec;

    fn data_from(src: u16, seq: u16, frag: u8, more: bool) -> WifiMacHeader {
        let mut hdr = WifiMacHeader::new(WifiMacType::Data);
        hdr.addr1 = Mac48Address::local(100);
        hdr.addr2 = Mac48Address::local(src);
        hdr.sequence_number = seq;
        hdr.fragment_number = frag;
        hdr.more_fragments = more;
        hdr
    }

    /// Splits `payload` the way the transmit side does and feeds the pieces in order.
    fn fragment_and_reassemble(payload: &[u8], threshold: usize) -> Option<Vec<u8>> {
        let mut rx = MacRxMiddle::new(0);
        let original = Packet::new(payload.to_vec());
        let count = payload.len().div_ceil(threshold).max(1);
        let mut result = None;
        for n in 0..count {
            let frag = original.create_fragment(n * threshold, threshold);
            let hdr = data_from(1, 42, n as u8, n + 1 < count);
            let out = rx.receive(frag, hdr, n as u64);
            if n + 1 < count {
                assert!(out.is_none());
            } else {
                result = out.map(|(p, _)| p.into_data());
            }
        }
        result
    }

    #[test]
    fn test_fragmentation_roundtrip_is_byte_identical() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        for threshold in [1, 7, 100, 256, 333, 999, 1000, 2000] {
            if payload.len().div_ceil(threshold) > 16 {
                continue;
            }
            assert_eq!(
                fragment_and_reassemble(&payload, threshold).as_deref(),
                Some(&payload[..]),
                "threshold {threshold}"
            );
        }
    }

    #[test]
    fn test_retransmission_is_dropped_once_accepted() {
        let mut rx = MacRxMiddle::new(0);
        let hdr = data_from(1, 10, 0, false);
        assert!(rx.receive(Packet::new(vec![1]), hdr.clone(), 0).is_some());
        let mut again = hdr.clone();
        again.retry = true;
        assert!(rx.receive(Packet::new(vec![1]), again.clone(), 1).is_none());
        // Without the retry bit the frame is new data, even with the same sequence control.
        assert!(rx.receive(Packet::new(vec![1]), hdr, 2).is_some());
        // Another originator is independent.
        again.addr2 = Mac48Address::local(2);
        assert!(rx.receive(Packet::new(vec![1]), again, 3).is_some());
    }

    #[test]
    fn test_group_frames_do_not_update_last_sequence() {
        let mut rx = MacRxMiddle::new(0);
        let mut hdr = data_from(1, 10, 0, false);
        hdr.addr1 = Mac48Address::BROADCAST;
        hdr.retry = true;
        assert!(rx.receive(Packet::new(vec![1]), hdr.clone(), 0).is_some());
        assert!(rx.receive(Packet::new(vec![1]), hdr.clone(), 1).is_some());
        assert_eq!(rx.originator(&hdr).unwrap().last_sequence_control(), 0xffff);
    }

    #[test]
    fn test_out_of_order_fragment_is_dropped() {
        let mut rx = MacRxMiddle::new(0);
        assert!(rx.receive(Packet::new(vec![1]), data_from(1, 5, 0, true), 0).is_none());
        // Fragment 2 arrives before fragment 1.
        assert!(rx.receive(Packet::new(vec![3]), data_from(1, 5, 2, false), 1).is_none());
        assert!(rx.receive(Packet::new(vec![2]), data_from(1, 5, 1, true), 2).is_none());
        let (full, _) = rx
            .receive(Packet::new(vec![3]), data_from(1, 5, 2, false), 3)
            .unwrap();
        assert_eq!(full.data(), &[1, 2, 3]);
    }

    #[test]
    fn test_qos_tids_reassemble_independently() {
        let mut rx = MacRxMiddle::new(0);
        let qos = |tid: u8, frag: u8, more: bool| {
            let mut hdr = data_from(1, 7, frag, more);
            hdr.kind = WifiMacType::QosData;
            hdr.qos.tid = tid;
            hdr
        };
        assert!(rx.receive(Packet::new(vec![1]), qos(1, 0, true), 0).is_none());
        assert!(rx.receive(Packet::new(vec![9]), qos(2, 0, true), 0).is_none());
        let (a, _) = rx.receive(Packet::new(vec![2]), qos(1, 1, false), 1).unwrap();
        let (b, _) = rx.receive(Packet::new(vec![8]), qos(2, 1, false), 1).unwrap();
        assert_eq!(a.data(), &[1, 2]);
        assert_eq!(b.data(), &[9, 8]);
    }

    #[test]
    fn test_stale_reassembly_is_discarded() {
        let mut rx = MacRxMiddle::new(100);
        assert!(rx.receive(Packet::new(vec![1]), data_from(1, 5, 0, true), 0).is_none());
        // The last fragment comes too late: the partial MSDU is gone and the
        // orphan is not delivered on its own.
        assert!(rx.receive(Packet::new(vec![2]), data_from(1, 5, 1, false), 150).is_none());
        assert!(!rx.originator(&data_from(1, 0, 0, false)).unwrap().is_de_fragmenting());

        // Within the timeout reassembly still works.
        assert!(rx.receive(Packet::new(vec![1]), data_from(1, 6, 0, true), 200).is_none());
        let (full, _) = rx
            .receive(Packet::new(vec![2]), data_from(1, 6, 1, false), 250)
            .unwrap();
        assert_eq!(full.data(), &[1, 2]);
    }

    #[test]
    fn test_silent_originator_loses_its_fragments() {
        let mut rx = MacRxMiddle::new(100);
        assert!(rx.receive(Packet::new(vec![0; 1000]), data_from(1, 5, 0, true), 0).is_none());
        let silent = data_from(1, 0, 0, false);
        assert!(rx.originator(&silent).unwrap().is_de_fragmenting());

        // Another originator keeps the receiver busy.
        for n in 1..50u16 {
            let now = u64::from(n) * 1000;
            assert!(rx.receive(Packet::new(vec![1]), data_from(2, n, 0, false), now).is_some());
            assert!(!rx.originator(&silent).unwrap().is_de_fragmenting(), "t={now}");
        }
    }

    #[test]
    fn test_expire_keeps_fresh_reassembly() {
        let mut rx = MacRxMiddle::new(100);
        assert!(rx.receive(Packet::new(vec![1]), data_from(1, 5, 0, true), 0).is_none());
        rx.expire(99);
        assert!(rx.originator(&data_from(1, 0, 0, false)).unwrap().is_de_fragmenting());
        rx.expire(100);
        assert!(!rx.originator(&data_from(1, 0, 0, false)).unwrap().is_de_fragmenting());
    }

    #[test]
    fn test_orphan_fragment_is_dropped() {
        let mut rx = MacRxMiddle::new(0);
        // Fragment 0 was never received.
        assert!(rx.receive(Packet::new(vec![2]), data_from(1, 5, 1, false), 0).is_none());
        // The next MSDU is unaffected.
        assert!(rx.receive(Packet::new(vec![3]), data_from(1, 6, 0, false), 1).is_some());
    }
}
