use crate::frame::WifiMacHeader;
use crate::types::{NUM_TIDS, SEQUENCE_NUMBER_SPACE};

/// Assigns 802.11 sequence numbers to outgoing MSDUs.
///
/// Unicast QoS data draws from one counter per TID; everything else shares a
/// single counter. All counters wrap modulo 4096.
#[derive(Debug, Clone, Default)]
pub struct MacTxMiddle {
    sequence: u16,
    qos_sequences: [u16; NUM_TIDS],
}

impl MacTxMiddle {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter_for(&mut self, hdr: &WifiMacHeader) -> &mut u16 {
        if hdr.is_qos_data() && !hdr.addr1.is_group() {
            &mut self.qos_sequences[hdr.qos_tid().index()]
        } else {
            &mut self.sequence
        }
    }

    /// Returns the sequence number to put in `hdr` and advances its counter.
    pub fn next_sequence_number_for(&mut self, hdr: &WifiMacHeader) -> u16 {
        let counter = self.counter_for(hdr);
        let current = *counter;
        *counter = (current + 1) % SEQUENCE_NUMBER_SPACE;
        current
    }

    /// Returns what `next_sequence_number_for` would return, without advancing.
    pub fn peek_next_sequence_number_for(&mut self, hdr: &WifiMacHeader) -> u16 {
        *self.counter_for(hdr)
    }
}
