use crate::frame::address::Mac48Address;
use crate::frame::codec::{Codec, Reader, Writer};
use crate::hal::WifiMacError;
use crate::types::{FCS_SIZE, Tid};
use alloc::vec;
use alloc::vec::Vec;

const TYPE_MGT: u8 = 0;
const TYPE_CTL: u8 = 1;
const TYPE_DATA: u8 = 2;

/// Every frame type/subtype combination the MAC understands.
/// (IEEE 802.11-2012, Table 8-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WifiMacType {
    CtlRts,
    CtlCts,
    CtlAck,
    CtlBackReq,
    CtlBackResp,

    MgtBeacon,
    MgtAssocRequest,
    MgtAssocResponse,
    MgtDisassociation,
    MgtReassocRequest,
    MgtReassocResponse,
    MgtProbeRequest,
    MgtProbeResponse,
    MgtAuthentication,
    MgtDeauthentication,
    MgtAction,
    MgtActionNoAck,
    MgtMultihopAction,

    Data,
    DataCfack,
    DataCfpoll,
    DataCfackCfpoll,
    DataNull,
    DataNullCfack,
    DataNullCfpoll,
    DataNullCfackCfpoll,
    QosData,
    QosDataCfack,
    QosDataCfpoll,
    QosDataCfackCfpoll,
    QosNull,
    QosNullCfpoll,
    QosNullCfackCfpoll,
}

impl WifiMacType {
    /// Returns the (type, subtype) pair carried in the frame control field.
    pub const fn type_subtype(self) -> (u8, u8) {
        use WifiMacType::*;
        match self {
            CtlBackReq => (TYPE_CTL, 8),
            CtlBackResp => (TYPE_CTL, 9),
            CtlRts => (TYPE_CTL, 11),
            CtlCts => (TYPE_CTL, 12),
            CtlAck => (TYPE_CTL, 13),

            MgtAssocRequest => (TYPE_MGT, 0),
            MgtAssocResponse => (TYPE_MGT, 1),
            MgtReassocRequest => (TYPE_MGT, 2),
            MgtReassocResponse => (TYPE_MGT, 3),
            MgtProbeRequest => (TYPE_MGT, 4),
            MgtProbeResponse => (TYPE_MGT, 5),
            MgtBeacon => (TYPE_MGT, 8),
            MgtDisassociation => (TYPE_MGT, 10),
            MgtAuthentication => (TYPE_MGT, 11),
            MgtDeauthentication => (TYPE_MGT, 12),
            MgtAction => (TYPE_MGT, 13),
            MgtActionNoAck => (TYPE_MGT, 14),
            MgtMultihopAction => (TYPE_MGT, 15),

            Data => (TYPE_DATA, 0),
            DataCfack => (TYPE_DATA, 1),
            DataCfpoll => (TYPE_DATA, 2),
            DataCfackCfpoll => (TYPE_DATA, 3),
            DataNull => (TYPE_DATA, 4),
            DataNullCfack => (TYPE_DATA, 5),
            DataNullCfpoll => (TYPE_DATA, 6),
            DataNullCfackCfpoll => (TYPE_DATA, 7),
            QosData => (TYPE_DATA, 8),
            QosDataCfack => (TYPE_DATA, 9),
            QosDataCfpoll => (TYPE_DATA, 10),
            QosDataCfackCfpoll => (TYPE_DATA, 11),
            QosNull => (TYPE_DATA, 12),
            QosNullCfpoll => (TYPE_DATA, 14),
            QosNullCfackCfpoll => (TYPE_DATA, 15),
        }
    }
}

impl TryFrom<(u8, u8)> for WifiMacType {
    type Error = WifiMacError;

    fn try_from((kind, subtype): (u8, u8)) -> Result<Self, Self::Error> {
        use WifiMacType::*;
        let ty = match (kind, subtype) {
            (TYPE_CTL, 8) => CtlBackReq,
            (TYPE_CTL, 9) => CtlBackResp,
            (TYPE_CTL, 11) => CtlRts,
            (TYPE_CTL, 12) => CtlCts,
            (TYPE_CTL, 13) => CtlAck,

            (TYPE_MGT, 0) => MgtAssocRequest,
            (TYPE_MGT, 1) => MgtAssocResponse,
            (TYPE_MGT, 2) => MgtReassocRequest,
            (TYPE_MGT, 3) => MgtReassocResponse,
            (TYPE_MGT, 4) => MgtProbeRequest,
            (TYPE_MGT, 5) => MgtProbeResponse,
            (TYPE_MGT, 8) => MgtBeacon,
            (TYPE_MGT, 10) => MgtDisassociation,
            (TYPE_MGT, 11) => MgtAuthentication,
            (TYPE_MGT, 12) => MgtDeauthentication,
            (TYPE_MGT, 13) => MgtAction,
            (TYPE_MGT, 14) => MgtActionNoAck,
            (TYPE_MGT, 15) => MgtMultihopAction,

            (TYPE_DATA, 0) => Data,
            (TYPE_DATA, 1) => DataCfack,
            (TYPE_DATA, 2) => DataCfpoll,
            (TYPE_DATA, 3) => DataCfackCfpoll,
            (TYPE_DATA, 4) => DataNull,
            (TYPE_DATA, 5) => DataNullCfack,
            (TYPE_DATA, 6) => DataNullCfpoll,
            (TYPE_DATA, 7) => DataNullCfackCfpoll,
            (TYPE_DATA, 8) => QosData,
            (TYPE_DATA, 9) => QosDataCfack,
            (TYPE_DATA, 10) => QosDataCfpoll,
            (TYPE_DATA, 11) => QosDataCfackCfpoll,
            (TYPE_DATA, 12) => QosNull,
            (TYPE_DATA, 14) => QosNullCfpoll,
            (TYPE_DATA, 15) => QosNullCfackCfpoll,
            _ => return Err(WifiMacError::InvalidFrameType((kind << 4) | (subtype & 0x0f))),
        };
        Ok(ty)
    }
}

/// Ack policy subfield of the QoS control field (bits 5-6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QosAckPolicy {
    #[default]
    NormalAck = 0,
    NoAck = 1,
    NoExplicitAck = 2,
    BlockAck = 3,
}

impl From<u8> for QosAckPolicy {
    fn from(bits: u8) -> Self {
        match bits & 0x03 {
            0 => QosAckPolicy::NormalAck,
            1 => QosAckPolicy::NoAck,
            2 => QosAckPolicy::NoExplicitAck,
            _ => QosAckPolicy::BlockAck,
        }
    }
}

/// Decoded QoS control field of a QoS data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QosControl {
    pub tid: u8,
    pub eosp: bool,
    pub ack_policy: QosAckPolicy,
    pub amsdu_present: bool,
    /// TXOP limit or queue size, depending on who sent the frame.
    pub txop: u8,
}

impl QosControl {
    pub fn to_bits(self) -> u16 {
        let mut bits = (self.tid & 0x0f) as u16;
        if self.eosp {
            bits |= 1 << 4;
        }
        bits |= (self.ack_policy as u16) << 5;
        if self.amsdu_present {
            bits |= 1 << 7;
        }
        bits | ((self.txop as u16) << 8)
    }

    pub fn from_bits(bits: u16) -> Self {
        QosControl {
            tid: (bits & 0x0f) as u8,
            eosp: bits & (1 << 4) != 0,
            ack_policy: QosAckPolicy::from(((bits >> 5) & 0x03) as u8),
            amsdu_present: bits & (1 << 7) != 0,
            txop: (bits >> 8) as u8,
        }
    }
}

/// The 802.11 MAC header.
/// (IEEE 802.11-2012, Section 8.2)
///
/// Which fields appear on the wire depends on `kind`: control frames carry one
/// or two addresses, data frames carry a fourth address only when both DS
/// bits are set and a QoS control field only for QoS subtypes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiMacHeader {
    pub kind: WifiMacType,
    pub to_ds: bool,
    pub from_ds: bool,
    pub more_fragments: bool,
    pub retry: bool,
    pub power_management: bool,
    pub more_data: bool,
    pub protected: bool,
    pub order: bool,
    /// Duration/ID field in microseconds.
    pub duration_us: u16,
    pub addr1: Mac48Address,
    pub addr2: Mac48Address,
    pub addr3: Mac48Address,
    pub addr4: Mac48Address,
    /// 12-bit sequence number.
    pub sequence_number: u16,
    /// 4-bit fragment number.
    pub fragment_number: u8,
    pub qos: QosControl,
}

impl WifiMacHeader {
    /// Largest value the duration field can carry for NAV purposes.
    pub const MAX_DURATION_US: u16 = 0x7fff;

    pub fn new(kind: WifiMacType) -> Self {
        WifiMacHeader {
            kind,
            to_ds: false,
            from_ds: false,
            more_fragments: false,
            retry: false,
            power_management: false,
            more_data: false,
            protected: false,
            order: false,
            duration_us: 0,
            addr1: Mac48Address::default(),
            addr2: Mac48Address::default(),
            addr3: Mac48Address::default(),
            addr4: Mac48Address::default(),
            sequence_number: 0,
            fragment_number: 0,
            qos: QosControl::default(),
        }
    }

    pub fn rts(receiver: Mac48Address, transmitter: Mac48Address, duration_us: u64) -> Self {
        let mut hdr = Self::new(WifiMacType::CtlRts);
        hdr.addr1 = receiver;
        hdr.addr2 = transmitter;
        hdr.set_duration_us(duration_us);
        hdr
    }

    pub fn cts(receiver: Mac48Address, duration_us: u64) -> Self {
        let mut hdr = Self::new(WifiMacType::CtlCts);
        hdr.addr1 = receiver;
        hdr.set_duration_us(duration_us);
        hdr
    }

    pub fn ack(receiver: Mac48Address, duration_us: u64) -> Self {
        let mut hdr = Self::new(WifiMacType::CtlAck);
        hdr.addr1 = receiver;
        hdr.set_duration_us(duration_us);
        hdr
    }

    /// Sets the duration field, saturating at the largest NAV value.
    pub fn set_duration_us(&mut self, duration_us: u64) {
        self.duration_us = duration_us.min(Self::MAX_DURATION_US as u64) as u16;
    }

    pub fn duration_us(&self) -> u64 {
        self.duration_us as u64
    }

    // --- Predicates ---

    pub fn is_ctl(&self) -> bool {
        self.kind.type_subtype().0 == TYPE_CTL
    }

    pub fn is_mgt(&self) -> bool {
        self.kind.type_subtype().0 == TYPE_MGT
    }

    pub fn is_data(&self) -> bool {
        self.kind.type_subtype().0 == TYPE_DATA
    }

    /// QoS subtypes have bit 3 of the subtype set.
    pub fn is_qos_data(&self) -> bool {
        let (kind, subtype) = self.kind.type_subtype();
        kind == TYPE_DATA && subtype & 0x08 != 0
    }

    pub fn is_cfpoll(&self) -> bool {
        let (kind, subtype) = self.kind.type_subtype();
        kind == TYPE_DATA && subtype & 0x02 != 0
    }

    /// Null-function subtypes carry no MSDU.
    pub fn is_null_data(&self) -> bool {
        let (kind, subtype) = self.kind.type_subtype();
        kind == TYPE_DATA && subtype & 0x04 != 0
    }

    pub fn is_rts(&self) -> bool {
        self.kind == WifiMacType::CtlRts
    }

    pub fn is_cts(&self) -> bool {
        self.kind == WifiMacType::CtlCts
    }

    pub fn is_ack(&self) -> bool {
        self.kind == WifiMacType::CtlAck
    }

    pub fn is_qos_no_ack(&self) -> bool {
        self.is_qos_data() && self.qos.ack_policy == QosAckPolicy::NoAck
    }

    pub fn is_qos_amsdu(&self) -> bool {
        self.is_qos_data() && self.qos.amsdu_present
    }

    pub fn qos_tid(&self) -> Tid {
        // The field is four bits wide, so the conversion cannot fail.
        Tid::try_from(self.qos.tid & 0x0f).unwrap_or_default()
    }

    pub fn set_qos_tid(&mut self, tid: Tid) {
        self.qos.tid = tid.value();
    }

    // --- Packed fields ---

    pub fn frame_control(&self) -> u16 {
        let (kind, subtype) = self.kind.type_subtype();
        let mut fc = ((kind as u16) << 2) | ((subtype as u16) << 4);
        let flags = [
            (self.to_ds, 8),
            (self.from_ds, 9),
            (self.more_fragments, 10),
            (self.retry, 11),
            (self.power_management, 12),
            (self.more_data, 13),
            (self.protected, 14),
            (self.order, 15),
        ];
        for (set, bit) in flags {
            if set {
                fc |= 1 << bit;
            }
        }
        fc
    }

    pub fn set_frame_control(&mut self, fc: u16) -> Result<(), WifiMacError> {
        let kind = ((fc >> 2) & 0x03) as u8;
        let subtype = ((fc >> 4) & 0x0f) as u8;
        self.kind = WifiMacType::try_from((kind, subtype))?;
        self.to_ds = fc & (1 << 8) != 0;
        self.from_ds = fc & (1 << 9) != 0;
        self.more_fragments = fc & (1 << 10) != 0;
        self.retry = fc & (1 << 11) != 0;
        self.power_management = fc & (1 << 12) != 0;
        self.more_data = fc & (1 << 13) != 0;
        self.protected = fc & (1 << 14) != 0;
        self.order = fc & (1 << 15) != 0;
        Ok(())
    }

    pub fn sequence_control(&self) -> u16 {
        ((self.sequence_number & 0x0fff) << 4) | (self.fragment_number & 0x0f) as u16
    }

    pub fn set_sequence_control(&mut self, seq_ctl: u16) {
        self.sequence_number = seq_ctl >> 4;
        self.fragment_number = (seq_ctl & 0x0f) as u8;
    }

    /// Size of the header on the wire, without FCS.
    pub fn size(&self) -> usize {
        use WifiMacType::*;
        match self.kind {
            CtlRts | CtlBackReq | CtlBackResp => 16,
            CtlCts | CtlAck => 10,
            _ if self.is_mgt() => 24,
            _ => {
                let mut size = 24;
                if self.to_ds && self.from_ds {
                    size += 6;
                }
                if self.is_qos_data() {
                    size += 2;
                }
                size
            }
        }
    }
}

impl Codec for WifiMacHeader {
    fn serialized_size(&self) -> usize {
        self.size()
    }

    fn serialize(&self, buffer: &mut [u8]) -> Result<usize, WifiMacError> {
        if buffer.len() < self.size() {
            return Err(WifiMacError::BufferTooShort);
        }
        let mut w = Writer::new(buffer);
        w.u16_le(self.frame_control())?;
        w.u16_le(self.duration_us)?;
        w.address(&self.addr1)?;
        match self.kind {
            WifiMacType::CtlRts | WifiMacType::CtlBackReq | WifiMacType::CtlBackResp => {
                w.address(&self.addr2)?;
            }
            WifiMacType::CtlCts | WifiMacType::CtlAck => {}
            _ => {
                w.address(&self.addr2)?;
                w.address(&self.addr3)?;
                w.u16_le(self.sequence_control())?;
                if self.is_data() {
                    if self.to_ds && self.from_ds {
                        w.address(&self.addr4)?;
                    }
                    if self.is_qos_data() {
                        w.u16_le(self.qos.to_bits())?;
                    }
                }
            }
        }
        Ok(w.position())
    }

    fn deserialize(buffer: &[u8]) -> Result<(Self, usize), WifiMacError> {
        let mut r = Reader::new(buffer);
        let fc = r.u16_le()?;
        let mut hdr = WifiMacHeader::new(WifiMacType::Data);
        hdr.set_frame_control(fc)?;
        hdr.duration_us = r.u16_le()?;
        hdr.addr1 = r.address()?;
        match hdr.kind {
            WifiMacType::CtlRts | WifiMacType::CtlBackReq | WifiMacType::CtlBackResp => {
                hdr.addr2 = r.address()?;
            }
            WifiMacType::CtlCts | WifiMacType::CtlAck => {}
            _ => {
                hdr.addr2 = r.address()?;
                hdr.addr3 = r.address()?;
                hdr.set_sequence_control(r.u16_le()?);
                if hdr.is_data() {
                    if hdr.to_ds && hdr.from_ds {
                        hdr.addr4 = r.address()?;
                    }
                    if hdr.is_qos_data() {
                        hdr.qos = QosControl::from_bits(r.u16_le()?);
                    }
                }
            }
        }
        Ok((hdr, r.position()))
    }
}

/// Builds the PSDU handed to the PHY: header, payload and FCS.
///
/// The FCS is carried as four zero bytes; the PHY model decides reception
/// success on its own.
pub fn encode_mpdu(header: &WifiMacHeader, payload: &[u8]) -> Result<Vec<u8>, WifiMacError> {
    let header_size = header.size();
    let mut psdu = vec![0u8; header_size + payload.len() + FCS_SIZE];
    header.serialize(&mut psdu)?;
    psdu[header_size..header_size + payload.len()].copy_from_slice(payload);
    Ok(psdu)
}

/// Splits a received PSDU into header and payload, dropping the FCS.
pub fn decode_mpdu(psdu: &[u8]) -> Result<(WifiMacHeader, Vec<u8>), WifiMacError> {
    if psdu.len() < FCS_SIZE {
        return Err(WifiMacError::BufferTooShort);
    }
    let body = &psdu[..psdu.len() - FCS_SIZE];
    let (header, consumed) = WifiMacHeader::deserialize(body)?;
    Ok((header, body[consumed..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qos_header() -> WifiMacHeader {
        let mut hdr = WifiMacHeader::new(WifiMacType::QosData);
        hdr.addr1 = Mac48Address::local(1);
        hdr.addr2 = Mac48Address::local(2);
        hdr.addr3 = Mac48Address::local(3);
        hdr.duration_us = 44;
        hdr.sequence_number = 0x123;
        hdr.fragment_number = 2;
        hdr.retry = true;
        hdr.more_fragments = true;
        hdr.qos = QosControl {
            tid: 5,
            eosp: false,
            ack_policy: QosAckPolicy::NoAck,
            amsdu_present: true,
            txop: 0,
        };
        hdr
    }

    #[test]
    fn test_frame_control_bit_layout() {
        let mut hdr = WifiMacHeader::new(WifiMacType::QosData);
        // Type 2 in bits 2-3, subtype 8 in bits 4-7.
        assert_eq!(hdr.frame_control(), 0x0088);
        hdr.to_ds = true;
        hdr.retry = true;
        assert_eq!(hdr.frame_control(), 0x0988);
        let rts = WifiMacHeader::new(WifiMacType::CtlRts);
        assert_eq!(rts.frame_control(), 0x00b4);
        let ack = WifiMacHeader::new(WifiMacType::CtlAck);
        assert_eq!(ack.frame_control(), 0x00d4);
    }

    #[test]
    fn test_every_type_survives_frame_control() {
        use WifiMacType::*;
        let all = [
            CtlRts, CtlCts, CtlAck, CtlBackReq, CtlBackResp, MgtBeacon, MgtAssocRequest,
            MgtAssocResponse, MgtDisassociation, MgtReassocRequest, MgtReassocResponse,
            MgtProbeRequest, MgtProbeResponse, MgtAuthentication, MgtDeauthentication, MgtAction,
            MgtActionNoAck, MgtMultihopAction, Data, DataCfack, DataCfpoll, DataCfackCfpoll,
            DataNull, DataNullCfack, DataNullCfpoll, DataNullCfackCfpoll, QosData, QosDataCfack,
            QosDataCfpoll, QosDataCfackCfpoll, QosNull, QosNullCfpoll, QosNullCfackCfpoll,
        ];
        for kind in all {
            let hdr = WifiMacHeader::new(kind);
            let mut back = WifiMacHeader::new(WifiMacType::Data);
            back.set_frame_control(hdr.frame_control()).unwrap();
            assert_eq!(back.kind, kind);
        }
    }

    #[test]
    fn test_unknown_subtype_is_rejected() {
        let mut hdr = WifiMacHeader::new(WifiMacType::Data);
        // Data subtype 13 is reserved.
        let fc = (2 << 2) | (13 << 4);
        assert_eq!(
            hdr.set_frame_control(fc),
            Err(WifiMacError::InvalidFrameType(0x2d))
        );
        // Control wrapper (7) is not supported either.
        assert!(hdr.set_frame_control((1 << 2) | (7 << 4)).is_err());
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(WifiMacHeader::new(WifiMacType::CtlAck).size(), 10);
        assert_eq!(WifiMacHeader::new(WifiMacType::CtlCts).size(), 10);
        assert_eq!(WifiMacHeader::new(WifiMacType::CtlRts).size(), 16);
        assert_eq!(WifiMacHeader::new(WifiMacType::CtlBackReq).size(), 16);
        assert_eq!(WifiMacHeader::new(WifiMacType::MgtBeacon).size(), 24);
        assert_eq!(WifiMacHeader::new(WifiMacType::Data).size(), 24);
        assert_eq!(WifiMacHeader::new(WifiMacType::QosData).size(), 26);
        let mut wds = WifiMacHeader::new(WifiMacType::QosData);
        wds.to_ds = true;
        wds.from_ds = true;
        assert_eq!(wds.size(), 32);
    }

    #[test]
    fn test_sequence_and_qos_control() {
        let hdr = qos_header();
        assert_eq!(hdr.sequence_control(), 0x1232);
        // tid 5, NoAck (1 << 5), amsdu (1 << 7).
        assert_eq!(hdr.qos.to_bits(), 0x00a5);
        assert!(hdr.is_qos_no_ack());
        assert!(hdr.is_qos_amsdu());
        assert_eq!(hdr.qos_tid().value(), 5);
        let mut other = WifiMacHeader::new(WifiMacType::Data);
        other.set_sequence_control(0xfff3);
        assert_eq!(other.sequence_number, 0x0fff);
        assert_eq!(other.fragment_number, 3);
    }

    #[test]
    fn test_qos_header_codec_roundtrip() {
        let hdr = qos_header();
        let mut buffer = [0u8; 64];
        let written = hdr.serialize(&mut buffer).unwrap();
        assert_eq!(written, 26);
        // Little-endian frame control then duration.
        assert_eq!(&buffer[0..4], &[0x88, 0x0c, 44, 0]);
        let (back, consumed) = WifiMacHeader::deserialize(&buffer[..written]).unwrap();
        assert_eq!(consumed, 26);
        assert_eq!(back, hdr);
    }

    #[test]
    fn test_rts_codec_carries_transmitter_only() {
        let hdr = WifiMacHeader::rts(Mac48Address::local(1), Mac48Address::local(2), 300);
        let mut buffer = [0u8; 16];
        assert_eq!(hdr.serialize(&mut buffer).unwrap(), 16);
        let (back, _) = WifiMacHeader::deserialize(&buffer).unwrap();
        assert_eq!(back.addr2, Mac48Address::local(2));
        assert_eq!(back.duration_us(), 300);
    }

    #[test]
    fn test_truncated_header_is_rejected() {
        let hdr = qos_header();
        let mut buffer = [0u8; 64];
        let written = hdr.serialize(&mut buffer).unwrap();
        assert_eq!(
            WifiMacHeader::deserialize(&buffer[..written - 1]),
            Err(WifiMacError::BufferTooShort)
        );
        assert_eq!(hdr.serialize(&mut buffer[..10]), Err(WifiMacError::BufferTooShort));
    }

    #[test]
    fn test_mpdu_roundtrip_strips_fcs() {
        let hdr = qos_header();
        let psdu = encode_mpdu(&hdr, &[9, 8, 7]).unwrap();
        assert_eq!(psdu.len(), 26 + 3 + FCS_SIZE);
        let (back, payload) = decode_mpdu(&psdu).unwrap();
        assert_eq!(back, hdr);
        assert_eq!(payload, [9, 8, 7]);
    }

    #[test]
    fn test_duration_saturates() {
        let hdr = WifiMacHeader::cts(Mac48Address::local(1), 1_000_000);
        assert_eq!(hdr.duration_us, WifiMacHeader::MAX_DURATION_US);
    }
}
