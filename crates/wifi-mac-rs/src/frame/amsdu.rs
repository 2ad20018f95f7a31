use crate::frame::address::Mac48Address;
use crate::frame::codec::{Codec, Reader, Writer};
use crate::frame::packet::Packet;
use crate::hal::WifiMacError;
use alloc::vec::Vec;

/// DA (6) + SA (6) + length (2).
pub const AMSDU_SUBFRAME_HEADER_SIZE: usize = 14;
/// Largest A-MSDU a non-HT station may send.
pub const DEFAULT_MAX_AMSDU_SIZE: usize = 7935;

/// Header preceding every MSDU inside an A-MSDU.
/// (IEEE 802.11-2012, Section 8.3.2.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmsduSubframeHeader {
    pub destination: Mac48Address,
    pub source: Mac48Address,
    /// MSDU length. Unlike the rest of the MAC header this is big-endian.
    pub length: u16,
}

impl Codec for AmsduSubframeHeader {
    fn serialized_size(&self) -> usize {
        AMSDU_SUBFRAME_HEADER_SIZE
    }

    fn serialize(&self, buffer: &mut [u8]) -> Result<usize, WifiMacError> {
        let mut w = Writer::new(buffer);
        w.address(&self.destination)?;
        w.address(&self.source)?;
        w.u16_be(self.length)?;
        Ok(w.position())
    }

    fn deserialize(buffer: &[u8]) -> Result<(Self, usize), WifiMacError> {
        let mut r = Reader::new(buffer);
        let header = AmsduSubframeHeader {
            destination: r.address()?,
            source: r.address()?,
            length: r.u16_be()?,
        };
        Ok((header, r.position()))
    }
}

fn padding_for(size: usize) -> usize {
    (4 - size % 4) % 4
}

/// Packs MSDUs into an A-MSDU.
pub trait MsduAggregator {
    /// Appends `packet` as a new subframe of `aggregated`.
    /// Returns false, leaving `aggregated` untouched, if it would not fit.
    fn aggregate(
        &self,
        packet: &Packet,
        aggregated: &mut Packet,
        src: Mac48Address,
        dest: Mac48Address,
    ) -> bool;
}

/// Aggregator bounded by a maximum A-MSDU size. Every subframe but the last
/// is padded to a multiple of four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsduStandardAggregator {
    pub max_amsdu_size: usize,
}

impl MsduStandardAggregator {
    pub fn new(max_amsdu_size: usize) -> Self {
        Self { max_amsdu_size }
    }
}

impl Default for MsduStandardAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AMSDU_SIZE)
    }
}

impl MsduAggregator for MsduStandardAggregator {
    fn aggregate(
        &self,
        packet: &Packet,
        aggregated: &mut Packet,
        src: Mac48Address,
        dest: Mac48Address,
    ) -> bool {
        let actual = aggregated.size();
        let padding = padding_for(actual);
        if AMSDU_SUBFRAME_HEADER_SIZE + packet.size() + actual + padding > self.max_amsdu_size {
            return false;
        }
        let Ok(length) = u16::try_from(packet.size()) else {
            return false;
        };
        let header = AmsduSubframeHeader {
            destination: dest,
            source: src,
            length,
        };
        let mut bytes = [0u8; AMSDU_SUBFRAME_HEADER_SIZE];
        if header.serialize(&mut bytes).is_err() {
            return false;
        }
        aggregated.add_padding(padding);
        aggregated.add_at_end(&Packet::new(bytes.to_vec()));
        aggregated.add_at_end(packet);
        true
    }
}

/// Splits an A-MSDU payload back into its MSDUs.
pub fn deaggregate(payload: &[u8]) -> Result<Vec<(Packet, AmsduSubframeHeader)>, WifiMacError> {
    let mut msdus = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let (header, consumed) = AmsduSubframeHeader::deserialize(rest)?;
        let length = header.length as usize;
        let body = rest
            .get(consumed..consumed + length)
            .ok_or(WifiMacError::InvalidMsduLength(header.length))?;
        msdus.push((Packet::new(body.to_vec()), header));
        let skip = (consumed + length + padding_for(consumed + length)).min(rest.len());
        rest = &rest[skip..];
    }
    Ok(msdus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_subframe_header_is_big_endian() {
        let header = AmsduSubframeHeader {
            destination: Mac48Address::local(1),
            source: Mac48Address::local(2),
            length: 0x0102,
        };
        let mut buffer = [0u8; 14];
        assert_eq!(header.serialize(&mut buffer).unwrap(), 14);
        assert_eq!(&buffer[12..14], &[0x01, 0x02]);
        assert_eq!(AmsduSubframeHeader::deserialize(&buffer).unwrap(), (header, 14));
    }

    #[test]
    fn test_aggregate_pads_between_subframes() {
        let agg = MsduStandardAggregator::default();
        let mut amsdu = Packet::empty();
        let (sa, da) = (Mac48Address::local(1), Mac48Address::local(2));
        assert!(agg.aggregate(&Packet::new(vec![0xaa; 5]), &mut amsdu, sa, da));
        // First subframe: 14 + 5, no leading padding.
        assert_eq!(amsdu.size(), 19);
        assert!(agg.aggregate(&Packet::new(vec![0xbb; 3]), &mut amsdu, sa, da));
        // One padding byte brings 19 up to 20.
        assert_eq!(amsdu.size(), 20 + 14 + 3);

        let msdus = deaggregate(amsdu.data()).unwrap();
        assert_eq!(msdus.len(), 2);
        assert_eq!(msdus[0].0.data(), &[0xaa; 5]);
        assert_eq!(msdus[1].0.data(), &[0xbb; 3]);
        assert_eq!(msdus[1].1.source, sa);
        assert_eq!(msdus[1].1.destination, da);
    }

    #[test]
    fn test_aggregate_respects_max_size() {
        let agg = MsduStandardAggregator::new(40);
        let mut amsdu = Packet::empty();
        let a = Mac48Address::local(1);
        assert!(agg.aggregate(&Packet::new(vec![0; 20]), &mut amsdu, a, a));
        assert_eq!(amsdu.size(), 34);
        // 14 + 1 + 34 + 2 padding > 40.
        assert!(!agg.aggregate(&Packet::new(vec![0; 1]), &mut amsdu, a, a));
        assert_eq!(amsdu.size(), 34);
    }

    #[test]
    fn test_deaggregate_rejects_overlong_subframe() {
        let header = AmsduSubframeHeader {
            destination: Mac48Address::local(1),
            source: Mac48Address::local(2),
            length: 100,
        };
        let mut buffer = [0u8; 20];
        header.serialize(&mut buffer).unwrap();
        assert_eq!(deaggregate(&buffer), Err(WifiMacError::InvalidMsduLength(100)));
    }
}
