pub mod address;
pub mod amsdu;
pub mod codec;
pub mod header;
pub mod packet;

pub use address::Mac48Address;
pub use amsdu::{
    AMSDU_SUBFRAME_HEADER_SIZE, AmsduSubframeHeader, DEFAULT_MAX_AMSDU_SIZE, MsduAggregator,
    MsduStandardAggregator, deaggregate,
};
pub use codec::Codec;
pub use header::{QosAckPolicy, QosControl, WifiMacHeader, WifiMacType, decode_mpdu, encode_mpdu};
pub use packet::Packet;
