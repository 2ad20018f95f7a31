use core::convert::TryFrom;
use core::fmt;

// --- Frame size constants (IEEE 802.11-2012, 8.3) ---

/// Size of the frame check sequence appended to every MPDU.
pub const FCS_SIZE: usize = 4;
/// MAC header of an ACK or CTS frame (frame control, duration, RA).
pub const ACK_CTS_HEADER_SIZE: usize = 10;
/// MAC header of an RTS frame (frame control, duration, RA, TA).
pub const RTS_HEADER_SIZE: usize = 16;
/// Complete ACK MPDU on the air.
pub const ACK_SIZE: usize = ACK_CTS_HEADER_SIZE + FCS_SIZE;
/// Complete CTS MPDU on the air.
pub const CTS_SIZE: usize = ACK_CTS_HEADER_SIZE + FCS_SIZE;
/// Complete RTS MPDU on the air.
pub const RTS_SIZE: usize = RTS_HEADER_SIZE + FCS_SIZE;

/// Sequence numbers live in a 12-bit space.
pub const SEQUENCE_NUMBER_SPACE: u16 = 4096;
/// Number of distinct traffic identifiers carried in the QoS control field.
pub const NUM_TIDS: usize = 16;
/// Fragment numbers live in a 4-bit space.
pub const MAX_FRAGMENTS: usize = 16;

/// Represents a QoS Traffic Identifier, wrapping a `u8` to ensure type safety.
///
/// Valid TIDs are 0-15. Values 0-7 are user priorities mapped onto the four
/// EDCA access categories; 8-15 are reserved for traffic streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tid(u8);

impl Tid {
    pub const fn value(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Error type for invalid TID creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TidError {
    /// TID is outside the valid range (0-15).
    InvalidRange(u8),
}

impl fmt::Display for TidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TidError::InvalidRange(v) => write!(f, "TID {v} is outside 0..=15"),
        }
    }
}

impl TryFrom<u8> for Tid {
    type Error = TidError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (value as usize) < NUM_TIDS {
            Ok(Tid(value))
        } else {
            Err(TidError::InvalidRange(value))
        }
    }
}

impl From<Tid> for u8 {
    fn from(tid: Tid) -> Self {
        tid.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid{}", self.0)
    }
}

/// The role of the MAC in its BSS. Decides which header address carries the
/// original source and final destination of an MSDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TypeOfStation {
    Sta,
    Ap,
    #[default]
    AdhocSta,
    Mesh,
}
