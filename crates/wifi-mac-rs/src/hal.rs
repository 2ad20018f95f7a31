use crate::types::TidError;
use alloc::vec::Vec;
use core::array::TryFromSliceError;
use core::fmt;

/// Defines a portable, descriptive Error type for the 802.11 MAC core.
///
/// Wireless failures (collisions, missed CTS/ACK) are never reported through
/// this type. They are part of normal operation and are resolved by the
/// retry machinery in `Txop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiMacError {
    /// The provided buffer is too small for the operation.
    BufferTooShort,
    /// The frame control field carries a type/subtype combination we do not know.
    InvalidFrameType(u8),
    /// A traffic identifier outside 0..=15.
    InvalidTid(u8),
    /// A value that is not a valid access category index.
    InvalidAccessCategory(u8),
    /// An A-MSDU subframe announces more bytes than the buffer holds.
    InvalidMsduLength(u16),
    /// The frame cannot be handled by this MAC (e.g. a control frame handed to the upper layer).
    UnsupportedFrame,
    /// The transmit queue is at its configured capacity; the frame was dropped.
    QueueFull,
    /// A multi-byte value could not be parsed from a slice.
    SliceConversion,
}

impl fmt::Display for WifiMacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooShort => write!(f, "Buffer is too short for the frame"),
            Self::InvalidFrameType(v) => write!(f, "Invalid frame type/subtype: {v:#04x}"),
            Self::InvalidTid(v) => write!(f, "Invalid TID value: {v}"),
            Self::InvalidAccessCategory(v) => write!(f, "Invalid access category: {v}"),
            Self::InvalidMsduLength(v) => write!(f, "A-MSDU subframe length {v} exceeds the buffer"),
            Self::UnsupportedFrame => write!(f, "Frame kind is not supported here"),
            Self::QueueFull => write!(f, "Transmit queue is full"),
            Self::SliceConversion => write!(f, "Failed to convert slice to a fixed-size array"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for WifiMacError {}

// --- From Implementations for Error Conversion ---

impl From<TryFromSliceError> for WifiMacError {
    fn from(_: TryFromSliceError) -> Self {
        WifiMacError::SliceConversion
    }
}

impl From<TidError> for WifiMacError {
    fn from(err: TidError) -> Self {
        match err {
            TidError::InvalidRange(val) => WifiMacError::InvalidTid(val),
        }
    }
}

// --- Transmission modes ---

/// A PHY transmission mode, reduced to what the MAC needs: its bit rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WifiMode {
    pub data_rate_kbps: u32,
}

impl WifiMode {
    pub const fn from_mbps(mbps: u32) -> Self {
        WifiMode { data_rate_kbps: mbps * 1000 }
    }

    /// 802.11a OFDM, 6 Mb/s. The mandatory basic rate for control responses.
    pub const OFDM_6MBPS: WifiMode = WifiMode::from_mbps(6);
    pub const OFDM_12MBPS: WifiMode = WifiMode::from_mbps(12);
    pub const OFDM_24MBPS: WifiMode = WifiMode::from_mbps(24);
    pub const OFDM_54MBPS: WifiMode = WifiMode::from_mbps(54);
}

impl Default for WifiMode {
    fn default() -> Self {
        WifiMode::OFDM_6MBPS
    }
}

impl fmt::Display for WifiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}kbps", self.data_rate_kbps)
    }
}

/// Air time of a PSDU of `size` bytes with the 802.11a OFDM PHY (20 MHz channel).
///
/// 16us preamble + 4us SIGNAL, then 4us symbols carrying SERVICE (16 bits),
/// the PSDU and the 6 tail bits.
pub fn ofdm_tx_duration_us(size: usize, mode: WifiMode) -> u64 {
    let bits_per_symbol = (mode.data_rate_kbps as u64 * 4) / 1000;
    if bits_per_symbol == 0 {
        return 0;
    }
    let payload_bits = 16 + 8 * size as u64 + 6;
    let symbols = payload_bits.div_ceil(bits_per_symbol);
    16 + 4 + symbols * 4
}

/// Hardware Abstraction Layer (HAL) for the physical layer.
///
/// The MAC core never models modulation or propagation. It hands fully
/// built PSDUs (MAC header, payload and FCS) down, asks how long they take on
/// the air, and samples the CCA state when a fast-ack decision needs it. The
/// PHY reports receptions back through `WifiMac::notify_rx_start`,
/// `WifiMac::receive_ok` and `WifiMac::receive_error`.
pub trait Phy {
    /// Starts transmitting `psdu` now with the given mode.
    fn send_packet(&mut self, psdu: Vec<u8>, mode: WifiMode);

    /// Returns the air time, in microseconds, of a PSDU of `size` bytes.
    fn calculate_tx_duration_us(&self, size: usize, mode: WifiMode) -> u64;

    /// Returns true when the PHY is neither transmitting, receiving nor sensing energy.
    fn is_state_idle(&self) -> bool;

    /// Returns the virtual time of the most recent PHY-RXSTART.
    fn last_rx_start_us(&self) -> u64;
}
