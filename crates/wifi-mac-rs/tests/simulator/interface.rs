// crates/wifi-mac-rs/tests/simulator/interface.rs
use wifi_mac_rs::hal::{Phy, WifiMode, ofdm_tx_duration_us};

/// A simulated PHY. Transmissions are buffered until the channel picks them
/// up; reception state is driven by the channel.
pub struct SimulatedPhy {
    pub(super) now_us: u64,
    pub(super) tx_end_us: u64,
    /// Id of the reception in progress, if any.
    pub(super) rx: Option<u64>,
    /// The reception in progress overlapped another signal.
    pub(super) rx_corrupted: bool,
    pub(super) last_rx_start_us: u64,
    outbox: Vec<(Vec<u8>, WifiMode)>,
}

impl SimulatedPhy {
    pub fn new() -> Self {
        Self {
            now_us: 0,
            tx_end_us: 0,
            rx: None,
            rx_corrupted: false,
            last_rx_start_us: 0,
            outbox: Vec::new(),
        }
    }

    pub fn is_transmitting(&self) -> bool {
        self.now_us < self.tx_end_us
    }

    /// Extracts all PSDUs handed down since the last call.
    pub fn take_tx_frames(&mut self) -> Vec<(Vec<u8>, WifiMode)> {
        self.outbox.drain(..).collect()
    }
}

impl Phy for SimulatedPhy {
    fn send_packet(&mut self, psdu: Vec<u8>, mode: WifiMode) {
        self.outbox.push((psdu, mode));
    }

    fn calculate_tx_duration_us(&self, size: usize, mode: WifiMode) -> u64 {
        ofdm_tx_duration_us(size, mode)
    }

    fn is_state_idle(&self) -> bool {
        !self.is_transmitting() && self.rx.is_none()
    }

    fn last_rx_start_us(&self) -> u64 {
        self.last_rx_start_us
    }
}
