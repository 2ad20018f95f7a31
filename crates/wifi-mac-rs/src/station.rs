//! Per-destination transmit policy: rates, RTS and fragmentation thresholds,
//! and the short/long retry counters behind retransmission decisions.

use crate::frame::{Mac48Address, Packet, WifiMacHeader};
use crate::hal::WifiMode;
use crate::types::{FCS_SIZE, MAX_FRAGMENTS};
use alloc::collections::BTreeMap;
use log::warn;

/// Largest MPDU of the 802.11 MIB, also the default "off" value for both thresholds.
pub const DEFAULT_THRESHOLD: usize = 2346;
/// Smallest fragmentation threshold the MIB allows.
pub const MIN_FRAGMENTATION_THRESHOLD: usize = 256;

/// Policy decisions the core consults but does not own.
///
/// Every query takes the destination address; group addresses never need RTS
/// or fragmentation and have no retry state.
pub trait RemoteStationManager {
    /// Called once per MSDU before it is queued.
    fn prepare_for_queue(
        &mut self,
        _address: Mac48Address,
        _header: &WifiMacHeader,
        _packet: &Packet,
        _full_size: usize,
    ) {
    }

    fn data_mode(&self, address: Mac48Address, header: &WifiMacHeader, packet: &Packet) -> WifiMode;
    fn rts_mode(&self, address: Mac48Address, header: &WifiMacHeader) -> WifiMode;
    /// Mode of a CTS or ACK answering a frame sent with `req_mode`.
    fn control_answer_mode(&self, address: Mac48Address, req_mode: WifiMode) -> WifiMode;

    fn report_rts_failed(&mut self, address: Mac48Address, header: &WifiMacHeader);
    fn report_data_failed(&mut self, address: Mac48Address, header: &WifiMacHeader);
    fn report_rts_ok(
        &mut self,
        address: Mac48Address,
        header: &WifiMacHeader,
        cts_snr: f64,
        cts_mode: WifiMode,
        rts_snr: f64,
    );
    fn report_data_ok(
        &mut self,
        address: Mac48Address,
        header: &WifiMacHeader,
        ack_snr: f64,
        ack_mode: WifiMode,
        data_snr: f64,
    );
    fn report_final_rts_failed(&mut self, address: Mac48Address, header: &WifiMacHeader);
    fn report_final_data_failed(&mut self, address: Mac48Address, header: &WifiMacHeader);
    fn report_rx_ok(
        &mut self,
        _address: Mac48Address,
        _header: &WifiMacHeader,
        _rx_snr: f64,
        _tx_mode: WifiMode,
    ) {
    }

    fn need_rts(&self, address: Mac48Address, header: &WifiMacHeader, packet: &Packet) -> bool;
    fn need_rts_retransmission(
        &self,
        address: Mac48Address,
        header: &WifiMacHeader,
        packet: &Packet,
    ) -> bool;
    fn need_data_retransmission(
        &self,
        address: Mac48Address,
        header: &WifiMacHeader,
        packet: &Packet,
    ) -> bool;
    fn need_fragmentation(
        &self,
        address: Mac48Address,
        header: &WifiMacHeader,
        packet: &Packet,
    ) -> bool;

    /// Payload bytes carried by fragment `fragment_number`, 0 past the last one.
    fn fragment_size(&self, header: &WifiMacHeader, packet: &Packet, fragment_number: u8) -> usize;
    fn fragment_offset(&self, header: &WifiMacHeader, packet: &Packet, fragment_number: u8)
    -> usize;
    fn is_last_fragment(&self, header: &WifiMacHeader, packet: &Packet, fragment_number: u8)
    -> bool;

    /// Forgets all per-destination state, e.g. after a channel switch.
    fn reset(&mut self) {}
}

/// Static configuration of a [`ConstantRateStationManager`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StationManagerConfig {
    /// Mode of every unicast data and management frame.
    pub data_mode: WifiMode,
    /// Mode of RTS, CTS, ACK and group-addressed frames.
    pub control_mode: WifiMode,
    /// MPDUs larger than this are protected by RTS/CTS.
    pub rts_cts_threshold: usize,
    /// MPDUs larger than this are fragmented.
    pub fragmentation_threshold: usize,
    /// Station short retry limit (RTS attempts).
    pub max_ssrc: u32,
    /// Station long retry limit (data attempts).
    pub max_slrc: u32,
}

impl Default for StationManagerConfig {
    fn default() -> Self {
        Self {
            data_mode: WifiMode::OFDM_6MBPS,
            control_mode: WifiMode::OFDM_6MBPS,
            rts_cts_threshold: DEFAULT_THRESHOLD,
            fragmentation_threshold: DEFAULT_THRESHOLD,
            max_ssrc: 7,
            max_slrc: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RetryCounters {
    ssrc: u32,
    slrc: u32,
}

/// Uses the same mode for every destination and tracks SSRC/SLRC per destination.
#[derive(Debug, Clone)]
pub struct ConstantRateStationManager {
    config: StationManagerConfig,
    stations: BTreeMap<Mac48Address, RetryCounters>,
}

impl ConstantRateStationManager {
    pub fn new(config: StationManagerConfig) -> Self {
        let mut manager = Self {
            config,
            stations: BTreeMap::new(),
        };
        manager.set_fragmentation_threshold(config.fragmentation_threshold);
        manager
    }

    pub fn config(&self) -> &StationManagerConfig {
        &self.config
    }

    pub fn set_rts_cts_threshold(&mut self, threshold: usize) {
        self.config.rts_cts_threshold = threshold;
    }

    /// Clamped to at least 256 and rounded down to an even value.
    pub fn set_fragmentation_threshold(&mut self, threshold: usize) {
        let value = if threshold < MIN_FRAGMENTATION_THRESHOLD {
            warn!("Fragmentation threshold {threshold} is below 256, using 256");
            MIN_FRAGMENTATION_THRESHOLD
        } else if threshold % 2 != 0 {
            warn!(
                "Fragmentation threshold {threshold} is odd, using {}",
                threshold - 1
            );
            threshold - 1
        } else {
            threshold
        };
        self.config.fragmentation_threshold = value;
    }

    pub fn fragmentation_threshold(&self) -> usize {
        self.config.fragmentation_threshold
    }

    pub fn set_max_ssrc(&mut self, max: u32) {
        self.config.max_ssrc = max;
    }

    pub fn set_max_slrc(&mut self, max: u32) {
        self.config.max_slrc = max;
    }

    pub fn ssrc(&self, address: Mac48Address) -> u32 {
        self.stations.get(&address).map_or(0, |s| s.ssrc)
    }

    pub fn slrc(&self, address: Mac48Address) -> u32 {
        self.stations.get(&address).map_or(0, |s| s.slrc)
    }

    fn counters(&mut self, address: Mac48Address) -> &mut RetryCounters {
        debug_assert!(!address.is_group());
        self.stations.entry(address).or_default()
    }

    /// Payload bytes one fragment can carry once header and FCS are accounted for.
    /// Grows past the threshold when the MSDU would otherwise need more than
    /// [`MAX_FRAGMENTS`] fragments.
    fn fragment_capacity(&self, header: &WifiMacHeader, packet: &Packet) -> usize {
        self.config
            .fragmentation_threshold
            .saturating_sub(header.size() + FCS_SIZE)
            .max(packet.size().div_ceil(MAX_FRAGMENTS))
            .max(1)
    }

    fn fragment_count(&self, header: &WifiMacHeader, packet: &Packet) -> usize {
        packet.size().div_ceil(self.fragment_capacity(header, packet))
    }
}

impl Default for ConstantRateStationManager {
    fn default() -> Self {
        Self::new(StationManagerConfig::default())
    }
}

impl RemoteStationManager for ConstantRateStationManager {
    fn data_mode(&self, address: Mac48Address, _header: &WifiMacHeader, _packet: &Packet) -> WifiMode {
        if address.is_group() {
            self.config.control_mode
        } else {
            self.config.data_mode
        }
    }

    fn rts_mode(&self, _address: Mac48Address, _header: &WifiMacHeader) -> WifiMode {
        self.config.control_mode
    }

    fn reset(&mut self) {
        self.stations.clear();
    }

    fn control_answer_mode(&self, _address: Mac48Address, req_mode: WifiMode) -> WifiMode {
        // The basic rate set holds only the control mode.
        self.config.control_mode.min(req_mode)
    }

    fn report_rts_failed(&mut self, address: Mac48Address, _header: &WifiMacHeader) {
        self.counters(address).ssrc += 1;
    }

    fn report_data_failed(&mut self, address: Mac48Address, _header: &WifiMacHeader) {
        self.counters(address).slrc += 1;
    }

    fn report_rts_ok(
        &mut self,
        address: Mac48Address,
        _header: &WifiMacHeader,
        _cts_snr: f64,
        _cts_mode: WifiMode,
        _rts_snr: f64,
    ) {
        self.counters(address).ssrc = 0;
    }

    fn report_data_ok(
        &mut self,
        address: Mac48Address,
        _header: &WifiMacHeader,
        _ack_snr: f64,
        _ack_mode: WifiMode,
        _data_snr: f64,
    ) {
        self.counters(address).slrc = 0;
    }

    fn report_final_rts_failed(&mut self, address: Mac48Address, _header: &WifiMacHeader) {
        self.counters(address).ssrc = 0;
    }

    fn report_final_data_failed(&mut self, address: Mac48Address, _header: &WifiMacHeader) {
        self.counters(address).slrc = 0;
    }

    fn need_rts(&self, address: Mac48Address, header: &WifiMacHeader, packet: &Packet) -> bool {
        if address.is_group() {
            return false;
        }
        packet.size() + header.size() + FCS_SIZE > self.config.rts_cts_threshold
    }

    fn need_rts_retransmission(
        &self,
        address: Mac48Address,
        _header: &WifiMacHeader,
        _packet: &Packet,
    ) -> bool {
        self.ssrc(address) < self.config.max_ssrc
    }

    fn need_data_retransmission(
        &self,
        address: Mac48Address,
        _header: &WifiMacHeader,
        _packet: &Packet,
    ) -> bool {
        self.slrc(address) < self.config.max_slrc
    }

    fn need_fragmentation(
        &self,
        address: Mac48Address,
        header: &WifiMacHeader,
        packet: &Packet,
    ) -> bool {
        if address.is_group() {
            return false;
        }
        packet.size() + header.size() + FCS_SIZE > self.config.fragmentation_threshold
    }

    fn fragment_size(&self, header: &WifiMacHeader, packet: &Packet, fragment_number: u8) -> usize {
        let count = self.fragment_count(header, packet);
        let n = fragment_number as usize;
        let capacity = self.fragment_capacity(header, packet);
        if n >= count {
            0
        } else if n + 1 == count {
            packet.size() - n * capacity
        } else {
            capacity
        }
    }

    fn fragment_offset(
        &self,
        header: &WifiMacHeader,
        packet: &Packet,
        fragment_number: u8,
    ) -> usize {
        fragment_number as usize * self.fragment_capacity(header, packet)
    }

    fn is_last_fragment(
        &self,
        header: &WifiMacHeader,
        packet: &Packet,
        fragment_number: u8,
    ) -> bool {
        fragment_number as usize + 1 >= self.fragment_count(header, packet)
    }
}
