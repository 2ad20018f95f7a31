use crate::dcf::DcfConfig;
use crate::frame::Mac48Address;
use crate::low::MacLowConfig;
use crate::station::StationManagerConfig;
use crate::txop::{AccessCategory, TxopConfig};
use crate::types::TypeOfStation;

/// Everything needed to build a [`super::WifiMac`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MacConfig {
    pub address: Mac48Address,
    pub bssid: Mac48Address,
    pub type_of_station: TypeOfStation,
    /// Adds one EDCA queue per access category next to the legacy one.
    pub qos_supported: bool,
    pub dcf: DcfConfig,
    pub low: MacLowConfig,
    pub stations: StationManagerConfig,
    /// Legacy DCF queue. Carries management frames, and data when QoS is off.
    pub txop: TxopConfig,
    /// Indexed by [`AccessCategory::index`].
    pub edca: [TxopConfig; 4],
    /// Largest A-MSDU built by the EDCA queues. 0 disables aggregation.
    pub max_msdu_aggregate_size: usize,
    /// 0 keeps partial MSDUs until their last fragment arrives.
    pub rx_reassembly_timeout_us: u64,
    /// Seed of the backoff generator.
    pub rng_seed: u64,
    /// Forward data frames addressed to other stations too.
    pub promisc: bool,
}

impl MacConfig {
    /// An ad-hoc station on an 802.11a (OFDM, 20 MHz) channel with the
    /// default EDCA parameter set.
    pub fn ofdm_a(address: Mac48Address) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn edca_for(&self, ac: AccessCategory) -> &TxopConfig {
        &self.edca[ac.index()]
    }

    pub fn edca_for_mut(&mut self, ac: AccessCategory) -> &mut TxopConfig {
        &mut self.edca[ac.index()]
    }
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            address: Mac48Address::default(),
            bssid: Mac48Address::default(),
            type_of_station: TypeOfStation::default(),
            qos_supported: false,
            dcf: DcfConfig::default(),
            low: MacLowConfig::default(),
            stations: StationManagerConfig::default(),
            txop: TxopConfig::default(),
            edca: [
                TxopConfig::for_ac(AccessCategory::BestEffort),
                TxopConfig::for_ac(AccessCategory::Background),
                TxopConfig::for_ac(AccessCategory::Video),
                TxopConfig::for_ac(AccessCategory::Voice),
            ],
            max_msdu_aggregate_size: 0,
            rx_reassembly_timeout_us: 0,
            rng_seed: 1,
            promisc: false,
        }
    }
}
