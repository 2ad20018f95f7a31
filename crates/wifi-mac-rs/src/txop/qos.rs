//! EDCA access categories and the QoS-only steps of a transmit opportunity.

use super::{Txop, TxopContext};
use crate::frame::{Mac48Address, Packet, WifiMacHeader};
use crate::hal::WifiMacError;
use crate::queue::AddressType;
use crate::types::{Tid, TypeOfStation};
use core::convert::TryFrom;
use core::fmt;
use log::debug;

/// EDCA access category. (IEEE 802.11-2012, Section 9.2.4.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AccessCategory {
    BestEffort = 0,
    Background = 1,
    Video = 2,
    Voice = 3,
}

impl AccessCategory {
    /// Highest priority first: the order in which a MAC registers its queues
    /// with the `DcfManager`, so that internal collisions favour voice.
    pub const BY_PRIORITY: [AccessCategory; 4] = [
        AccessCategory::Voice,
        AccessCategory::Video,
        AccessCategory::BestEffort,
        AccessCategory::Background,
    ];

    /// User priority to access category. (IEEE 802.11-2012, Table 9-1)
    pub fn from_tid(tid: Tid) -> Self {
        match tid.value() {
            1 | 2 => AccessCategory::Background,
            4 | 5 => AccessCategory::Video,
            6 | 7 => AccessCategory::Voice,
            // 0, 3 and the traffic-stream TIDs.
            _ => AccessCategory::BestEffort,
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            AccessCategory::BestEffort => "edca-be",
            AccessCategory::Background => "edca-bk",
            AccessCategory::Video => "edca-vi",
            AccessCategory::Voice => "edca-vo",
        }
    }
}

impl TryFrom<u8> for AccessCategory {
    type Error = WifiMacError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AccessCategory::BestEffort),
            1 => Ok(AccessCategory::Background),
            2 => Ok(AccessCategory::Video),
            3 => Ok(AccessCategory::Voice),
            _ => Err(WifiMacError::InvalidAccessCategory(value)),
        }
    }
}

impl fmt::Display for AccessCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessCategory::BestEffort => "AC_BE",
            AccessCategory::Background => "AC_BK",
            AccessCategory::Video => "AC_VI",
            AccessCategory::Voice => "AC_VO",
        };
        f.write_str(name)
    }
}

/// Contention parameters of one access category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EdcaParams {
    pub aifsn: u32,
    pub cw_min: u32,
    pub cw_max: u32,
}

impl EdcaParams {
    /// Default EDCA parameter set for an OFDM PHY with aCWmin 15, aCWmax 1023.
    /// (IEEE 802.11-2012, Table 8-105)
    pub const fn for_ac(ac: AccessCategory) -> Self {
        match ac {
            AccessCategory::Background => EdcaParams { aifsn: 7, cw_min: 15, cw_max: 1023 },
            AccessCategory::BestEffort => EdcaParams { aifsn: 3, cw_min: 15, cw_max: 1023 },
            AccessCategory::Video => EdcaParams { aifsn: 2, cw_min: 7, cw_max: 15 },
            AccessCategory::Voice => EdcaParams { aifsn: 2, cw_min: 3, cw_max: 7 },
        }
    }
}

/// Address an A-MSDU subframe names as its source.
pub fn map_src_address(hdr: &WifiMacHeader, type_of_station: TypeOfStation) -> Mac48Address {
    match type_of_station {
        TypeOfStation::Sta | TypeOfStation::AdhocSta => hdr.addr2,
        TypeOfStation::Ap | TypeOfStation::Mesh => hdr.addr3,
    }
}

/// Address an A-MSDU subframe names as its destination.
pub fn map_dest_address(hdr: &WifiMacHeader, type_of_station: TypeOfStation) -> Mac48Address {
    match type_of_station {
        TypeOfStation::Ap | TypeOfStation::AdhocSta => hdr.addr1,
        TypeOfStation::Sta | TypeOfStation::Mesh => hdr.addr3,
    }
}

impl Txop {
    /// Packs queued MSDUs for the same receiver and TID behind the current one.
    ///
    /// Only unicast QoS data that is not a retransmission is aggregated, and
    /// an A-MSDU kept after a failed RTS is sent again as it stands.
    /// Aggregation stops at the first MSDU that does not fit.
    pub(super) fn aggregate_msdus(&mut self, ctx: &mut TxopContext<'_>) {
        let Some(aggregator) = self.aggregator.as_deref() else {
            return;
        };
        let Some(current) = self.current_packet.as_ref() else {
            return;
        };
        let hdr = &self.current_hdr;
        if !hdr.is_qos_data() || hdr.addr1.is_group() || hdr.retry || hdr.is_qos_amsdu() {
            return;
        }
        let now = ctx.timers.now_us();
        let tid = hdr.qos_tid();
        let receiver = hdr.addr1;

        let mut aggregated = Packet::empty();
        let src = map_src_address(hdr, self.type_of_station);
        let dest = map_dest_address(hdr, self.type_of_station);
        if !aggregator.aggregate(current, &mut aggregated, src, dest) {
            return;
        }

        let mut count = 1;
        loop {
            let taken = {
                let Some((packet, peeked, _)) =
                    self.queue
                        .peek_by_tid_and_address(tid, AddressType::Addr1, receiver, now)
                else {
                    break;
                };
                let src = map_src_address(peeked, self.type_of_station);
                let dest = map_dest_address(peeked, self.type_of_station);
                if !aggregator.aggregate(packet, &mut aggregated, src, dest) {
                    break;
                }
                packet.clone()
            };
            self.queue.remove(&taken);
            count += 1;
        }

        if count > 1 {
            debug!(
                "{}: aggregated {count} MSDUs for {receiver} ({} bytes)",
                self.name(),
                aggregated.size()
            );
            self.current_hdr.qos.amsdu_present = true;
            self.current_hdr.addr3 = ctx.low.bssid();
            self.current_packet = Some(aggregated);
        }
    }
}
