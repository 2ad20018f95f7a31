//! The MAC of one station, wired together.
//!
//! `WifiMac` owns one `DcfManager`, one `MacLow`, the remote station manager
//! and the transmit opportunities: a legacy `Txop` that also carries
//! management frames and, with QoS, one EDCA `Txop` per access category.
//! It is driven from outside: the host forwards PHY notifications and fired
//! [`MacTimer`]s, then collects [`MacEvent`]s with [`WifiMac::drain_events`].
//! Every entry point runs until no component has work left at the current
//! virtual instant.

pub mod config;

pub use config::MacConfig;

use crate::dcf::{DcfId, DcfListener, DcfManager};
use crate::frame::{
    Mac48Address, MsduStandardAggregator, Packet, WifiMacHeader, WifiMacType, deaggregate,
};
use crate::hal::{Phy, WifiMacError, WifiMode};
use crate::log::{LogContext, mac_debug, mac_error, mac_info, mac_warn};
use crate::low::{LowEnv, MacLow};
use crate::middle::{MacRxMiddle, MacTxMiddle};
use crate::sched::{MacTimer, Timers};
use crate::station::{ConstantRateStationManager, RemoteStationManager};
use crate::txop::{AccessCategory, TxOutcome, Txop, TxopContext};
use crate::types::Tid;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::convert::TryFrom;
use rand::SeedableRng;
use rand::rngs::SmallRng;

/// What the MAC reports to the layer above.
#[derive(Debug, Clone, PartialEq)]
pub enum MacEvent {
    /// A complete MSDU was received.
    ForwardUp {
        packet: Packet,
        from: Mac48Address,
        to: Mac48Address,
    },
    /// The last fragment of an MSDU was acknowledged.
    TxOk(WifiMacHeader),
    /// An MSDU was dropped after its retry limit.
    TxFailed(WifiMacHeader),
}

pub struct WifiMac {
    config: MacConfig,
    log: LogContext,
    dcf: DcfManager,
    low: MacLow,
    stations: Box<dyn RemoteStationManager>,
    tx_middle: MacTxMiddle,
    rx_middle: MacRxMiddle,
    rng: SmallRng,
    /// Index 0 is the legacy queue, then the EDCA queues from voice down.
    /// Each index equals the `DcfId` of the state it registered.
    txops: Vec<Txop>,
    events: VecDeque<MacEvent>,
}

/// Routes `DcfManager` notifications to the `Txop` that owns the state.
struct TxopDispatch<'a> {
    txops: &'a mut [Txop],
    low: &'a mut MacLow,
    phy: &'a mut dyn Phy,
    stations: &'a mut dyn RemoteStationManager,
    tx_middle: &'a mut MacTxMiddle,
    rng: &'a mut SmallRng,
}

impl TxopDispatch<'_> {
    /// Runs `f` on the `Txop` at `index`. Returns false if there is none.
    fn with_txop(
        &mut self,
        index: usize,
        dcf: &mut DcfManager,
        timers: &mut dyn Timers,
        f: impl FnOnce(&mut Txop, &mut TxopContext<'_>),
    ) -> bool {
        let Some(txop) = self.txops.get_mut(index) else {
            return false;
        };
        let mut ctx = TxopContext {
            low: &mut *self.low,
            phy: &mut *self.phy,
            stations: &mut *self.stations,
            dcf,
            timers,
            tx_middle: &mut *self.tx_middle,
            rng: &mut *self.rng,
        };
        f(txop, &mut ctx);
        true
    }
}

impl DcfListener for TxopDispatch<'_> {
    fn notify_access_granted(&mut self, id: DcfId, dcf: &mut DcfManager, timers: &mut dyn Timers) {
        self.with_txop(id.index(), dcf, timers, |txop, ctx| {
            txop.notify_access_granted(ctx)
        });
    }

    fn notify_internal_collision(
        &mut self,
        id: DcfId,
        dcf: &mut DcfManager,
        timers: &mut dyn Timers,
    ) {
        self.with_txop(id.index(), dcf, timers, |txop, ctx| {
            txop.notify_internal_collision(ctx)
        });
    }

    fn notify_collision(&mut self, id: DcfId, dcf: &mut DcfManager, timers: &mut dyn Timers) {
        self.with_txop(id.index(), dcf, timers, |txop, ctx| txop.notify_collision(ctx));
    }

    fn notify_channel_switching(
        &mut self,
        id: DcfId,
        _dcf: &mut DcfManager,
        _timers: &mut dyn Timers,
    ) {
        if let Some(txop) = self.txops.get_mut(id.index()) {
            txop.notify_channel_switching();
        }
    }

    fn notify_sleep(&mut self, id: DcfId, _dcf: &mut DcfManager, timers: &mut dyn Timers) {
        if let Some(txop) = self.txops.get_mut(id.index()) {
            txop.notify_sleep(timers.now_us());
        }
    }

    fn notify_wake_up(&mut self, id: DcfId, dcf: &mut DcfManager, timers: &mut dyn Timers) {
        self.with_txop(id.index(), dcf, timers, |txop, ctx| txop.notify_wake_up(ctx));
    }
}

impl WifiMac {
    /// Builds a MAC with a [`ConstantRateStationManager`].
    pub fn new(config: MacConfig, timers: &dyn Timers) -> Self {
        let stations = Box::new(ConstantRateStationManager::new(config.stations));
        Self::with_station_manager(config, stations, timers)
    }

    pub fn with_station_manager(
        config: MacConfig,
        stations: Box<dyn RemoteStationManager>,
        timers: &dyn Timers,
    ) -> Self {
        let address = config.address;
        let mut dcf = DcfManager::new(config.dcf);
        let mut low = MacLow::new(config.low, address);
        low.set_bssid(config.bssid);
        if config.promisc {
            low.set_promisc();
        }

        // Registration order decides internal collisions: legacy first,
        // then voice down to background.
        let mut txops = Vec::with_capacity(5);
        txops.push(Txop::new(
            &mut dcf,
            &config.txop,
            address,
            config.type_of_station,
        ));
        if config.qos_supported {
            for ac in AccessCategory::BY_PRIORITY {
                let mut txop = Txop::new_qos(
                    &mut dcf,
                    config.edca_for(ac),
                    ac,
                    address,
                    config.type_of_station,
                );
                if config.max_msdu_aggregate_size > 0 {
                    txop.set_msdu_aggregator(Box::new(MsduStandardAggregator::new(
                        config.max_msdu_aggregate_size,
                    )));
                }
                txops.push(txop);
            }
        }

        let mut rng = SmallRng::seed_from_u64(config.rng_seed);
        let now = timers.now_us();
        for txop in &mut txops {
            txop.initialize(&mut dcf, &mut rng, now);
        }

        let log = LogContext::new("mac", address);
        mac_info!(
            log,
            "created {:?} station, qos={}, {} queue(s)",
            config.type_of_station,
            config.qos_supported,
            txops.len()
        );

        Self {
            rx_middle: MacRxMiddle::new(config.rx_reassembly_timeout_us),
            config,
            log,
            dcf,
            low,
            stations,
            tx_middle: MacTxMiddle::new(),
            rng,
            txops,
            events: VecDeque::new(),
        }
    }

    // --- Accessors ---

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    pub fn address(&self) -> Mac48Address {
        self.config.address
    }

    pub fn bssid(&self) -> Mac48Address {
        self.low.bssid()
    }

    pub fn set_bssid(&mut self, bssid: Mac48Address) {
        self.config.bssid = bssid;
        self.low.set_bssid(bssid);
    }

    pub fn dcf(&self) -> &DcfManager {
        &self.dcf
    }

    pub fn low(&self) -> &MacLow {
        &self.low
    }

    pub fn stations(&self) -> &dyn RemoteStationManager {
        &*self.stations
    }

    pub fn txops(&self) -> &[Txop] {
        &self.txops
    }

    /// The legacy queue for `None`, the EDCA queue of `ac` otherwise.
    pub fn txop(&self, ac: Option<AccessCategory>) -> Option<&Txop> {
        self.txops.iter().find(|t| t.access_category() == ac)
    }

    pub fn txop_mut(&mut self, ac: Option<AccessCategory>) -> Option<&mut Txop> {
        self.txops.iter_mut().find(|t| t.access_category() == ac)
    }

    /// Frames waiting in every queue, excluding those in flight.
    pub fn queued(&mut self, now_us: u64) -> usize {
        self.txops.iter_mut().map(|t| t.queue_len(now_us)).sum()
    }

    /// Events produced since the last call.
    pub fn drain_events(&mut self) -> VecDeque<MacEvent> {
        core::mem::take(&mut self.events)
    }

    // --- Upper layer ---

    /// Queues an MSDU for `to`. With QoS the frame goes to the access
    /// category of `tid`; without, `tid` is only validated.
    pub fn enqueue(
        &mut self,
        phy: &mut dyn Phy,
        timers: &mut dyn Timers,
        packet: Packet,
        to: Mac48Address,
        tid: u8,
    ) -> Result<(), WifiMacError> {
        let tid = Tid::try_from(tid)?;
        let mut hdr = if self.config.qos_supported {
            let mut hdr = WifiMacHeader::new(WifiMacType::QosData);
            hdr.set_qos_tid(tid);
            hdr
        } else {
            WifiMacHeader::new(WifiMacType::Data)
        };
        hdr.addr1 = to;
        hdr.addr2 = self.address();
        hdr.addr3 = self.low.bssid();
        self.enqueue_header(phy, timers, packet, hdr)
    }

    /// Queues a frame whose header was built by the caller. Management frames
    /// and non-QoS data use the legacy queue.
    pub fn enqueue_header(
        &mut self,
        phy: &mut dyn Phy,
        timers: &mut dyn Timers,
        packet: Packet,
        hdr: WifiMacHeader,
    ) -> Result<(), WifiMacError> {
        if hdr.is_ctl() {
            mac_warn!(self.log, "Refusing to queue control frame {:?}", hdr.kind);
            return Err(WifiMacError::UnsupportedFrame);
        }
        let index = self.txop_index_for(&hdr);
        let (dcf, mut dispatch) = self.split(phy);
        let mut result = Ok(());
        dispatch.with_txop(index, dcf, timers, |txop, ctx| {
            result = txop.queue(ctx, packet, hdr);
        });
        self.settle(phy, timers);
        result
    }

    fn txop_index_for(&self, hdr: &WifiMacHeader) -> usize {
        if !self.config.qos_supported || !hdr.is_qos_data() {
            return 0;
        }
        let ac = AccessCategory::from_tid(hdr.qos_tid());
        self.txops
            .iter()
            .position(|t| t.access_category() == Some(ac))
            .unwrap_or(0)
    }

    // --- Scheduler ---

    /// Handler of every [`MacTimer`] this MAC scheduled.
    pub fn handle_timer(&mut self, phy: &mut dyn Phy, timers: &mut dyn Timers, timer: MacTimer) {
        match timer {
            MacTimer::AccessTimeout => {
                let (dcf, mut dispatch) = self.split(phy);
                dcf.access_timeout(timers, &mut dispatch);
            }
            other => self.with_low(phy, timers, |low, env| low.handle_timer(env, other)),
        }
        self.settle(phy, timers);
    }

    // --- PHY notifications ---

    pub fn notify_rx_start(&mut self, timers: &dyn Timers, duration_us: u64) {
        self.dcf.notify_rx_start_now(timers.now_us(), duration_us);
    }

    /// A PSDU (header, body and FCS) was received without error.
    pub fn receive_ok(
        &mut self,
        phy: &mut dyn Phy,
        timers: &mut dyn Timers,
        psdu: &[u8],
        rx_snr: f64,
        mode: WifiMode,
    ) {
        self.dcf.notify_rx_end_ok_now(timers.now_us());
        self.with_low(phy, timers, |low, env| low.receive_ok(env, psdu, rx_snr, mode));
        self.settle(phy, timers);
    }

    pub fn receive_error(&mut self, phy: &mut dyn Phy, timers: &mut dyn Timers) {
        self.dcf.notify_rx_end_error_now(timers.now_us());
        self.with_low(phy, timers, |low, env| low.receive_error(env));
        self.settle(phy, timers);
    }

    pub fn notify_maybe_cca_busy_start(&mut self, timers: &dyn Timers, duration_us: u64) {
        self.dcf
            .notify_maybe_cca_busy_start_now(timers.now_us(), duration_us);
    }

    /// The PHY leaves the channel. Queued frames and the exchange in
    /// progress are dropped.
    pub fn notify_switching_start(
        &mut self,
        phy: &mut dyn Phy,
        timers: &mut dyn Timers,
        duration_us: u64,
    ) {
        mac_info!(self.log, "channel switch for {}us", duration_us);
        let (dcf, mut dispatch) = self.split(phy);
        dcf.notify_switching_start_now(timers, &mut dispatch, duration_us);
        self.with_low(phy, timers, |low, env| {
            low.notify_switching_start_now(env, duration_us)
        });
        self.settle(phy, timers);
    }

    /// Stops contending. Frames in flight go back to the head of their queue.
    pub fn notify_sleep(&mut self, phy: &mut dyn Phy, timers: &mut dyn Timers) {
        mac_info!(self.log, "going to sleep");
        let (dcf, mut dispatch) = self.split(phy);
        dcf.notify_sleep_now(timers, &mut dispatch);
        self.with_low(phy, timers, |low, env| low.notify_sleep_now(env));
        self.settle(phy, timers);
    }

    pub fn notify_wakeup(&mut self, phy: &mut dyn Phy, timers: &mut dyn Timers) {
        mac_info!(self.log, "waking up");
        let (dcf, mut dispatch) = self.split(phy);
        dcf.notify_wakeup_now(timers, &mut dispatch);
        self.settle(phy, timers);
    }

    // --- Internals ---

    fn split<'a>(&'a mut self, phy: &'a mut dyn Phy) -> (&'a mut DcfManager, TxopDispatch<'a>) {
        (
            &mut self.dcf,
            TxopDispatch {
                txops: &mut self.txops,
                low: &mut self.low,
                phy,
                stations: &mut *self.stations,
                tx_middle: &mut self.tx_middle,
                rng: &mut self.rng,
            },
        )
    }

    fn with_low(
        &mut self,
        phy: &mut dyn Phy,
        timers: &mut dyn Timers,
        f: impl FnOnce(&mut MacLow, &mut LowEnv<'_>),
    ) {
        let mut env = LowEnv {
            phy,
            stations: &mut *self.stations,
            dcf: &mut self.dcf,
            timers,
        };
        f(&mut self.low, &mut env);
    }

    /// Delivers `MacLow` outcomes and pending access requests until nothing
    /// is left to do at this instant, then reports what completed.
    fn settle(&mut self, phy: &mut dyn Phy, timers: &mut dyn Timers) {
        let log = self.log;
        let (dcf, mut dispatch) = self.split(phy);
        loop {
            let mut progressed = false;

            for (id, event) in dispatch.low.take_events() {
                progressed = true;
                if !dispatch.with_txop(id.0, dcf, timers, |txop, ctx| {
                    txop.handle_tx_event(ctx, event)
                }) {
                    mac_error!(log, "{:?} for unknown txop {}", event, id.0);
                }
            }

            for index in 0..dispatch.txops.len() {
                let txop = &mut dispatch.txops[index];
                if !txop.take_access_request() {
                    continue;
                }
                let id = txop.dcf_id();
                if dcf.state(id).is_access_requested() {
                    continue;
                }
                progressed = true;
                dcf.request_access(id, timers, &mut dispatch);
            }

            if !progressed {
                break;
            }
        }

        for txop in &mut self.txops {
            for outcome in txop.take_outcomes() {
                self.events.push_back(match outcome {
                    TxOutcome::Acked(hdr) => MacEvent::TxOk(hdr),
                    TxOutcome::Failed(hdr) => MacEvent::TxFailed(hdr),
                });
            }
        }
        self.forward_received(timers.now_us());
    }

    fn forward_received(&mut self, now_us: u64) {
        for (packet, hdr) in self.low.take_received() {
            let Some((packet, hdr)) = self.rx_middle.receive(packet, hdr, now_us) else {
                continue;
            };
            if !hdr.is_data() {
                mac_debug!(self.log, "ignoring {:?} from {}", hdr.kind, hdr.addr2);
                continue;
            }
            if hdr.is_null_data() {
                mac_debug!(self.log, "null data from {}", hdr.addr2);
                continue;
            }
            if hdr.is_qos_amsdu() {
                self.forward_amsdu(&packet, &hdr);
                continue;
            }
            let from = if hdr.from_ds { hdr.addr3 } else { hdr.addr2 };
            let to = if hdr.to_ds { hdr.addr3 } else { hdr.addr1 };
            self.events.push_back(MacEvent::ForwardUp { packet, from, to });
        }
    }

    fn forward_amsdu(&mut self, packet: &Packet, hdr: &WifiMacHeader) {
        match deaggregate(packet.data()) {
            Ok(msdus) => {
                mac_debug!(self.log, "A-MSDU of {} MSDUs from {}", msdus.len(), hdr.addr2);
                for (msdu, sub) in msdus {
                    self.events.push_back(MacEvent::ForwardUp {
                        packet: msdu,
                        from: sub.source,
                        to: sub.destination,
                    });
                }
            }
            Err(e) => mac_warn!(self.log, "Dropping malformed A-MSDU from {}: {}", hdr.addr2, e),
        }
    }
}
