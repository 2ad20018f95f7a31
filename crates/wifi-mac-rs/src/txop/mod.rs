//! Transmit opportunities: one queue and one contention state each.
//!
//! A `Txop` owns a [`WifiMacQueue`] and a `DcfState` registered with the
//! `DcfManager`. When access is granted it dequeues a frame, assigns its
//! sequence number, decides on RTS and fragmentation and hands it to
//! `MacLow`. The outcome comes back as a [`TxEvent`], from which the `Txop`
//! applies the retry policy and the contention window rules.
//!
//! The QoS variant (one per access category) additionally aggregates MSDUs
//! into A-MSDUs and honours the QoS No-Ack policy.

pub mod qos;

pub use qos::{AccessCategory, EdcaParams, map_dest_address, map_src_address};

use crate::dcf::{DcfId, DcfManager, DcfState};
use crate::frame::{Mac48Address, MsduAggregator, Packet, WifiMacHeader, WifiMacType};
use crate::hal::{Phy, WifiMacError};
use crate::log::{LogContext, mac_debug, mac_error, mac_warn};
use crate::low::{LowEnv, MacLow, MacLowTransmissionParameters, TxEvent, TxopId};
use crate::middle::MacTxMiddle;
use crate::queue::{DEFAULT_MAX_QUEUE_DELAY_US, DEFAULT_MAX_QUEUE_SIZE, WifiMacQueue};
use crate::sched::Timers;
use crate::station::RemoteStationManager;
use crate::types::{FCS_SIZE, TypeOfStation};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use log::trace;
use rand::Rng;
use rand::rngs::SmallRng;

/// Contention and queueing parameters of one `Txop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TxopConfig {
    pub min_cw: u32,
    pub max_cw: u32,
    pub aifsn: u32,
    pub max_queue_size: usize,
    pub max_queue_delay_us: u64,
}

impl TxopConfig {
    /// Default EDCA parameters of `ac`.
    pub fn for_ac(ac: AccessCategory) -> Self {
        let params = EdcaParams::for_ac(ac);
        Self {
            min_cw: params.cw_min,
            max_cw: params.cw_max,
            aifsn: params.aifsn,
            ..Self::default()
        }
    }
}

impl Default for TxopConfig {
    /// Legacy DCF: DIFS = SIFS + 2 slots.
    fn default() -> Self {
        Self {
            min_cw: 15,
            max_cw: 1023,
            aifsn: 2,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            max_queue_delay_us: DEFAULT_MAX_QUEUE_DELAY_US,
        }
    }
}

/// Final result of one MSDU handed to a `Txop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    /// The last fragment was acknowledged.
    Acked(WifiMacHeader),
    /// The retry limit was reached.
    Failed(WifiMacHeader),
}

/// Everything a `Txop` needs besides itself while reacting to an event.
pub struct TxopContext<'a> {
    pub low: &'a mut MacLow,
    pub phy: &'a mut dyn Phy,
    pub stations: &'a mut dyn RemoteStationManager,
    pub dcf: &'a mut DcfManager,
    pub timers: &'a mut dyn Timers,
    pub tx_middle: &'a mut MacTxMiddle,
    pub rng: &'a mut SmallRng,
}

impl TxopContext<'_> {
    /// Splits off what `MacLow` needs to start a transmission.
    pub fn low_env(&mut self) -> (&mut MacLow, LowEnv<'_>) {
        (
            &mut *self.low,
            LowEnv {
                phy: &mut *self.phy,
                stations: &mut *self.stations,
                dcf: &mut *self.dcf,
                timers: &mut *self.timers,
            },
        )
    }
}

pub struct Txop {
    dcf_id: DcfId,
    /// `None` for the legacy (non-QoS) variant.
    ac: Option<AccessCategory>,
    type_of_station: TypeOfStation,
    log: LogContext,
    queue: WifiMacQueue,
    aggregator: Option<Box<dyn MsduAggregator>>,

    current_packet: Option<Packet>,
    current_hdr: WifiMacHeader,
    fragment_number: u8,

    access_wanted: bool,
    outcomes: VecDeque<TxOutcome>,
}

impl Txop {
    /// Creates a legacy DCF `Txop` and registers its contention state.
    pub fn new(
        dcf: &mut DcfManager,
        config: &TxopConfig,
        address: Mac48Address,
        type_of_station: TypeOfStation,
    ) -> Self {
        Self::register(dcf, config, None, address, type_of_station)
    }

    /// Creates the EDCA `Txop` of `ac` and registers its contention state.
    pub fn new_qos(
        dcf: &mut DcfManager,
        config: &TxopConfig,
        ac: AccessCategory,
        address: Mac48Address,
        type_of_station: TypeOfStation,
    ) -> Self {
        Self::register(dcf, config, Some(ac), address, type_of_station)
    }

    fn register(
        dcf: &mut DcfManager,
        config: &TxopConfig,
        ac: Option<AccessCategory>,
        address: Mac48Address,
        type_of_station: TypeOfStation,
    ) -> Self {
        let dcf_id = dcf.add(DcfState::new(config.aifsn, config.min_cw, config.max_cw));
        let component = ac.map_or("dca", AccessCategory::name);
        Self {
            dcf_id,
            ac,
            type_of_station,
            log: LogContext::new(component, address),
            queue: WifiMacQueue::new(config.max_queue_size, config.max_queue_delay_us),
            aggregator: None,
            current_packet: None,
            current_hdr: WifiMacHeader::new(WifiMacType::Data),
            fragment_number: 0,
            access_wanted: false,
            outcomes: VecDeque::new(),
        }
    }

    pub fn dcf_id(&self) -> DcfId {
        self.dcf_id
    }

    pub fn id(&self) -> TxopId {
        TxopId(self.dcf_id.index())
    }

    pub fn access_category(&self) -> Option<AccessCategory> {
        self.ac
    }

    pub fn is_qos(&self) -> bool {
        self.ac.is_some()
    }

    fn name(&self) -> &'static str {
        self.log.component
    }

    /// Enables A-MSDU aggregation. Ignored by the legacy variant.
    pub fn set_msdu_aggregator(&mut self, aggregator: Box<dyn MsduAggregator>) {
        self.aggregator = Some(aggregator);
    }

    pub fn set_min_cw(&self, dcf: &mut DcfManager, min_cw: u32) {
        dcf.state_mut(self.dcf_id).set_cw_min(min_cw);
    }

    pub fn set_max_cw(&self, dcf: &mut DcfManager, max_cw: u32) {
        dcf.state_mut(self.dcf_id).set_cw_max(max_cw);
    }

    pub fn set_aifsn(&self, dcf: &mut DcfManager, aifsn: u32) {
        dcf.state_mut(self.dcf_id).set_aifsn(aifsn);
    }

    pub fn set_max_queue_size(&mut self, max_size: usize) {
        self.queue.set_max_size(max_size);
    }

    pub fn set_max_queue_delay(&mut self, max_delay_us: u64) {
        self.queue.set_max_delay(max_delay_us);
    }

    pub fn queue_len(&mut self, now_us: u64) -> usize {
        self.queue.len(now_us)
    }

    pub fn has_current_packet(&self) -> bool {
        self.current_packet.is_some()
    }

    /// Returns true once if the `Txop` asked for channel access since the
    /// last call. The owner forwards the request to the `DcfManager`.
    pub fn take_access_request(&mut self) -> bool {
        core::mem::take(&mut self.access_wanted)
    }

    pub fn take_outcomes(&mut self) -> VecDeque<TxOutcome> {
        core::mem::take(&mut self.outcomes)
    }

    /// Resets the window and draws the first backoff.
    pub fn initialize(&mut self, dcf: &mut DcfManager, rng: &mut SmallRng, now_us: u64) {
        dcf.state_mut(self.dcf_id).reset_cw();
        self.draw_backoff(dcf, rng, now_us);
    }

    /// Starts a backoff of a uniform number of slots in `[0, cw]`.
    fn draw_backoff(&self, dcf: &mut DcfManager, rng: &mut SmallRng, now_us: u64) {
        let state = dcf.state_mut(self.dcf_id);
        let slots = rng.gen_range(0..=state.cw());
        trace!("{}: backoff of {slots} slots", self.name());
        state.start_backoff_now(slots, now_us);
    }

    fn start_backoff(&self, ctx: &mut TxopContext<'_>) {
        let now = ctx.timers.now_us();
        self.draw_backoff(ctx.dcf, ctx.rng, now);
    }

    fn reset_cw(&self, ctx: &mut TxopContext<'_>) {
        ctx.dcf.state_mut(self.dcf_id).reset_cw();
    }

    fn update_failed_cw(&self, ctx: &mut TxopContext<'_>) {
        ctx.dcf.state_mut(self.dcf_id).update_failed_cw();
    }

    /// Queues an MSDU for transmission.
    pub fn queue(
        &mut self,
        ctx: &mut TxopContext<'_>,
        packet: Packet,
        hdr: WifiMacHeader,
    ) -> Result<(), WifiMacError> {
        let full_size = hdr.size() + packet.size() + FCS_SIZE;
        ctx.stations
            .prepare_for_queue(hdr.addr1, &hdr, &packet, full_size);
        if let Err(e) = self.queue.enqueue(packet, hdr, ctx.timers.now_us()) {
            mac_warn!(self.log, "Dropping frame: {}", e);
            return Err(e);
        }
        self.start_access_if_needed(ctx);
        Ok(())
    }

    /// Asks for access if a new frame is waiting and nothing is in flight.
    pub fn start_access_if_needed(&mut self, ctx: &mut TxopContext<'_>) {
        if self.current_packet.is_none()
            && !self.queue.is_empty(ctx.timers.now_us())
            && !ctx.dcf.state(self.dcf_id).is_access_requested()
        {
            self.access_wanted = true;
        }
    }

    /// Asks for access if a frame is in flight or waiting.
    pub fn restart_access_if_needed(&mut self, ctx: &mut TxopContext<'_>) {
        if (self.current_packet.is_some() || !self.queue.is_empty(ctx.timers.now_us()))
            && !ctx.dcf.state(self.dcf_id).is_access_requested()
        {
            self.access_wanted = true;
        }
    }

    // --- Fragmentation ---

    fn need_fragmentation(&self, stations: &dyn RemoteStationManager) -> bool {
        self.current_packet
            .as_ref()
            .is_some_and(|p| stations.need_fragmentation(self.current_hdr.addr1, &self.current_hdr, p))
    }

    fn is_last_fragment(&self, stations: &dyn RemoteStationManager) -> bool {
        self.current_packet.as_ref().is_none_or(|p| {
            stations.is_last_fragment(&self.current_hdr, p, self.fragment_number)
        })
    }

    fn next_fragment_size(&self, stations: &dyn RemoteStationManager) -> usize {
        self.current_packet.as_ref().map_or(0, |p| {
            stations.fragment_size(&self.current_hdr, p, self.fragment_number + 1)
        })
    }

    /// The current fragment and its header.
    fn fragment_packet(&self, stations: &dyn RemoteStationManager) -> Option<(Packet, WifiMacHeader)> {
        let packet = self.current_packet.as_ref()?;
        let mut hdr = self.current_hdr.clone();
        hdr.fragment_number = self.fragment_number;
        hdr.more_fragments = !stations.is_last_fragment(&self.current_hdr, packet, self.fragment_number);
        let offset = stations.fragment_offset(&self.current_hdr, packet, self.fragment_number);
        let size = stations.fragment_size(&self.current_hdr, packet, self.fragment_number);
        Some((packet.create_fragment(offset, size), hdr))
    }

    fn start_transmission(
        &self,
        ctx: &mut TxopContext<'_>,
        packet: Packet,
        hdr: WifiMacHeader,
        params: MacLowTransmissionParameters,
    ) {
        let id = self.id();
        let (low, mut env) = ctx.low_env();
        low.start_transmission(&mut env, packet, hdr, params, id);
    }

    // --- DcfListener hooks ---

    pub fn notify_access_granted(&mut self, ctx: &mut TxopContext<'_>) {
        if self.current_packet.is_none() {
            let Some((packet, mut hdr)) = self.queue.dequeue(ctx.timers.now_us()) else {
                mac_debug!(self.log, "queue empty");
                return;
            };
            hdr.sequence_number = ctx.tx_middle.next_sequence_number_for(&hdr);
            hdr.fragment_number = 0;
            hdr.more_fragments = false;
            hdr.retry = false;
            self.fragment_number = 0;
            mac_debug!(
                self.log,
                "dequeued size={}, to={}, seq={:#x}",
                packet.size(),
                hdr.addr1,
                hdr.sequence_control()
            );
            self.current_packet = Some(packet);
            self.current_hdr = hdr;
        }

        let mut params = MacLowTransmissionParameters::new();
        params.disable_override_duration_id();

        if self.current_hdr.addr1.is_group() {
            params.disable_rts();
            params.disable_ack();
            params.disable_next_data();
            let Some(packet) = self.current_packet.clone() else {
                return;
            };
            self.start_transmission(ctx, packet, self.current_hdr.clone(), params);
            mac_debug!(self.log, "tx broadcast");
            return;
        }

        if self.is_qos() && self.current_hdr.is_qos_no_ack() {
            params.disable_ack();
        } else {
            params.enable_ack();
        }

        if self.need_fragmentation(&*ctx.stations) && !self.current_hdr.is_qos_amsdu() {
            let Some((fragment, hdr)) = self.fragment_packet(&*ctx.stations) else {
                return;
            };
            // EDCA fragments go out without RTS protection.
            if !self.is_qos() && ctx.stations.need_rts(hdr.addr1, &hdr, &fragment) {
                params.enable_rts();
            } else {
                params.disable_rts();
            }
            if self.is_last_fragment(&*ctx.stations) {
                mac_debug!(self.log, "fragmenting last fragment size={}", fragment.size());
                params.disable_next_data();
            } else {
                mac_debug!(self.log, "fragmenting size={}", fragment.size());
                params.enable_next_data(self.next_fragment_size(&*ctx.stations));
            }
            self.start_transmission(ctx, fragment, hdr, params);
            return;
        }

        if self.is_qos() {
            self.aggregate_msdus(ctx);
        }
        let Some(packet) = self.current_packet.clone() else {
            return;
        };
        if ctx
            .stations
            .need_rts(self.current_hdr.addr1, &self.current_hdr, &packet)
        {
            params.enable_rts();
            mac_debug!(self.log, "tx unicast rts");
        } else {
            params.disable_rts();
            mac_debug!(self.log, "tx unicast");
        }
        params.disable_next_data();
        self.start_transmission(ctx, packet, self.current_hdr.clone(), params);
    }

    pub fn notify_internal_collision(&mut self, ctx: &mut TxopContext<'_>) {
        self.notify_collision(ctx);
    }

    pub fn notify_collision(&mut self, ctx: &mut TxopContext<'_>) {
        mac_debug!(self.log, "collision, new backoff");
        self.start_backoff(ctx);
        self.restart_access_if_needed(ctx);
    }

    pub fn notify_channel_switching(&mut self) {
        self.queue.flush();
        self.current_packet = None;
    }

    /// The frame in flight goes back to the head of the queue.
    pub fn notify_sleep(&mut self, now_us: u64) {
        if let Some(packet) = self.current_packet.take() {
            if let Err(e) = self
                .queue
                .push_front(packet, self.current_hdr.clone(), now_us)
            {
                mac_warn!(self.log, "Frame in flight lost on sleep: {}", e);
            }
        }
    }

    pub fn notify_wake_up(&mut self, ctx: &mut TxopContext<'_>) {
        self.restart_access_if_needed(ctx);
    }

    // --- MacLow outcomes ---

    pub fn handle_tx_event(&mut self, ctx: &mut TxopContext<'_>, event: TxEvent) {
        match event {
            TxEvent::GotCts { snr, mode } => self.got_cts(snr, mode),
            TxEvent::MissedCts => self.missed_cts(ctx),
            TxEvent::GotAck { .. } => self.got_ack(ctx),
            TxEvent::MissedAck => self.missed_ack(ctx),
            TxEvent::StartNext => self.start_next(ctx),
            TxEvent::Cancel => self.cancel(),
            TxEvent::EndTxNoAck => self.end_tx_no_ack(ctx),
        }
    }

    pub fn got_cts(&mut self, snr: f64, mode: crate::hal::WifiMode) {
        mac_debug!(self.log, "got cts (snr={}, mode={})", snr, mode);
    }

    pub fn missed_cts(&mut self, ctx: &mut TxopContext<'_>) {
        mac_debug!(self.log, "missed cts");
        let Some(packet) = self.current_packet.as_ref() else {
            mac_error!(self.log, "missed cts without a frame in flight");
            return;
        };
        let to = self.current_hdr.addr1;
        if !ctx
            .stations
            .need_rts_retransmission(to, &self.current_hdr, packet)
        {
            mac_debug!(self.log, "Cts Fail");
            ctx.stations.report_final_rts_failed(to, &self.current_hdr);
            self.outcomes
                .push_back(TxOutcome::Failed(self.current_hdr.clone()));
            self.current_packet = None;
            self.reset_cw(ctx);
        } else {
            self.update_failed_cw(ctx);
        }
        self.start_backoff(ctx);
        self.restart_access_if_needed(ctx);
    }

    pub fn got_ack(&mut self, ctx: &mut TxopContext<'_>) {
        if !self.need_fragmentation(&*ctx.stations) || self.is_last_fragment(&*ctx.stations) {
            mac_debug!(self.log, "got ack. tx done.");
            self.outcomes
                .push_back(TxOutcome::Acked(self.current_hdr.clone()));
            self.current_packet = None;
            self.reset_cw(ctx);
            self.start_backoff(ctx);
            self.restart_access_if_needed(ctx);
        } else {
            mac_debug!(self.log, "got ack. tx not done, fragment={}", self.fragment_number);
        }
    }

    pub fn missed_ack(&mut self, ctx: &mut TxopContext<'_>) {
        mac_debug!(self.log, "missed ack");
        let Some(packet) = self.current_packet.as_ref() else {
            mac_error!(self.log, "missed ack without a frame in flight");
            return;
        };
        let to = self.current_hdr.addr1;
        if !ctx
            .stations
            .need_data_retransmission(to, &self.current_hdr, packet)
        {
            mac_debug!(self.log, "Ack Fail");
            ctx.stations.report_final_data_failed(to, &self.current_hdr);
            self.outcomes
                .push_back(TxOutcome::Failed(self.current_hdr.clone()));
            self.current_packet = None;
            self.reset_cw(ctx);
        } else {
            mac_debug!(self.log, "Retransmit");
            self.current_hdr.retry = true;
            self.update_failed_cw(ctx);
        }
        self.start_backoff(ctx);
        self.restart_access_if_needed(ctx);
    }

    /// Sends the next fragment SIFS after the previous one was acknowledged.
    pub fn start_next(&mut self, ctx: &mut TxopContext<'_>) {
        mac_debug!(self.log, "start next packet fragment");
        self.fragment_number += 1;
        let Some((fragment, hdr)) = self.fragment_packet(&*ctx.stations) else {
            mac_error!(self.log, "next fragment requested without a frame in flight");
            return;
        };
        let mut params = MacLowTransmissionParameters::new();
        params.enable_ack();
        params.disable_rts();
        params.disable_override_duration_id();
        if self.is_last_fragment(&*ctx.stations) {
            params.disable_next_data();
        } else {
            params.enable_next_data(self.next_fragment_size(&*ctx.stations));
        }
        self.start_transmission(ctx, fragment, hdr, params);
    }

    /// Another `Txop` took over `MacLow`. This one is already backing off
    /// and keeps its frame for the next grant.
    pub fn cancel(&mut self) {
        mac_debug!(self.log, "transmission cancelled");
    }

    pub fn end_tx_no_ack(&mut self, ctx: &mut TxopContext<'_>) {
        mac_debug!(self.log, "a transmission that did not require an ACK just finished");
        self.current_packet = None;
        self.reset_cw(ctx);
        self.start_backoff(ctx);
        self.start_access_if_needed(ctx);
    }
}
