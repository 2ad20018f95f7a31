//! The frame exchange state machine.
//!
//! `MacLow` carries out one transmission at a time on behalf of a `Txop`:
//! RTS, CTS, DATA, ACK and the fragments in between, each step triggered by
//! a scheduled [`MacTimer`]. It also answers RTS and unicast frames addressed
//! to this station and maintains the NAV. Outcomes are queued as
//! [`TxEvent`]s tagged with the [`TxopId`] that started the transmission.

pub mod params;

pub use params::{MacLowTransmissionParameters, WaitAck};

use crate::dcf::DcfManager;
use crate::frame::{Mac48Address, Packet, WifiMacHeader, decode_mpdu, encode_mpdu};
use crate::hal::{Phy, WifiMode};
use crate::log::{LogContext, mac_debug, mac_error, mac_trace, mac_warn};
use crate::sched::{MacTimer, TimerSlot, Timers};
use crate::station::RemoteStationManager;
use crate::types::{ACK_SIZE, CTS_SIZE, FCS_SIZE, RTS_SIZE};
use alloc::collections::VecDeque;

/// Identifies the `Txop` a transmission belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxopId(pub usize);

/// Outcome of a transmission step, reported to the `Txop` that started it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TxEvent {
    GotCts { snr: f64, mode: WifiMode },
    MissedCts,
    GotAck { snr: f64, mode: WifiMode },
    MissedAck,
    /// The fragment was acknowledged; send the next one now.
    StartNext,
    /// The transmission was abandoned before completion.
    Cancel,
    /// A frame that expects no response has left the antenna.
    EndTxNoAck,
}

/// Timing of the frame exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MacLowConfig {
    pub sifs_us: u64,
    pub slot_us: u64,
    pub pifs_us: u64,
    /// Measured from the end of the data frame.
    pub ack_timeout_us: u64,
    /// Measured from the end of the RTS.
    pub cts_timeout_us: u64,
}

impl Default for MacLowConfig {
    /// 802.11a OFDM. Both timeouts are SIFS + slot + a 6 Mb/s response,
    /// plus 2x3 us of propagation.
    fn default() -> Self {
        Self {
            sifs_us: 16,
            slot_us: 9,
            pifs_us: 16 + 9,
            ack_timeout_us: 16 + 9 + 44 + 6,
            cts_timeout_us: 16 + 9 + 44 + 6,
        }
    }
}

/// The collaborators `MacLow` works with during one call.
pub struct LowEnv<'a> {
    pub phy: &'a mut dyn Phy,
    pub stations: &'a mut dyn RemoteStationManager,
    pub dcf: &'a mut DcfManager,
    pub timers: &'a mut dyn Timers,
}

#[derive(Debug, Default)]
struct LowTimers {
    normal_ack: TimerSlot,
    fast_ack: TimerSlot,
    super_fast_ack: TimerSlot,
    fast_ack_failed: TimerSlot,
    cts_timeout: TimerSlot,
    send_cts: TimerSlot,
    send_ack: TimerSlot,
    send_data: TimerSlot,
    wait_sifs: TimerSlot,
    end_tx_no_ack: TimerSlot,
    nav_reset: TimerSlot,
}

impl LowTimers {
    /// Cancels every slot but the NAV reset. Returns true if one was live.
    fn cancel_all(&mut self, timers: &mut dyn Timers) -> bool {
        let mut one_running = false;
        for slot in [
            &mut self.normal_ack,
            &mut self.fast_ack,
            &mut self.super_fast_ack,
            &mut self.fast_ack_failed,
            &mut self.cts_timeout,
            &mut self.send_cts,
            &mut self.send_ack,
            &mut self.send_data,
            &mut self.wait_sifs,
            &mut self.end_tx_no_ack,
        ] {
            one_running |= slot.cancel(timers);
        }
        one_running
    }

    fn any_ack_timeout_running(&self, timers: &dyn Timers) -> bool {
        self.normal_ack.is_running(timers)
            || self.fast_ack.is_running(timers)
            || self.super_fast_ack.is_running(timers)
    }
}

#[derive(Debug)]
pub struct MacLow {
    config: MacLowConfig,
    address: Mac48Address,
    bssid: Mac48Address,
    promisc: bool,
    log: LogContext,

    /// Frame still to be sent. Cleared once the data frame is on the air.
    current_packet: Option<Packet>,
    current_hdr: WifiMacHeader,
    tx_params: MacLowTransmissionParameters,
    listener: Option<TxopId>,
    slots: LowTimers,

    last_nav_start_us: u64,
    last_nav_duration_us: u64,

    events: VecDeque<(TxopId, TxEvent)>,
    received: VecDeque<(Packet, WifiMacHeader)>,
}

impl MacLow {
    pub fn new(config: MacLowConfig, address: Mac48Address) -> Self {
        Self {
            config,
            address,
            bssid: Mac48Address::default(),
            promisc: false,
            log: LogContext::new("low", address),
            current_packet: None,
            current_hdr: WifiMacHeader::new(crate::frame::WifiMacType::Data),
            tx_params: MacLowTransmissionParameters::new(),
            listener: None,
            slots: LowTimers::default(),
            last_nav_start_us: 0,
            last_nav_duration_us: 0,
            events: VecDeque::new(),
            received: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &MacLowConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: MacLowConfig) {
        self.config = config;
    }

    pub fn address(&self) -> Mac48Address {
        self.address
    }

    pub fn bssid(&self) -> Mac48Address {
        self.bssid
    }

    pub fn set_bssid(&mut self, bssid: Mac48Address) {
        self.bssid = bssid;
    }

    /// Forwards data frames addressed to other stations too.
    pub fn set_promisc(&mut self) {
        self.promisc = true;
    }

    /// Outcomes queued since the last call.
    pub fn take_events(&mut self) -> VecDeque<(TxopId, TxEvent)> {
        core::mem::take(&mut self.events)
    }

    /// Data and management frames accepted since the last call, FCS removed.
    pub fn take_received(&mut self) -> VecDeque<(Packet, WifiMacHeader)> {
        core::mem::take(&mut self.received)
    }

    fn emit(&mut self, listener: Option<TxopId>, event: TxEvent) {
        match listener {
            Some(id) => self.events.push_back((id, event)),
            None => mac_error!(self.log, "{:?} with no transmission in progress", event),
        }
    }

    /// Starts the exchange described by `params` for `packet`. Whatever was in
    /// progress is abandoned and its owner receives [`TxEvent::Cancel`].
    pub fn start_transmission(
        &mut self,
        env: &mut LowEnv<'_>,
        packet: Packet,
        hdr: WifiMacHeader,
        params: MacLowTransmissionParameters,
        listener: TxopId,
    ) {
        self.current_packet = Some(packet);
        self.current_hdr = hdr;
        if self.slots.cancel_all(env.timers) {
            if let Some(previous) = self.listener.take() {
                self.events.push_back((previous, TxEvent::Cancel));
            }
        }
        self.listener = Some(listener);
        self.tx_params = params;

        mac_debug!(
            self.log,
            "startTx size={}, to={}, params={}",
            self.current_size(),
            self.current_hdr.addr1,
            params
        );

        if self.tx_params.must_send_rts() {
            self.send_rts_for_packet(env);
        } else {
            self.send_data_packet(env);
        }
    }

    fn current_size(&self) -> usize {
        let payload = self.current_packet.as_ref().map_or(0, Packet::size);
        self.current_hdr.size() + payload + FCS_SIZE
    }

    fn mpdu_size(packet: &Packet, hdr: &WifiMacHeader) -> usize {
        hdr.size() + packet.size() + FCS_SIZE
    }

    fn ack_duration(env: &LowEnv<'_>, to: Mac48Address, data_mode: WifiMode) -> u64 {
        let ack_mode = env.stations.control_answer_mode(to, data_mode);
        env.phy.calculate_tx_duration_us(ACK_SIZE, ack_mode)
    }

    fn cts_duration(env: &LowEnv<'_>, to: Mac48Address, rts_mode: WifiMode) -> u64 {
        let cts_mode = env.stations.control_answer_mode(to, rts_mode);
        env.phy.calculate_tx_duration_us(CTS_SIZE, cts_mode)
    }

    /// Air time of the whole exchange: RTS/CTS, data and ACK as `params` request.
    pub fn calculate_overall_tx_time(
        &self,
        phy: &dyn Phy,
        stations: &dyn RemoteStationManager,
        packet: &Packet,
        hdr: &WifiMacHeader,
        params: &MacLowTransmissionParameters,
    ) -> u64 {
        let sifs = self.config.sifs_us;
        let mut tx_time = 0;
        if params.must_send_rts() {
            let rts_mode = stations.rts_mode(hdr.addr1, hdr);
            let cts_mode = stations.control_answer_mode(hdr.addr1, rts_mode);
            tx_time += phy.calculate_tx_duration_us(RTS_SIZE, rts_mode);
            tx_time += phy.calculate_tx_duration_us(CTS_SIZE, cts_mode);
            tx_time += 2 * sifs;
        }
        let data_mode = stations.data_mode(hdr.addr1, hdr, packet);
        tx_time += phy.calculate_tx_duration_us(Self::mpdu_size(packet, hdr), data_mode);
        if params.must_wait_ack() {
            let ack_mode = stations.control_answer_mode(hdr.addr1, data_mode);
            tx_time += sifs + phy.calculate_tx_duration_us(ACK_SIZE, ack_mode);
        }
        tx_time
    }

    /// [`Self::calculate_overall_tx_time`] plus the next fragment, if any.
    pub fn calculate_transmission_time(
        &self,
        phy: &dyn Phy,
        stations: &dyn RemoteStationManager,
        packet: &Packet,
        hdr: &WifiMacHeader,
        params: &MacLowTransmissionParameters,
    ) -> u64 {
        let mut tx_time = self.calculate_overall_tx_time(phy, stations, packet, hdr, params);
        if params.has_next_packet() {
            let data_mode = stations.data_mode(hdr.addr1, hdr, packet);
            tx_time += self.config.sifs_us;
            tx_time += phy.calculate_tx_duration_us(params.next_packet_size(), data_mode);
        }
        tx_time
    }

    fn forward_down(&mut self, env: &mut LowEnv<'_>, hdr: &WifiMacHeader, payload: &[u8], mode: WifiMode) {
        let psdu = match encode_mpdu(hdr, payload) {
            Ok(psdu) => psdu,
            Err(e) => {
                mac_error!(self.log, "Cannot encode {:?}: {}", hdr.kind, e);
                return;
            }
        };
        mac_debug!(
            self.log,
            "send {:?}, to={}, size={}, mode={}, duration={}, seq={:#x}",
            hdr.kind,
            hdr.addr1,
            psdu.len(),
            mode,
            hdr.duration_us,
            hdr.sequence_control()
        );
        let tx_duration = env.phy.calculate_tx_duration_us(psdu.len(), mode);
        env.phy.send_packet(psdu, mode);
        env.dcf.notify_tx_start_now(env.timers.now_us(), tx_duration);
    }

    fn send_rts_for_packet(&mut self, env: &mut LowEnv<'_>) {
        let Some(packet) = self.current_packet.as_ref() else {
            return;
        };
        let to = self.current_hdr.addr1;
        let rts_mode = env.stations.rts_mode(to, &self.current_hdr);
        let duration = if self.tx_params.has_duration_id() {
            self.tx_params.duration_id()
        } else {
            let data_mode = env.stations.data_mode(to, &self.current_hdr, packet);
            let sifs = self.config.sifs_us;
            let data_time = env
                .phy
                .calculate_tx_duration_us(Self::mpdu_size(packet, &self.current_hdr), data_mode);
            sifs + Self::cts_duration(env, to, rts_mode)
                + sifs
                + data_time
                + sifs
                + Self::ack_duration(env, to, data_mode)
        };
        let rts = WifiMacHeader::rts(to, self.address, duration);

        let tx_duration = env.phy.calculate_tx_duration_us(RTS_SIZE, rts_mode);
        let timer_delay = tx_duration + self.config.cts_timeout_us;
        env.dcf
            .notify_cts_timeout_start_now(env.timers.now_us(), timer_delay);
        self.slots
            .cts_timeout
            .arm(env.timers, timer_delay, MacTimer::CtsTimeout);

        self.forward_down(env, &rts, &[], rts_mode);
    }

    fn start_data_tx_timers(&mut self, env: &mut LowEnv<'_>, tx_duration: u64) {
        let now = env.timers.now_us();
        match self.tx_params.wait_ack() {
            WaitAck::Normal => {
                let delay = tx_duration + self.config.ack_timeout_us;
                env.dcf.notify_ack_timeout_start_now(now, delay);
                self.slots
                    .normal_ack
                    .arm(env.timers, delay, MacTimer::NormalAckTimeout);
            }
            WaitAck::Fast => {
                let delay = tx_duration + self.config.pifs_us;
                env.dcf.notify_ack_timeout_start_now(now, delay);
                self.slots
                    .fast_ack
                    .arm(env.timers, delay, MacTimer::FastAckTimeout);
            }
            WaitAck::SuperFast => {
                let delay = tx_duration + self.config.pifs_us;
                env.dcf.notify_ack_timeout_start_now(now, delay);
                self.slots
                    .super_fast_ack
                    .arm(env.timers, delay, MacTimer::SuperFastAckTimeout);
            }
            WaitAck::None if self.tx_params.has_next_packet() => {
                let delay = tx_duration + self.config.sifs_us;
                self.slots
                    .wait_sifs
                    .arm(env.timers, delay, MacTimer::WaitSifsAfterEndTx);
            }
            WaitAck::None => {
                self.slots
                    .end_tx_no_ack
                    .arm(env.timers, tx_duration, MacTimer::EndTxNoAck);
            }
        }
    }

    fn send_data_packet(&mut self, env: &mut LowEnv<'_>) {
        let Some(packet) = self.current_packet.take() else {
            return;
        };
        let to = self.current_hdr.addr1;
        let data_mode = env.stations.data_mode(to, &self.current_hdr, &packet);
        let tx_duration = env
            .phy
            .calculate_tx_duration_us(Self::mpdu_size(&packet, &self.current_hdr), data_mode);
        self.start_data_tx_timers(env, tx_duration);

        let duration = if self.tx_params.has_duration_id() {
            self.tx_params.duration_id()
        } else {
            let sifs = self.config.sifs_us;
            let mut duration = 0;
            if self.tx_params.must_wait_ack() {
                duration += sifs + Self::ack_duration(env, to, data_mode);
            }
            if self.tx_params.has_next_packet() {
                duration += sifs;
                duration += env
                    .phy
                    .calculate_tx_duration_us(self.tx_params.next_packet_size(), data_mode);
                if self.tx_params.must_wait_ack() {
                    duration += sifs + Self::ack_duration(env, to, data_mode);
                }
            }
            duration
        };
        self.current_hdr.set_duration_us(duration);
        let hdr = self.current_hdr.clone();
        self.forward_down(env, &hdr, packet.data(), data_mode);
    }

    fn send_data_after_cts(&mut self, env: &mut LowEnv<'_>, duration_us: u64) {
        let Some(packet) = self.current_packet.take() else {
            mac_error!(self.log, "CTS answered but no data frame is pending");
            return;
        };
        let to = self.current_hdr.addr1;
        let data_mode = env.stations.data_mode(to, &self.current_hdr, &packet);
        let tx_duration = env
            .phy
            .calculate_tx_duration_us(Self::mpdu_size(&packet, &self.current_hdr), data_mode);
        self.start_data_tx_timers(env, tx_duration);

        let new_duration = self.config.sifs_us + Self::ack_duration(env, to, data_mode);
        let duration = duration_us
            .saturating_sub(tx_duration + self.config.sifs_us)
            .max(new_duration);
        self.current_hdr.set_duration_us(duration);
        let hdr = self.current_hdr.clone();
        self.forward_down(env, &hdr, packet.data(), data_mode);
    }

    fn send_cts_after_rts(
        &mut self,
        env: &mut LowEnv<'_>,
        source: Mac48Address,
        duration_us: u64,
        rts_mode: WifiMode,
        rts_snr: f64,
    ) {
        let cts_mode = env.stations.control_answer_mode(source, rts_mode);
        let cts_time = env.phy.calculate_tx_duration_us(CTS_SIZE, cts_mode);
        let duration = duration_us.saturating_sub(cts_time + self.config.sifs_us);
        mac_trace!(self.log, "CTS to {} (rts snr={})", source, rts_snr);
        let cts = WifiMacHeader::cts(source, duration);
        self.forward_down(env, &cts, &[], cts_mode);
    }

    fn send_ack_after_data(
        &mut self,
        env: &mut LowEnv<'_>,
        source: Mac48Address,
        duration_us: u64,
        data_mode: WifiMode,
        data_snr: f64,
    ) {
        let ack_mode = env.stations.control_answer_mode(source, data_mode);
        let ack_time = env.phy.calculate_tx_duration_us(ACK_SIZE, ack_mode);
        let duration = duration_us.saturating_sub(ack_time + self.config.sifs_us);
        mac_trace!(self.log, "ACK to {} (data snr={})", source, data_snr);
        let ack = WifiMacHeader::ack(source, duration);
        self.forward_down(env, &ack, &[], ack_mode);
    }

    // --- NAV ---

    pub fn is_nav_zero(&self, now_us: u64) -> bool {
        self.last_nav_start_us + self.last_nav_duration_us < now_us
    }

    fn notify_nav(&mut self, env: &mut LowEnv<'_>, hdr: &WifiMacHeader, rx_mode: WifiMode) {
        let duration = hdr.duration_us();
        if hdr.is_cfpoll() && hdr.addr2 == self.bssid {
            // 802.11-2012 9.3.2.4: a CF-Poll from our AP resets the NAV.
            self.do_nav_reset_now(env, duration);
        } else if hdr.addr1 != self.address {
            let updated = self.do_nav_start_now(env, duration);
            if hdr.is_rts() && updated {
                // A NAV set by an RTS may be reset if the exchange never starts.
                let cts_time = env.phy.calculate_tx_duration_us(CTS_SIZE, rx_mode);
                let delay = cts_time + 2 * self.config.sifs_us + 2 * self.config.slot_us;
                let now = env.timers.now_us();
                self.slots.nav_reset.arm(
                    env.timers,
                    delay,
                    MacTimer::NavCounterResetCtsMissed { rts_end_rx_us: now },
                );
            }
        }
    }

    fn do_nav_reset_now(&mut self, env: &mut LowEnv<'_>, duration_us: u64) {
        env.dcf.notify_nav_reset_now(env.timers, duration_us);
        self.last_nav_start_us = env.timers.now_us();
        self.last_nav_duration_us = duration_us;
    }

    fn do_nav_start_now(&mut self, env: &mut LowEnv<'_>, duration_us: u64) -> bool {
        let now = env.timers.now_us();
        env.dcf.notify_nav_start_now(now, duration_us);
        if now + duration_us > self.last_nav_start_us + self.last_nav_duration_us {
            self.last_nav_start_us = now;
            self.last_nav_duration_us = duration_us;
            true
        } else {
            false
        }
    }

    // --- Reception ---

    /// A PSDU was decoded by the PHY. `psdu` includes the FCS.
    pub fn receive_ok(&mut self, env: &mut LowEnv<'_>, psdu: &[u8], rx_snr: f64, mode: WifiMode) {
        let (hdr, payload) = match decode_mpdu(psdu) {
            Ok(frame) => frame,
            Err(e) => {
                mac_warn!(self.log, "Dropping undecodable frame of {} bytes: {}", psdu.len(), e);
                return;
            }
        };
        let now = env.timers.now_us();
        let prev_nav_zero = self.is_nav_zero(now);
        mac_trace!(self.log, "rx {:?} duration/id={}", hdr.kind, hdr.duration_us);
        self.notify_nav(env, &hdr, mode);

        if hdr.is_rts() {
            // 802.11-2012 9.3.2.6: answer only if the NAV says the medium is idle.
            if prev_nav_zero && hdr.addr1 == self.address {
                mac_debug!(self.log, "rx RTS from={}, schedule CTS", hdr.addr2);
                env.stations.report_rx_ok(hdr.addr2, &hdr, rx_snr, mode);
                self.slots.send_cts.arm(
                    env.timers,
                    self.config.sifs_us,
                    MacTimer::SendCts {
                        to: hdr.addr2,
                        duration_us: hdr.duration_us(),
                        mode,
                        rts_snr: rx_snr,
                    },
                );
            } else {
                mac_debug!(self.log, "rx RTS from={}, cannot schedule CTS", hdr.addr2);
            }
        } else if hdr.is_cts()
            && hdr.addr1 == self.address
            && self.slots.cts_timeout.is_running(env.timers)
            && self.current_packet.is_some()
        {
            let peer = self.current_hdr.addr1;
            mac_debug!(self.log, "receive cts from={}", peer);
            env.stations.report_rx_ok(peer, &self.current_hdr, rx_snr, mode);
            // The peer's own SNR report does not travel on the wire.
            env.stations
                .report_rts_ok(peer, &self.current_hdr, rx_snr, mode, 0.0);

            self.slots.cts_timeout.cancel(env.timers);
            env.dcf.notify_cts_timeout_reset_now(env.timers);
            self.emit(self.listener, TxEvent::GotCts { snr: rx_snr, mode });
            self.slots.send_data.arm(
                env.timers,
                self.config.sifs_us,
                MacTimer::SendDataAfterCts {
                    duration_us: hdr.duration_us(),
                },
            );
        } else if hdr.is_ack()
            && hdr.addr1 == self.address
            && self.slots.any_ack_timeout_running(env.timers)
            && self.tx_params.must_wait_ack()
        {
            let peer = self.current_hdr.addr1;
            mac_debug!(self.log, "receive ack from={}", peer);
            env.stations.report_rx_ok(peer, &self.current_hdr, rx_snr, mode);
            env.stations
                .report_data_ok(peer, &self.current_hdr, rx_snr, mode, 0.0);
            let mut got_ack = false;
            if self.tx_params.must_wait_normal_ack() && self.slots.normal_ack.cancel(env.timers) {
                env.dcf.notify_ack_timeout_reset_now(env.timers);
                got_ack = true;
            }
            if self.tx_params.must_wait_fast_ack() && self.slots.fast_ack.cancel(env.timers) {
                env.dcf.notify_ack_timeout_reset_now(env.timers);
                got_ack = true;
            }
            if got_ack {
                self.emit(self.listener, TxEvent::GotAck { snr: rx_snr, mode });
            }
            if self.tx_params.has_next_packet() {
                self.slots.wait_sifs.arm(
                    env.timers,
                    self.config.sifs_us,
                    MacTimer::WaitSifsAfterEndTx,
                );
            }
        } else if hdr.is_ctl() {
            mac_debug!(self.log, "rx drop {:?}", hdr.kind);
        } else if hdr.addr1 == self.address {
            env.stations.report_rx_ok(hdr.addr2, &hdr, rx_snr, mode);
            if hdr.is_qos_data() && hdr.is_qos_no_ack() {
                mac_debug!(self.log, "rx unicast/noAck from={}", hdr.addr2);
            } else if hdr.is_data() || hdr.is_mgt() {
                mac_debug!(self.log, "rx unicast/sendAck from={}", hdr.addr2);
                self.slots.send_ack.arm(
                    env.timers,
                    self.config.sifs_us,
                    MacTimer::SendAck {
                        to: hdr.addr2,
                        duration_us: hdr.duration_us(),
                        mode,
                        data_snr: rx_snr,
                    },
                );
            }
            self.received.push_back((Packet::new(payload), hdr));
        } else if hdr.addr1.is_group() {
            if hdr.is_data() || hdr.is_mgt() {
                mac_debug!(self.log, "rx group from={}", hdr.addr2);
                self.received.push_back((Packet::new(payload), hdr));
            }
        } else if self.promisc && hdr.is_data() {
            self.received.push_back((Packet::new(payload), hdr));
        }
    }

    /// The PHY failed to decode a frame.
    pub fn receive_error(&mut self, env: &mut LowEnv<'_>) {
        mac_debug!(self.log, "rx failed");
        if self.tx_params.must_wait_fast_ack() && !self.slots.fast_ack_failed.is_running(env.timers) {
            self.slots.fast_ack_failed.arm(
                env.timers,
                self.config.sifs_us,
                MacTimer::FastAckFailedTimeout,
            );
        }
    }

    /// Drops the exchange in progress and the NAV.
    pub fn notify_switching_start_now(&mut self, env: &mut LowEnv<'_>, duration_us: u64) {
        mac_debug!(
            self.log,
            "switching channel for {}us, cancelling pending events",
            duration_us
        );
        env.stations.reset();
        self.abort(env);
    }

    /// The PHY goes to sleep: nothing in progress can complete.
    pub fn notify_sleep_now(&mut self, env: &mut LowEnv<'_>) {
        mac_debug!(self.log, "device in sleep mode, cancelling pending events");
        self.abort(env);
    }

    fn abort(&mut self, env: &mut LowEnv<'_>) {
        if self.slots.cancel_all(env.timers) {
            if let Some(previous) = self.listener.take() {
                self.events.push_back((previous, TxEvent::Cancel));
            }
        }
        self.slots.nav_reset.cancel(env.timers);
        self.last_nav_start_us = env.timers.now_us();
        self.last_nav_duration_us = 0;
        self.current_packet = None;
        self.listener = None;
    }

    // --- Timers ---

    /// Dispatches a fired timer that belongs to this `MacLow`.
    pub fn handle_timer(&mut self, env: &mut LowEnv<'_>, timer: MacTimer) {
        match timer {
            MacTimer::NormalAckTimeout => {
                self.slots.normal_ack.clear();
                mac_debug!(self.log, "normal ack timeout");
                env.stations
                    .report_data_failed(self.current_hdr.addr1, &self.current_hdr);
                let listener = self.listener.take();
                self.emit(listener, TxEvent::MissedAck);
            }
            MacTimer::FastAckTimeout => {
                self.slots.fast_ack.clear();
                env.stations
                    .report_data_failed(self.current_hdr.addr1, &self.current_hdr);
                if env.phy.is_state_idle() {
                    mac_debug!(self.log, "fast Ack idle missed");
                    let listener = self.listener.take();
                    self.emit(listener, TxEvent::MissedAck);
                } else {
                    // A response is being received: wait for it or for its RX error.
                    mac_debug!(self.log, "fast Ack ok");
                }
            }
            MacTimer::SuperFastAckTimeout => {
                self.slots.super_fast_ack.clear();
                env.stations
                    .report_data_failed(self.current_hdr.addr1, &self.current_hdr);
                let listener = self.listener.take();
                if env.phy.is_state_idle() {
                    mac_debug!(self.log, "super fast Ack failed");
                    self.emit(listener, TxEvent::MissedAck);
                } else {
                    mac_debug!(self.log, "super fast Ack ok");
                    self.emit(
                        listener,
                        TxEvent::GotAck {
                            snr: 0.0,
                            mode: WifiMode::default(),
                        },
                    );
                }
            }
            MacTimer::FastAckFailedTimeout => {
                self.slots.fast_ack_failed.clear();
                mac_debug!(self.log, "fast Ack busy but missed");
                let listener = self.listener.take();
                self.emit(listener, TxEvent::MissedAck);
            }
            MacTimer::CtsTimeout => {
                self.slots.cts_timeout.clear();
                mac_debug!(self.log, "cts timeout");
                env.stations
                    .report_rts_failed(self.current_hdr.addr1, &self.current_hdr);
                self.current_packet = None;
                let listener = self.listener.take();
                self.emit(listener, TxEvent::MissedCts);
            }
            MacTimer::SendCts {
                to,
                duration_us,
                mode,
                rts_snr,
            } => {
                self.slots.send_cts.clear();
                self.send_cts_after_rts(env, to, duration_us, mode, rts_snr);
            }
            MacTimer::SendAck {
                to,
                duration_us,
                mode,
                data_snr,
            } => {
                self.slots.send_ack.clear();
                self.send_ack_after_data(env, to, duration_us, mode, data_snr);
            }
            MacTimer::SendDataAfterCts { duration_us } => {
                self.slots.send_data.clear();
                self.send_data_after_cts(env, duration_us);
            }
            MacTimer::WaitSifsAfterEndTx => {
                self.slots.wait_sifs.clear();
                self.emit(self.listener, TxEvent::StartNext);
            }
            MacTimer::EndTxNoAck => {
                self.slots.end_tx_no_ack.clear();
                let listener = self.listener.take();
                self.emit(listener, TxEvent::EndTxNoAck);
            }
            MacTimer::NavCounterResetCtsMissed { rts_end_rx_us } => {
                self.slots.nav_reset.clear();
                if env.phy.last_rx_start_us() <= rts_end_rx_us {
                    mac_debug!(self.log, "no exchange followed the RTS, resetting NAV");
                    self.do_nav_reset_now(env, 0);
                }
            }
            MacTimer::AccessTimeout => {
                mac_error!(self.log, "access timeout routed to MacLow");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcf::DcfConfig;
    use crate::frame::WifiMacType;
    use crate::hal::ofdm_tx_duration_us;
    use crate::sched::Scheduler;
    use crate::station::ConstantRateStationManager;
    use alloc::vec;
    use alloc::vec::Vec;

    const TXOP: TxopId = TxopId(0);

    struct MockPhy {
        sent: Vec<(Vec<u8>, WifiMode)>,
        idle: bool,
        last_rx_start_us: u64,
    }

    impl Phy for MockPhy {
        fn send_packet(&mut self, psdu: Vec<u8>, mode: WifiMode) {
            self.sent.push((psdu, mode));
        }

        fn calculate_tx_duration_us(&self, size: usize, mode: WifiMode) -> u64 {
            ofdm_tx_duration_us(size, mode)
        }

        fn is_state_idle(&self) -> bool {
            self.idle
        }

        fn last_rx_start_us(&self) -> u64 {
            self.last_rx_start_us
        }
    }

    struct Bench {
        low: MacLow,
        phy: MockPhy,
        stations: ConstantRateStationManager,
        dcf: DcfManager,
        sched: Scheduler<MacTimer>,
    }

    impl Bench {
        fn new() -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            Self {
                low: MacLow::new(MacLowConfig::default(), me()),
                phy: MockPhy {
                    sent: Vec::new(),
                    idle: true,
                    last_rx_start_us: 0,
                },
                stations: ConstantRateStationManager::default(),
                dcf: DcfManager::new(DcfConfig::default()),
                sched: Scheduler::new(),
            }
        }

        fn split(&mut self) -> (&mut MacLow, LowEnv<'_>) {
            (
                &mut self.low,
                LowEnv {
                    phy: &mut self.phy,
                    stations: &mut self.stations,
                    dcf: &mut self.dcf,
                    timers: &mut self.sched,
                },
            )
        }

        fn start(&mut self, hdr: WifiMacHeader, params: MacLowTransmissionParameters) {
            let (low, mut env) = self.split();
            low.start_transmission(&mut env, Packet::new(vec![0xab; 100]), hdr, params, TXOP);
        }

        fn receive(&mut self, hdr: &WifiMacHeader, payload: &[u8]) {
            let psdu = encode_mpdu(hdr, payload).unwrap();
            let (low, mut env) = self.split();
            low.receive_ok(&mut env, &psdu, 20.0, WifiMode::OFDM_6MBPS);
        }

        /// Fires the next timer and returns it.
        fn fire(&mut self) -> (u64, MacTimer) {
            let (at, timer) = self.sched.pop().expect("no pending timer");
            let (low, mut env) = self.split();
            low.handle_timer(&mut env, timer);
            (at, timer)
        }

        fn advance_to(&mut self, at: u64) {
            // Any variant works: the marker is popped before anything reads it.
            self.sched.schedule_at(at, MacTimer::AccessTimeout);
            assert_eq!(self.sched.pop().map(|(t, _)| t), Some(at));
        }

        fn sent_header(&self, index: usize) -> WifiMacHeader {
            decode_mpdu(&self.phy.sent[index].0).unwrap().0
        }
    }

    fn me() -> Mac48Address {
        Mac48Address::local(1)
    }

    fn peer() -> Mac48Address {
        Mac48Address::local(2)
    }

    fn data_to(to: Mac48Address) -> WifiMacHeader {
        let mut hdr = WifiMacHeader::new(WifiMacType::Data);
        hdr.addr1 = to;
        hdr.addr2 = me();
        hdr.addr3 = to;
        hdr
    }

    fn with_ack() -> MacLowTransmissionParameters {
        let mut params = MacLowTransmissionParameters::new();
        params.enable_ack();
        params
    }

    // 24-byte header + 100 bytes + FCS at 6 Mb/s.
    const DATA_TIME: u64 = 196;
    const ACK_TIME: u64 = 44;
    const CTS_TIME: u64 = 44;
    const RTS_TIME: u64 = 52;

    #[test]
    fn test_unicast_data_is_acknowledged() {
        let mut b = Bench::new();
        b.start(data_to(peer()), with_ack());
        assert_eq!(b.phy.sent.len(), 1);
        assert_eq!(b.sent_header(0).duration_us(), 16 + ACK_TIME);
        assert_eq!(
            b.sched.peek_time(),
            Some(DATA_TIME + b.low.config().ack_timeout_us)
        );

        b.receive(&WifiMacHeader::ack(me(), 0), &[]);
        assert_eq!(
            b.low.take_events().into_iter().collect::<Vec<_>>(),
            vec![(
                TXOP,
                TxEvent::GotAck {
                    snr: 20.0,
                    mode: WifiMode::OFDM_6MBPS
                }
            )]
        );
        assert!(b.sched.is_empty());
    }

    #[test]
    fn test_missing_ack_times_out() {
        let mut b = Bench::new();
        b.start(data_to(peer()), with_ack());
        let (at, timer) = b.fire();
        assert_eq!(timer, MacTimer::NormalAckTimeout);
        assert_eq!(at, DATA_TIME + 75);
        assert_eq!(
            b.low.take_events().into_iter().collect::<Vec<_>>(),
            vec![(TXOP, TxEvent::MissedAck)]
        );
        assert_eq!(b.stations.slrc(peer()), 1);
        // The DcfManager defers until SIFS after the timeout window.
        assert_eq!(b.dcf.access_grant_start(), DATA_TIME + 75 + 16);
    }

    #[test]
    fn test_ack_from_wrong_station_is_ignored() {
        let mut b = Bench::new();
        b.start(data_to(peer()), with_ack());
        b.receive(&WifiMacHeader::ack(Mac48Address::local(9), 0), &[]);
        assert!(b.low.take_events().is_empty());
        assert!(!b.sched.is_empty());
    }

    #[test]
    fn test_rts_cts_data_ack_exchange() {
        let mut b = Bench::new();
        let mut params = with_ack();
        params.enable_rts();
        b.start(data_to(peer()), params);

        let rts = b.sent_header(0);
        assert!(rts.is_rts());
        assert_eq!(rts.addr2, me());
        let nav = 16 + CTS_TIME + 16 + DATA_TIME + 16 + ACK_TIME;
        assert_eq!(rts.duration_us(), nav);
        assert_eq!(b.sched.peek_time(), Some(RTS_TIME + 75));

        b.advance_to(RTS_TIME + 16);
        b.receive(&WifiMacHeader::cts(me(), nav - CTS_TIME - 16), &[]);
        assert!(matches!(
            b.low.take_events().pop_front(),
            Some((TXOP, TxEvent::GotCts { .. }))
        ));

        let (at, timer) = b.fire();
        assert_eq!(at, RTS_TIME + 16 + 16);
        assert!(matches!(timer, MacTimer::SendDataAfterCts { .. }));
        let data = b.sent_header(1);
        assert!(data.is_data());
        assert_eq!(data.duration_us(), 16 + ACK_TIME);
    }

    #[test]
    fn test_missing_cts_times_out() {
        let mut b = Bench::new();
        let mut params = with_ack();
        params.enable_rts();
        b.start(data_to(peer()), params);
        let (_, timer) = b.fire();
        assert_eq!(timer, MacTimer::CtsTimeout);
        assert_eq!(
            b.low.take_events().into_iter().collect::<Vec<_>>(),
            vec![(TXOP, TxEvent::MissedCts)]
        );
        assert_eq!(b.stations.ssrc(peer()), 1);
        // A late CTS is not accepted.
        b.receive(&WifiMacHeader::cts(me(), 0), &[]);
        assert!(b.low.take_events().is_empty());
    }

    #[test]
    fn test_rts_addressed_to_us_is_answered() {
        let mut b = Bench::new();
        b.advance_to(1000);
        b.receive(&WifiMacHeader::rts(me(), peer(), 400), &[]);
        let (at, timer) = b.fire();
        assert_eq!(at, 1016);
        assert!(matches!(timer, MacTimer::SendCts { to, .. } if to == peer()));
        let cts = b.sent_header(0);
        assert!(cts.is_cts());
        assert_eq!(cts.addr1, peer());
        assert_eq!(cts.duration_us(), 400 - CTS_TIME - 16);
    }

    #[test]
    fn test_rts_is_not_answered_under_nav() {
        let mut b = Bench::new();
        b.advance_to(1000);
        b.receive(&data_to(Mac48Address::local(7)), &[1, 2, 3]);
        let mut busy = data_to(Mac48Address::local(7));
        busy.set_duration_us(500);
        b.receive(&busy, &[]);
        b.receive(&WifiMacHeader::rts(me(), peer(), 400), &[]);
        assert!(b.sched.is_empty());
        assert!(b.dcf.is_busy(1400));
        assert!(!b.dcf.is_busy(1501));
    }

    #[test]
    fn test_unicast_data_is_delivered_and_acknowledged() {
        let mut b = Bench::new();
        b.advance_to(500);
        let mut hdr = data_to(me());
        hdr.addr2 = peer();
        hdr.set_duration_us(16 + ACK_TIME);
        b.receive(&hdr, &[9, 8, 7]);

        let received = b.low.take_received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0.data(), &[9, 8, 7]);

        let (at, _) = b.fire();
        assert_eq!(at, 516);
        let ack = b.sent_header(0);
        assert!(ack.is_ack());
        assert_eq!(ack.addr1, peer());
        assert_eq!(ack.duration_us(), 0);
    }

    #[test]
    fn test_qos_no_ack_and_group_frames_are_not_acknowledged() {
        let mut b = Bench::new();
        let mut qos = data_to(me());
        qos.kind = WifiMacType::QosData;
        qos.addr2 = peer();
        qos.qos.ack_policy = crate::frame::QosAckPolicy::NoAck;
        b.receive(&qos, &[1]);
        let mut group = data_to(Mac48Address::BROADCAST);
        group.addr2 = peer();
        b.receive(&group, &[2]);
        assert_eq!(b.low.take_received().len(), 2);
        assert!(b.sched.is_empty());
    }

    #[test]
    fn test_broadcast_ends_without_ack() {
        let mut b = Bench::new();
        b.start(data_to(Mac48Address::BROADCAST), MacLowTransmissionParameters::new());
        assert_eq!(b.sent_header(0).duration_us(), 0);
        let (at, timer) = b.fire();
        assert_eq!(timer, MacTimer::EndTxNoAck);
        assert_eq!(at, DATA_TIME);
        assert_eq!(
            b.low.take_events().into_iter().collect::<Vec<_>>(),
            vec![(TXOP, TxEvent::EndTxNoAck)]
        );
    }

    #[test]
    fn test_fragment_ack_schedules_next_fragment() {
        let mut b = Bench::new();
        let mut params = with_ack();
        params.enable_next_data(100);
        let mut hdr = data_to(peer());
        hdr.more_fragments = true;
        b.start(hdr, params);
        let next_time = ofdm_tx_duration_us(100, WifiMode::OFDM_6MBPS);
        assert_eq!(
            b.sent_header(0).duration_us(),
            16 + ACK_TIME + 16 + next_time + 16 + ACK_TIME
        );
        b.receive(&WifiMacHeader::ack(me(), 0), &[]);
        let (_, timer) = b.fire();
        assert_eq!(timer, MacTimer::WaitSifsAfterEndTx);
        let events: Vec<_> = b.low.take_events().into_iter().map(|(_, e)| e).collect();
        assert!(matches!(events[0], TxEvent::GotAck { .. }));
        assert_eq!(events[1], TxEvent::StartNext);
    }

    #[test]
    fn test_new_transmission_cancels_previous() {
        let mut b = Bench::new();
        let mut params = with_ack();
        params.enable_rts();
        b.start(data_to(peer()), params);
        let (low, mut env) = b.split();
        low.start_transmission(
            &mut env,
            Packet::new(vec![1]),
            data_to(Mac48Address::BROADCAST),
            MacLowTransmissionParameters::new(),
            TxopId(3),
        );
        assert_eq!(
            b.low.take_events().into_iter().collect::<Vec<_>>(),
            vec![(TXOP, TxEvent::Cancel)]
        );
        // Only the broadcast's end-of-transmission timer is left.
        assert_eq!(b.sched.len(), 1);
    }

    #[test]
    fn test_super_fast_ack_reads_the_medium() {
        for (idle, expect_ack) in [(true, false), (false, true)] {
            let mut b = Bench::new();
            let mut params = MacLowTransmissionParameters::new();
            params.enable_super_fast_ack();
            b.start(data_to(peer()), params);
            b.phy.idle = idle;
            let (at, timer) = b.fire();
            assert_eq!(timer, MacTimer::SuperFastAckTimeout);
            assert_eq!(at, DATA_TIME + 25);
            let (_, event) = b.low.take_events().pop_front().unwrap();
            assert_eq!(matches!(event, TxEvent::GotAck { .. }), expect_ack);
        }
    }

    #[test]
    fn test_fast_ack_rx_error_reports_missed_ack() {
        let mut b = Bench::new();
        let mut params = MacLowTransmissionParameters::new();
        params.enable_fast_ack();
        b.start(data_to(peer()), params);
        b.phy.idle = false;
        let (_, timer) = b.fire();
        assert_eq!(timer, MacTimer::FastAckTimeout);
        assert!(b.low.take_events().is_empty());
        {
            let (low, mut env) = b.split();
            low.receive_error(&mut env);
        }
        let (_, timer) = b.fire();
        assert_eq!(timer, MacTimer::FastAckFailedTimeout);
        assert_eq!(
            b.low.take_events().into_iter().collect::<Vec<_>>(),
            vec![(TXOP, TxEvent::MissedAck)]
        );
    }

    #[test]
    fn test_rts_nav_is_reset_when_exchange_never_starts() {
        let mut b = Bench::new();
        b.advance_to(1000);
        b.receive(&WifiMacHeader::rts(Mac48Address::local(5), peer(), 600), &[]);
        assert!(b.dcf.is_busy(1200));
        b.phy.last_rx_start_us = 948;
        let (at, timer) = b.fire();
        assert!(matches!(timer, MacTimer::NavCounterResetCtsMissed { rts_end_rx_us: 1000 }));
        assert_eq!(at, 1000 + CTS_TIME + 32 + 18);
        assert!(!b.dcf.is_busy(at + 1));
        assert!(b.low.is_nav_zero(at + 1));
    }

    #[test]
    fn test_switching_drops_everything() {
        let mut b = Bench::new();
        b.start(data_to(peer()), with_ack());
        let (low, mut env) = b.split();
        low.notify_switching_start_now(&mut env, 100);
        assert!(b.sched.is_empty());
        assert_eq!(
            b.low.take_events().into_iter().collect::<Vec<_>>(),
            vec![(TXOP, TxEvent::Cancel)]
        );
        b.receive(&WifiMacHeader::ack(me(), 0), &[]);
        assert!(b.low.take_events().is_empty());
    }

    #[test]
    fn test_transmission_time_accounts_for_every_frame() {
        let b = Bench::new();
        let packet = Packet::new(vec![0; 100]);
        let hdr = data_to(peer());
        let mut params = with_ack();
        assert_eq!(
            b.low
                .calculate_transmission_time(&b.phy, &b.stations, &packet, &hdr, &params),
            DATA_TIME + 16 + ACK_TIME
        );
        params.enable_rts();
        params.enable_next_data(100);
        let next = ofdm_tx_duration_us(100, WifiMode::OFDM_6MBPS);
        assert_eq!(
            b.low
                .calculate_transmission_time(&b.phy, &b.stations, &packet, &hdr, &params),
            RTS_TIME + CTS_TIME + 32 + DATA_TIME + 16 + ACK_TIME + 16 + next
        );
    }
}
