use super::state::DcfState;
use crate::sched::{MacTimer, TimerSlot, Timers};
use alloc::vec::Vec;
use log::{debug, trace};

/// Handle of a [`DcfState`] registered with a [`DcfManager`].
/// Lower indices were registered first and win internal collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DcfId(pub(crate) usize);

impl DcfId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Receives the outcome of channel access arbitration for every registered state.
///
/// Handlers get the manager back so they can restart a backoff, and the timers
/// so they can read the clock. They must not call [`DcfManager::request_access`]
/// re-entrantly; an owner that wants access again queues the request and
/// issues it once the handler returned.
pub trait DcfListener {
    fn notify_access_granted(&mut self, id: DcfId, dcf: &mut DcfManager, timers: &mut dyn Timers);
    fn notify_internal_collision(
        &mut self,
        id: DcfId,
        dcf: &mut DcfManager,
        timers: &mut dyn Timers,
    );
    fn notify_collision(&mut self, id: DcfId, dcf: &mut DcfManager, timers: &mut dyn Timers);
    fn notify_channel_switching(
        &mut self,
        _id: DcfId,
        _dcf: &mut DcfManager,
        _timers: &mut dyn Timers,
    ) {
    }
    fn notify_sleep(&mut self, _id: DcfId, _dcf: &mut DcfManager, _timers: &mut dyn Timers) {}
    fn notify_wake_up(&mut self, _id: DcfId, _dcf: &mut DcfManager, _timers: &mut dyn Timers) {}
}

/// Inter-frame timing the manager arbitrates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DcfConfig {
    pub slot_us: u64,
    pub sifs_us: u64,
    /// EIFS minus DIFS: the extra deferral after a reception error.
    pub eifs_no_difs_us: u64,
}

impl Default for DcfConfig {
    /// 802.11a OFDM timing. EIFS-DIFS is SIFS plus an ACK at 6 Mb/s.
    fn default() -> Self {
        Self {
            slot_us: 9,
            sifs_us: 16,
            eifs_no_difs_us: 16 + 44,
        }
    }
}

/// Merges every source of medium occupancy and grants access to one
/// [`DcfState`] per transmit opportunity.
///
/// The medium is tracked through the last RX, TX, NAV, CCA-busy, ACK/CTS
/// timeout and channel switching intervals. Each state counts its backoff
/// down from `access_grant_start() + aifsn * slot`; when several states reach
/// zero at once, the first registered one is granted and the others get an
/// internal collision.
#[derive(Debug)]
pub struct DcfManager {
    states: Vec<DcfState>,
    slot_us: u64,
    sifs_us: u64,
    eifs_no_difs_us: u64,

    last_ack_timeout_end_us: u64,
    last_cts_timeout_end_us: u64,
    last_nav_start_us: u64,
    last_nav_duration_us: u64,
    last_rx_start_us: u64,
    last_rx_duration_us: u64,
    last_rx_received_ok: bool,
    last_rx_end_us: u64,
    last_tx_start_us: u64,
    last_tx_duration_us: u64,
    last_busy_start_us: u64,
    last_busy_duration_us: u64,
    last_switching_start_us: u64,
    last_switching_duration_us: u64,
    rxing: bool,
    sleeping: bool,

    access_timeout: TimerSlot,
}

impl DcfManager {
    pub fn new(config: DcfConfig) -> Self {
        Self {
            states: Vec::new(),
            slot_us: config.slot_us,
            sifs_us: config.sifs_us,
            eifs_no_difs_us: config.eifs_no_difs_us,
            last_ack_timeout_end_us: 0,
            last_cts_timeout_end_us: 0,
            last_nav_start_us: 0,
            last_nav_duration_us: 0,
            last_rx_start_us: 0,
            last_rx_duration_us: 0,
            last_rx_received_ok: true,
            last_rx_end_us: 0,
            last_tx_start_us: 0,
            last_tx_duration_us: 0,
            last_busy_start_us: 0,
            last_busy_duration_us: 0,
            last_switching_start_us: 0,
            last_switching_duration_us: 0,
            rxing: false,
            sleeping: false,
            access_timeout: TimerSlot::default(),
        }
    }

    pub fn set_slot(&mut self, slot_us: u64) {
        self.slot_us = slot_us;
    }

    pub fn set_sifs(&mut self, sifs_us: u64) {
        self.sifs_us = sifs_us;
    }

    pub fn set_eifs_no_difs(&mut self, eifs_no_difs_us: u64) {
        self.eifs_no_difs_us = eifs_no_difs_us;
    }

    pub fn eifs_no_difs(&self) -> u64 {
        self.eifs_no_difs_us
    }

    /// Registers a state. Registration order is priority order.
    pub fn add(&mut self, state: DcfState) -> DcfId {
        self.states.push(state);
        DcfId(self.states.len() - 1)
    }

    pub fn state(&self, id: DcfId) -> &DcfState {
        &self.states[id.0]
    }

    pub fn state_mut(&mut self, id: DcfId) -> &mut DcfState {
        &mut self.states[id.0]
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    /// True while receiving, transmitting or inside the NAV.
    pub fn is_busy(&self, now_us: u64) -> bool {
        self.rxing
            || self.last_tx_start_us + self.last_tx_duration_us > now_us
            || self.last_nav_start_us + self.last_nav_duration_us > now_us
    }

    /// Earliest time the medium counts as idle, SIFS included.
    pub fn access_grant_start(&self) -> u64 {
        let rx_access_start = if self.rxing {
            self.last_rx_start_us + self.last_rx_duration_us + self.sifs_us
        } else if self.last_rx_received_ok {
            self.last_rx_end_us + self.sifs_us
        } else {
            self.last_rx_end_us + self.sifs_us + self.eifs_no_difs_us
        };
        let busy_access_start = self.last_busy_start_us + self.last_busy_duration_us + self.sifs_us;
        let tx_access_start = self.last_tx_start_us + self.last_tx_duration_us + self.sifs_us;
        let nav_access_start = self.last_nav_start_us + self.last_nav_duration_us + self.sifs_us;
        let ack_timeout_access_start = self.last_ack_timeout_end_us + self.sifs_us;
        let cts_timeout_access_start = self.last_cts_timeout_end_us + self.sifs_us;
        let switching_access_start =
            self.last_switching_start_us + self.last_switching_duration_us + self.sifs_us;
        [
            rx_access_start,
            busy_access_start,
            tx_access_start,
            nav_access_start,
            ack_timeout_access_start,
            cts_timeout_access_start,
            switching_access_start,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    fn backoff_start_of(&self, state: &DcfState) -> u64 {
        state
            .backoff_start_us()
            .max(self.access_grant_start() + state.aifsn() as u64 * self.slot_us)
    }

    fn backoff_end_of(&self, state: &DcfState) -> u64 {
        self.backoff_start_of(state) + state.backoff_slots() as u64 * self.slot_us
    }

    pub fn backoff_start_for(&self, id: DcfId) -> u64 {
        self.backoff_start_of(&self.states[id.0])
    }

    pub fn backoff_end_for(&self, id: DcfId) -> u64 {
        self.backoff_end_of(&self.states[id.0])
    }

    /// Charges every state for the idle slots elapsed since its backoff (re)started.
    /// A slot interrupted by a busy period is not consumed.
    fn update_backoff(&mut self, now_us: u64) {
        for i in 0..self.states.len() {
            let backoff_start = self.backoff_start_of(&self.states[i]);
            if backoff_start > now_us {
                continue;
            }
            let state = &mut self.states[i];
            let elapsed_slots = (now_us - backoff_start)
                .checked_div(self.slot_us)
                .unwrap_or(u64::MAX);
            let n = elapsed_slots.min(state.backoff_slots() as u64) as u32;
            if n > 0 {
                trace!("dcf {i} dec backoff slots={n}");
            }
            let bound = backoff_start + n as u64 * self.slot_us;
            state.update_backoff_slots_now(n, bound);
        }
    }

    /// Asks for a transmit opportunity for `id`. The grant arrives through
    /// `listener`, possibly before this call returns.
    pub fn request_access(
        &mut self,
        id: DcfId,
        timers: &mut dyn Timers,
        listener: &mut dyn DcfListener,
    ) {
        if self.sleeping {
            debug!("dcf {} access request denied while sleeping", id.0);
            return;
        }
        let now_us = timers.now_us();
        self.update_backoff(now_us);
        debug_assert!(!self.states[id.0].access_requested);
        self.states[id.0].access_requested = true;
        // Someone else took the medium: the state has to back off first.
        if self.states[id.0].backoff_slots() == 0 && self.is_busy(now_us) {
            debug!("dcf {} medium is busy: collision", id.0);
            listener.notify_collision(id, self, timers);
        }
        self.do_grant_access(timers, listener);
        self.restart_access_timeout_if_needed(timers);
    }

    /// Handler of [`MacTimer::AccessTimeout`].
    pub fn access_timeout(&mut self, timers: &mut dyn Timers, listener: &mut dyn DcfListener) {
        self.access_timeout.clear();
        self.update_backoff(timers.now_us());
        self.do_grant_access(timers, listener);
        self.restart_access_timeout_if_needed(timers);
    }

    fn do_grant_access(&mut self, timers: &mut dyn Timers, listener: &mut dyn DcfListener) {
        let now_us = timers.now_us();
        let ready = |dcf: &Self, i: usize| {
            let state = &dcf.states[i];
            state.is_access_requested() && dcf.backoff_end_of(state) <= now_us
        };
        let Some(winner) = (0..self.states.len()).find(|&i| ready(self, i)) else {
            return;
        };
        // Collect first, notify after: notifications may change the manager.
        let collided: Vec<usize> = (winner + 1..self.states.len())
            .filter(|&i| ready(self, i))
            .collect();
        debug!(
            "dcf {winner} access granted, slots={}",
            self.states[winner].backoff_slots()
        );
        self.states[winner].access_requested = false;
        listener.notify_access_granted(DcfId(winner), self, timers);
        for i in collided {
            debug!("dcf {i} internal collision");
            listener.notify_internal_collision(DcfId(i), self, timers);
        }
    }

    /// Arms the access timeout for the earliest pending backoff end. The timer
    /// is only ever moved earlier.
    fn restart_access_timeout_if_needed(&mut self, timers: &mut dyn Timers) {
        let now_us = timers.now_us();
        let expected_backoff_end = self
            .states
            .iter()
            .filter(|s| s.is_access_requested())
            .map(|s| self.backoff_end_of(s))
            .filter(|&end| end > now_us)
            .min();
        let Some(end) = expected_backoff_end else {
            return;
        };
        let delay = end - now_us;
        if self
            .access_timeout
            .delay_left_us(timers)
            .is_some_and(|left| left > delay)
        {
            self.access_timeout.cancel(timers);
        }
        if !self.access_timeout.is_running(timers) {
            trace!("access timeout in {delay}us");
            self.access_timeout
                .arm(timers, delay, MacTimer::AccessTimeout);
        }
    }

    // --- Medium notifications ---

    pub fn notify_rx_start_now(&mut self, now_us: u64, duration_us: u64) {
        trace!("rx start for {duration_us}us");
        self.update_backoff(now_us);
        self.last_rx_start_us = now_us;
        self.last_rx_duration_us = duration_us;
        self.rxing = true;
    }

    pub fn notify_rx_end_ok_now(&mut self, now_us: u64) {
        trace!("rx end ok");
        self.last_rx_end_us = now_us;
        self.last_rx_received_ok = true;
        self.rxing = false;
    }

    pub fn notify_rx_end_error_now(&mut self, now_us: u64) {
        trace!("rx end error");
        self.last_rx_end_us = now_us;
        self.last_rx_received_ok = false;
        self.rxing = false;
    }

    fn truncate_rx(&mut self, now_us: u64) {
        self.last_rx_end_us = now_us;
        self.last_rx_duration_us = now_us - self.last_rx_start_us;
        self.last_rx_received_ok = true;
        self.rxing = false;
    }

    pub fn notify_tx_start_now(&mut self, now_us: u64, duration_us: u64) {
        if self.rxing {
            // A reception that started inside SIFS is abandoned.
            self.truncate_rx(now_us);
        }
        trace!("tx start for {duration_us}us");
        self.update_backoff(now_us);
        self.last_tx_start_us = now_us;
        self.last_tx_duration_us = duration_us;
    }

    pub fn notify_maybe_cca_busy_start_now(&mut self, now_us: u64, duration_us: u64) {
        trace!("busy start for {duration_us}us");
        self.update_backoff(now_us);
        self.last_busy_start_us = now_us;
        self.last_busy_duration_us = duration_us;
    }

    /// Sets the NAV unconditionally, e.g. after a CF-Poll. May move the access
    /// timeout earlier.
    pub fn notify_nav_reset_now(&mut self, timers: &mut dyn Timers, duration_us: u64) {
        let now_us = timers.now_us();
        trace!("nav reset for {duration_us}us");
        self.update_backoff(now_us);
        self.last_nav_start_us = now_us;
        self.last_nav_duration_us = duration_us;
        self.update_backoff(now_us);
        self.restart_access_timeout_if_needed(timers);
    }

    /// Extends the NAV if `now + duration` ends later than the current one.
    pub fn notify_nav_start_now(&mut self, now_us: u64, duration_us: u64) {
        trace!("nav start for {duration_us}us");
        self.update_backoff(now_us);
        let new_nav_end = now_us + duration_us;
        if new_nav_end > self.last_nav_start_us + self.last_nav_duration_us {
            self.last_nav_start_us = now_us;
            self.last_nav_duration_us = duration_us;
        }
    }

    pub fn notify_ack_timeout_start_now(&mut self, now_us: u64, duration_us: u64) {
        self.last_ack_timeout_end_us = now_us + duration_us;
    }

    pub fn notify_ack_timeout_reset_now(&mut self, timers: &mut dyn Timers) {
        self.last_ack_timeout_end_us = timers.now_us();
        self.restart_access_timeout_if_needed(timers);
    }

    pub fn notify_cts_timeout_start_now(&mut self, now_us: u64, duration_us: u64) {
        self.last_cts_timeout_end_us = now_us + duration_us;
    }

    pub fn notify_cts_timeout_reset_now(&mut self, timers: &mut dyn Timers) {
        self.last_cts_timeout_end_us = timers.now_us();
        self.restart_access_timeout_if_needed(timers);
    }

    /// The PHY leaves the channel for `duration_us`. Everything in flight is
    /// forgotten: pending medium intervals end now, backoffs and windows are
    /// reset and access requests are dropped.
    pub fn notify_switching_start_now(
        &mut self,
        timers: &mut dyn Timers,
        listener: &mut dyn DcfListener,
        duration_us: u64,
    ) {
        let now_us = timers.now_us();
        if self.rxing {
            self.truncate_rx(now_us);
        }
        if self.last_nav_start_us + self.last_nav_duration_us > now_us {
            self.last_nav_duration_us = now_us - self.last_nav_start_us;
        }
        if self.last_busy_start_us + self.last_busy_duration_us > now_us {
            self.last_busy_duration_us = now_us - self.last_busy_start_us;
        }
        self.last_ack_timeout_end_us = self.last_ack_timeout_end_us.min(now_us);
        self.last_cts_timeout_end_us = self.last_cts_timeout_end_us.min(now_us);
        self.access_timeout.cancel(timers);

        for i in 0..self.states.len() {
            self.reset_state(i, now_us);
            listener.notify_channel_switching(DcfId(i), self, timers);
        }
        debug!("switching start for {duration_us}us");
        self.last_switching_start_us = now_us;
        self.last_switching_duration_us = duration_us;
    }

    /// Denies every access request until [`Self::notify_wakeup_now`].
    pub fn notify_sleep_now(&mut self, timers: &mut dyn Timers, listener: &mut dyn DcfListener) {
        self.sleeping = true;
        self.access_timeout.cancel(timers);
        for i in 0..self.states.len() {
            listener.notify_sleep(DcfId(i), self, timers);
        }
    }

    pub fn notify_wakeup_now(&mut self, timers: &mut dyn Timers, listener: &mut dyn DcfListener) {
        self.sleeping = false;
        let now_us = timers.now_us();
        for i in 0..self.states.len() {
            self.reset_state(i, now_us);
            listener.notify_wake_up(DcfId(i), self, timers);
        }
    }

    fn reset_state(&mut self, i: usize, now_us: u64) {
        let state = &mut self.states[i];
        let remaining = state.backoff_slots();
        if remaining > 0 {
            state.update_backoff_slots_now(remaining, now_us);
        }
        state.reset_cw();
        state.access_requested = false;
    }
}
