//! Virtual-time event scheduling.
//!
//! Every suspension point of the MAC (backoff completion, inter-frame
//! spacing, ACK/CTS timeouts) is a scheduled event that is cancelled when it
//! becomes irrelevant. Components talk to the host scheduler only through the
//! [`Timers`] trait; [`Scheduler`] is a deterministic implementation used by
//! the tests and by hosts that have none of their own.

use crate::frame::Mac48Address;
use crate::hal::WifiMode;
use alloc::collections::{BTreeMap, BinaryHeap};
use core::cmp::Reverse;

/// Handle to a scheduled event. Only meaningful for the scheduler that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

/// Every logical timeout slot of the MAC core.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MacTimer {
    /// `DcfManager`: the earliest backoff end among the states requesting access.
    AccessTimeout,
    NormalAckTimeout,
    FastAckTimeout,
    SuperFastAckTimeout,
    /// An RX error was seen while waiting for a fast ACK.
    FastAckFailedTimeout,
    CtsTimeout,
    /// Answer an RTS after SIFS.
    SendCts {
        to: Mac48Address,
        duration_us: u64,
        mode: WifiMode,
        rts_snr: f64,
    },
    /// Acknowledge a unicast frame after SIFS.
    SendAck {
        to: Mac48Address,
        duration_us: u64,
        mode: WifiMode,
        data_snr: f64,
    },
    /// Send the pending data frame SIFS after its CTS arrived.
    SendDataAfterCts { duration_us: u64 },
    /// The next fragment may go out.
    WaitSifsAfterEndTx,
    /// A frame that expects no response left the antenna.
    EndTxNoAck,
    /// Reset an RTS-based NAV if the announced exchange never started.
    NavCounterResetCtsMissed { rts_end_rx_us: u64 },
}

/// The scheduling services the MAC core requires from its host.
pub trait Timers {
    /// Current virtual time in microseconds.
    fn now_us(&self) -> u64;
    /// Schedules `timer` to fire `delay_us` from now.
    fn schedule_in(&mut self, delay_us: u64, timer: MacTimer) -> EventId;
    /// Cancels a pending event. Returns false if it already fired or was cancelled.
    fn cancel(&mut self, id: EventId) -> bool;
    fn is_running(&self, id: EventId) -> bool;
    /// Time left before `id` fires, or `None` if it is not pending.
    fn delay_left_us(&self, id: EventId) -> Option<u64>;
}

/// Holds at most one live event for one logical timer purpose.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerSlot(Option<EventId>);

impl TimerSlot {
    pub fn is_running(&self, timers: &dyn Timers) -> bool {
        self.0.is_some_and(|id| timers.is_running(id))
    }

    /// Arms the slot, cancelling whatever it held before.
    pub fn arm(&mut self, timers: &mut dyn Timers, delay_us: u64, timer: MacTimer) {
        self.cancel(timers);
        self.0 = Some(timers.schedule_in(delay_us, timer));
    }

    /// Cancels the slot. Returns true if an event was still pending.
    pub fn cancel(&mut self, timers: &mut dyn Timers) -> bool {
        match self.0.take() {
            Some(id) => timers.cancel(id),
            None => false,
        }
    }

    pub fn delay_left_us(&self, timers: &dyn Timers) -> Option<u64> {
        self.0.and_then(|id| timers.delay_left_us(id))
    }

    /// Forgets the handle of an event that has just fired.
    pub fn clear(&mut self) {
        self.0 = None;
    }
}

/// A deterministic discrete-event scheduler.
///
/// Events fire in non-decreasing time order; events due at the same instant
/// fire in the order they were scheduled.
#[derive(Debug)]
pub struct Scheduler<E> {
    now_us: u64,
    next_seq: u64,
    // (due time, sequence) min-heap. Cancelled entries stay here until popped.
    queue: BinaryHeap<Reverse<(u64, u64)>>,
    pending: BTreeMap<u64, (u64, E)>,
}

impl<E> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            now_us: 0,
            next_seq: 0,
            queue: BinaryHeap::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    /// Schedules `event` at absolute time `at_us`. Times in the past are clamped to now.
    pub fn schedule_at(&mut self, at_us: u64, event: E) -> EventId {
        let at_us = at_us.max(self.now_us);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse((at_us, seq)));
        self.pending.insert(seq, (at_us, event));
        EventId(seq)
    }

    pub fn schedule_in(&mut self, delay_us: u64, event: E) -> EventId {
        self.schedule_at(self.now_us.saturating_add(delay_us), event)
    }

    pub fn cancel(&mut self, id: EventId) -> bool {
        self.pending.remove(&id.0).is_some()
    }

    pub fn is_running(&self, id: EventId) -> bool {
        self.pending.contains_key(&id.0)
    }

    pub fn delay_left_us(&self, id: EventId) -> Option<u64> {
        self.pending.get(&id.0).map(|(at, _)| at - self.now_us)
    }

    /// Due time of the next live event.
    pub fn peek_time(&mut self) -> Option<u64> {
        while let Some(Reverse((at, seq))) = self.queue.peek().copied() {
            if self.pending.contains_key(&seq) {
                return Some(at);
            }
            self.queue.pop();
        }
        None
    }

    /// Removes the next live event and advances the clock to its due time.
    pub fn pop(&mut self) -> Option<(u64, E)> {
        while let Some(Reverse((at, seq))) = self.queue.pop() {
            if let Some((_, event)) = self.pending.remove(&seq) {
                self.now_us = at;
                return Some((at, event));
            }
        }
        None
    }

    /// Pops the next live event only if it is due at or before `limit_us`.
    pub fn pop_until(&mut self, limit_us: u64) -> Option<(u64, E)> {
        match self.peek_time() {
            Some(at) if at <= limit_us => self.pop(),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

impl<E> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: From<MacTimer>> Timers for Scheduler<E> {
    fn now_us(&self) -> u64 {
        self.now_us
    }

    fn schedule_in(&mut self, delay_us: u64, timer: MacTimer) -> EventId {
        Scheduler::schedule_in(self, delay_us, E::from(timer))
    }

    fn cancel(&mut self, id: EventId) -> bool {
        Scheduler::cancel(self, id)
    }

    fn is_running(&self, id: EventId) -> bool {
        Scheduler::is_running(self, id)
    }

    fn delay_left_us(&self, id: EventId) -> Option<u64> {
        Scheduler::delay_left_us(self, id)
    }
}

/// Lets several MACs share one scheduler: every timer is tagged with the
/// owner's key before it is stored, so the host can route it back.
pub struct TaggedTimers<'a, E, T> {
    scheduler: &'a mut Scheduler<E>,
    tag: T,
}

impl<'a, E, T> TaggedTimers<'a, E, T> {
    pub fn new(scheduler: &'a mut Scheduler<E>, tag: T) -> Self {
        Self { scheduler, tag }
    }
}

impl<E, T> Timers for TaggedTimers<'_, E, T>
where
    T: Copy,
    E: From<(T, MacTimer)>,
{
    fn now_us(&self) -> u64 {
        self.scheduler.now_us()
    }

    fn schedule_in(&mut self, delay_us: u64, timer: MacTimer) -> EventId {
        self.scheduler.schedule_in(delay_us, E::from((self.tag, timer)))
    }

    fn cancel(&mut self, id: EventId) -> bool {
        self.scheduler.cancel(id)
    }

    fn is_running(&self, id: EventId) -> bool {
        self.scheduler.is_running(id)
    }

    fn delay_left_us(&self, id: EventId) -> Option<u64> {
        self.scheduler.delay_left_us(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_ties_fire_in_insertion_order() {
        let mut sched = Scheduler::new();
        sched.schedule_at(10, 'b');
        sched.schedule_at(5, 'a');
        sched.schedule_at(10, 'c');
        sched.schedule_at(10, 'd');
        let order: Vec<char> = core::iter::from_fn(|| sched.pop().map(|(_, e)| e)).collect();
        assert_eq!(order, ['a', 'b', 'c', 'd']);
        assert_eq!(sched.now_us(), 10);
    }

    #[test]
    fn test_cancel_and_delay_left() {
        let mut sched = Scheduler::new();
        let a = sched.schedule_in(30, 1);
        let b = sched.schedule_in(20, 2);
        assert_eq!(sched.delay_left_us(a), Some(30));
        assert!(sched.cancel(b));
        assert!(!sched.cancel(b));
        assert!(!sched.is_running(b));
        assert_eq!(sched.peek_time(), Some(30));
        assert_eq!(sched.pop(), Some((30, 1)));
        assert!(!sched.is_running(a));
        assert_eq!(sched.delay_left_us(a), None);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_past_events_are_clamped() {
        let mut sched = Scheduler::new();
        sched.schedule_at(50, 0);
        sched.pop();
        sched.schedule_at(10, 1);
        assert_eq!(sched.pop(), Some((50, 1)));
    }

    #[derive(Debug, PartialEq)]
    enum Ev {
        Timer(MacTimer),
    }

    impl From<MacTimer> for Ev {
        fn from(t: MacTimer) -> Self {
            Ev::Timer(t)
        }
    }

    #[test]
    fn test_timer_slot_rearm_cancels_previous() {
        let mut sched: Scheduler<Ev> = Scheduler::new();
        let mut slot = TimerSlot::default();
        slot.arm(&mut sched, 40, MacTimer::CtsTimeout);
        slot.arm(&mut sched, 10, MacTimer::NormalAckTimeout);
        assert_eq!(sched.len(), 1);
        assert!(slot.is_running(&sched));
        assert_eq!(slot.delay_left_us(&sched), Some(10));
        assert_eq!(sched.pop(), Some((10, Ev::Timer(MacTimer::NormalAckTimeout))));
        assert!(!slot.is_running(&sched));
        assert!(!slot.cancel(&mut sched));
    }

    #[derive(Debug, PartialEq)]
    struct Routed(u8, MacTimer);

    impl From<(u8, MacTimer)> for Routed {
        fn from((node, timer): (u8, MacTimer)) -> Self {
            Routed(node, timer)
        }
    }

    #[test]
    fn test_tagged_timers_route_by_owner() {
        let mut sched: Scheduler<Routed> = Scheduler::new();
        TaggedTimers::new(&mut sched, 2).schedule_in(5, MacTimer::AccessTimeout);
        TaggedTimers::new(&mut sched, 1).schedule_in(5, MacTimer::EndTxNoAck);
        assert_eq!(sched.pop(), Some((5, Routed(2, MacTimer::AccessTimeout))));
        assert_eq!(sched.pop(), Some((5, Routed(1, MacTimer::EndTxNoAck))));
    }
}
