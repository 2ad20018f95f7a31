/// Contention state of one access category: AIFSN, contention window and the
/// backoff counter.
///
/// A `DcfState` has no notion of the medium. The [`DcfManager`](super::DcfManager)
/// it is registered with decrements the counter while the medium is idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcfState {
    aifsn: u32,
    cw_min: u32,
    cw_max: u32,
    cw: u32,
    backoff_slots: u32,
    backoff_start_us: u64,
    pub(super) access_requested: bool,
}

impl DcfState {
    pub fn new(aifsn: u32, cw_min: u32, cw_max: u32) -> Self {
        Self {
            aifsn,
            cw_min,
            cw_max,
            cw: cw_min,
            backoff_slots: 0,
            backoff_start_us: 0,
            access_requested: false,
        }
    }

    pub fn set_aifsn(&mut self, aifsn: u32) {
        self.aifsn = aifsn;
    }

    /// Also resets the current window.
    pub fn set_cw_min(&mut self, cw_min: u32) {
        self.cw_min = cw_min;
        self.reset_cw();
    }

    /// Also resets the current window.
    pub fn set_cw_max(&mut self, cw_max: u32) {
        self.cw_max = cw_max;
        self.reset_cw();
    }

    pub fn aifsn(&self) -> u32 {
        self.aifsn
    }

    pub fn cw_min(&self) -> u32 {
        self.cw_min
    }

    pub fn cw_max(&self) -> u32 {
        self.cw_max
    }

    pub fn cw(&self) -> u32 {
        self.cw
    }

    pub fn reset_cw(&mut self) {
        self.cw = self.cw_min;
    }

    /// Doubles the window after a failed attempt.
    /// (IEEE 802.11-2012, Section 9.19.2.5)
    pub fn update_failed_cw(&mut self) {
        self.cw = (2 * (self.cw + 1) - 1).min(self.cw_max);
    }

    /// Starts a new backoff of `n_slots` slots counted from `now_us`.
    pub fn start_backoff_now(&mut self, n_slots: u32, now_us: u64) {
        self.backoff_slots = n_slots;
        self.backoff_start_us = now_us;
    }

    /// Consumes `n_slots` slots; counting resumes from `bound_us`.
    pub fn update_backoff_slots_now(&mut self, n_slots: u32, bound_us: u64) {
        self.backoff_slots -= n_slots.min(self.backoff_slots);
        self.backoff_start_us = bound_us;
    }

    pub fn backoff_slots(&self) -> u32 {
        self.backoff_slots
    }

    pub fn backoff_start_us(&self) -> u64 {
        self.backoff_start_us
    }

    pub fn is_access_requested(&self) -> bool {
        self.access_requested
    }
}
