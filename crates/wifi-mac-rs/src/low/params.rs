use core::fmt;

/// Which acknowledgment the sender waits for after a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitAck {
    #[default]
    None,
    /// Wait the full ACK timeout for an explicit ACK.
    Normal,
    /// Wait PIFS; a busy medium means a response is on its way.
    Fast,
    /// Wait PIFS; a busy medium is taken as the ACK itself.
    SuperFast,
}

/// How `MacLow` should carry out one transmission.
///
/// The default sends a single frame without RTS, without waiting for an ACK
/// and with a computed duration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacLowTransmissionParameters {
    next_size: usize,
    wait_ack: WaitAck,
    send_rts: bool,
    override_duration_id_us: Option<u64>,
}

impl MacLowTransmissionParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Another fragment of `size` bytes follows this one after SIFS.
    pub fn enable_next_data(&mut self, size: usize) {
        self.next_size = size;
    }

    pub fn disable_next_data(&mut self) {
        self.next_size = 0;
    }

    /// Uses `duration_us` as the duration field instead of computing it.
    pub fn enable_override_duration_id(&mut self, duration_us: u64) {
        self.override_duration_id_us = Some(duration_us);
    }

    pub fn disable_override_duration_id(&mut self) {
        self.override_duration_id_us = None;
    }

    pub fn enable_super_fast_ack(&mut self) {
        self.wait_ack = WaitAck::SuperFast;
    }

    pub fn enable_fast_ack(&mut self) {
        self.wait_ack = WaitAck::Fast;
    }

    pub fn enable_ack(&mut self) {
        self.wait_ack = WaitAck::Normal;
    }

    pub fn disable_ack(&mut self) {
        self.wait_ack = WaitAck::None;
    }

    pub fn enable_rts(&mut self) {
        self.send_rts = true;
    }

    pub fn disable_rts(&mut self) {
        self.send_rts = false;
    }

    pub fn wait_ack(&self) -> WaitAck {
        self.wait_ack
    }

    pub fn must_wait_ack(&self) -> bool {
        self.wait_ack != WaitAck::None
    }

    pub fn must_wait_normal_ack(&self) -> bool {
        self.wait_ack == WaitAck::Normal
    }

    pub fn must_wait_fast_ack(&self) -> bool {
        self.wait_ack == WaitAck::Fast
    }

    pub fn must_wait_super_fast_ack(&self) -> bool {
        self.wait_ack == WaitAck::SuperFast
    }

    pub fn must_send_rts(&self) -> bool {
        self.send_rts
    }

    pub fn has_duration_id(&self) -> bool {
        self.override_duration_id_us.is_some()
    }

    pub fn duration_id(&self) -> u64 {
        debug_assert!(self.has_duration_id());
        self.override_duration_id_us.unwrap_or(0)
    }

    pub fn has_next_packet(&self) -> bool {
        self.next_size != 0
    }

    pub fn next_packet_size(&self) -> usize {
        debug_assert!(self.has_next_packet());
        self.next_size
    }
}

impl fmt::Display for MacLowTransmissionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[send rts={}, next size={}, ", self.send_rts, self.next_size)?;
        match self.override_duration_id_us {
            Some(d) => write!(f, "dur={d}us, ")?,
            None => write!(f, "dur=auto, ")?,
        }
        let ack = match self.wait_ack {
            WaitAck::None => "none",
            WaitAck::Normal => "normal",
            WaitAck::Fast => "fast",
            WaitAck::SuperFast => "super-fast",
        };
        write!(f, "ack={ack}]")
    }
}
