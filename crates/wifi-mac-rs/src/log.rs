use crate::frame::Mac48Address;
use alloc::format;
use alloc::string::String;

/// Implemented by anything that can tag a log line with where it came from.
pub trait LogMetadata {
    fn meta(&self) -> String;
}

/// Identifies one MAC component of one station.
#[derive(Debug, Clone, Copy)]
pub struct LogContext {
    pub component: &'static str,
    pub address: Mac48Address,
}

impl LogContext {
    pub const fn new(component: &'static str, address: Mac48Address) -> Self {
        Self { component, address }
    }
}

impl LogMetadata for LogContext {
    fn meta(&self) -> String {
        format!("wifi/{} {}", self.component, self.address)
    }
}

// =============================================
// Logging Macros (namespaced under crate::log)
// =============================================

// The metadata string is only built when the level is enabled.
macro_rules! mac_log {
    ($lvl:expr, $ctx:expr, $fmt:literal $(, $($arg:tt)+)?) => {{
        if ::log::log_enabled!($lvl) {
            let meta = $crate::log::LogMetadata::meta(&$ctx);
            ::log::log!($lvl, concat!("[{}] ", $fmt), meta $(, $($arg)+)?);
        }
    }};
}

macro_rules! mac_info {
    ($ctx:expr, $($rest:tt)+) => { $crate::log::mac_log!(::log::Level::Info, $ctx, $($rest)+) };
}

macro_rules! mac_warn {
    ($ctx:expr, $($rest:tt)+) => { $crate::log::mac_log!(::log::Level::Warn, $ctx, $($rest)+) };
}

macro_rules! mac_error {
    ($ctx:expr, $($rest:tt)+) => { $crate::log::mac_log!(::log::Level::Error, $ctx, $($rest)+) };
}

macro_rules! mac_debug {
    ($ctx:expr, $($rest:tt)+) => { $crate::log::mac_log!(::log::Level::Debug, $ctx, $($rest)+) };
}

macro_rules! mac_trace {
    ($ctx:expr, $($rest:tt)+) => { $crate::log::mac_log!(::log::Level::Trace, $ctx, $($rest)+) };
}

// Re-export macros for use in other files
pub(crate) use mac_log;
pub(crate) use mac_info;
pub(crate) use mac_warn;
pub(crate) use mac_error;
pub(crate) use mac_debug;
pub(crate) use mac_trace;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_context_meta() {
        let ctx = LogContext::new("low", Mac48Address::new([0, 0, 0, 0, 0, 0x0a]));
        assert_eq!(ctx.meta(), "wifi/low 00:00:00:00:00:0a");
    }
}
