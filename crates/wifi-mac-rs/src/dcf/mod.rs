//! Distributed coordination: contention states and the arbiter that
//! grants them the medium.

pub mod manager;
pub mod state;

pub use manager::{DcfConfig, DcfId, DcfListener, DcfManager};
pub use state::DcfState;
