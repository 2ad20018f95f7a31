#![cfg_attr(not(any(feature = "std", test)), no_std)]

// 'alloc' is used for dynamic allocation (frames, queues, scheduler heaps)
extern crate alloc;

// --- Foundation Modules ---
pub mod types;
pub mod hal;
mod log;
pub mod sched;

// --- Frames and Queues ---
pub mod frame;
pub mod queue;
pub mod station;
pub mod middle;

// --- Channel Access ---
pub mod dcf;
pub mod low;
pub mod txop;

// --- Station MAC ---
pub mod mac;

// --- Top-level Exports ---
pub use types::{Tid, TypeOfStation};
pub use hal::{Phy, WifiMacError, WifiMode};
pub use sched::{EventId, MacTimer, Scheduler, TaggedTimers, Timers};
pub use frame::{Codec, Mac48Address, Packet, WifiMacHeader, WifiMacType};
pub use queue::WifiMacQueue;
pub use station::{ConstantRateStationManager, RemoteStationManager, StationManagerConfig};
pub use dcf::{DcfConfig, DcfManager, DcfState};
pub use low::{MacLow, MacLowConfig, MacLowTransmissionParameters, TxEvent};
pub use txop::{AccessCategory, Txop, TxopConfig};
pub use mac::{MacConfig, MacEvent, WifiMac};
