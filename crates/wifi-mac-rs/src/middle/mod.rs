pub mod rx;
pub mod tx;

pub use rx::{MacRxMiddle, OriginatorRxStatus};
pub use tx::MacTxMiddle;
