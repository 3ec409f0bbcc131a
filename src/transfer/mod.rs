//! Moving file bytes between parties over one-shot sockets.

pub mod actions;
pub mod helper;
pub mod queue;
pub mod throttle;

pub use actions::{Direction, TransferAction};
pub use helper::{TransferHelper, TransferSettings};
pub use queue::TransferQueue;
pub use throttle::{BandwidthLimit, BandwidthLimiter};
