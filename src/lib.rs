// Library module for treesync
// Re-exports modules for use in integration tests and the binary

pub mod config;
pub mod error;
pub mod fs;
pub mod net;
pub mod node;
pub mod sync;
pub mod transfer;

pub use error::{Result, SyncError};
