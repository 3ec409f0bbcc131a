//! Reconciliation strategies and the engine that keeps parties in step.

pub mod driver;
pub mod engine;
pub mod party;
pub mod strategy;

pub use driver::{SyncReport, SyncSubject};
pub use engine::{Engine, EngineConfig};
pub use party::{Party, PartyId};
pub use strategy::{DeleteFlags, SyncAction, SyncStrategy};
