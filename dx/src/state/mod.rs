//! State management with actor pattern
//!
//! StateManager owns a run's TaskGraphStore and processes messages via
//! channels, providing serialized async access to persistent state.

mod manager;
mod messages;
mod recovery;

pub use manager::StateManager;
pub use messages::{StateCommand, StateError, StateResponse};
pub use recovery::{RecoveryScan, recover, scan_for_recovery};
