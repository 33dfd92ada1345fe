//! Worker registry and assignment table
//!
//! The StateManager owns both tables behind a single lock so no caller can observe
//! a worker removed while its assignments remain.

mod manager;
mod messages;

pub use manager::{ManagerMetrics, StateManager};
pub use messages::{StateError, StateEvent, StateResponse};
