//! Intercom Core - Types, configuration, and error handling shared by the
//! registry, broker, orchestrator and gateway crates.

pub mod clock;
pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use error::{Error, Result};
pub use protocol::*;
pub use types::*;
