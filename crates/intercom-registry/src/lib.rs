//! Intercom Registry - service discovery with heartbeat liveness

pub mod reaper;
pub mod registry;

pub use reaper::spawn_reaper;
pub use registry::ServiceRegistry;
