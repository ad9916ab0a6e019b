//! Intercom Gateway - HTTP and WebSocket surface over registry, broker and orchestrator

pub mod error;
pub mod routes;
pub mod server;
pub mod ws;

pub use error::ApiError;
pub use server::{build_router, start_gateway, AppState};
