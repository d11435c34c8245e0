//! CiHub HTTP surface.
//!
//! Maps the control-plane API onto [`engine::Aggregator`] operations. Every
//! response, including failures and undecodable requests, uses the
//! `{success, data}` envelope; failed responses carry `data = {kind, message}`
//! with a stable snake_case `kind` so callers can tell an unreachable node from
//! rejected credentials without parsing messages.
//!
//! ## Architectural Layer
//!
//! **Interface.** No business rules live here: handlers decode, call the engine,
//! and encode.

mod envelope;
mod requests;
mod routes;

pub use envelope::{ApiError, Envelope};
pub use requests::{ConsoleRequest, ControlRequest, Health, JobState};
pub use routes::router;
