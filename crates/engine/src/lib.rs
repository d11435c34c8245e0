//! CiHub aggregation engine.
//!
//! Owns everything between the HTTP edge and the adapters: the node registry,
//! the listing caches with last-known-good fallback, the console/pipeline
//! poller that coalesces identical polls, and the control proxy.
//!
//! ## Architectural Layer
//!
//! **Application.** Depends only on the port traits in `hub`. Adapters are
//! injected through [`RemoteClients`]; persistence through a
//! [`hub::NodeStore`] ([`MemoryNodeStore`] or [`JsonFileNodeStore`]).
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | `engine` | [`Aggregator`]: every public operation, partial-failure policy |
//! | `registry` | Node registry over a write-through store |
//! | `cache` | Sharded TTL cache with invalidation fencing; per-key async slots |
//! | `poller` | Console snapshots and coalesced pipeline reads |
//! | `clients` | Node kind → adapter table |
//! | `store` | In-memory and JSON-file node stores |
//! | `settings` | Timeouts and cache lifetimes |
//!
//! ## Locking
//!
//! No lock is global. Cache entries are sharded; console, pipeline and start
//! state each get one async mutex per key. Registry writes are admitted one
//! at a time; registry reads never wait.

mod cache;
mod clients;
mod engine;
mod poller;
mod registry;
mod settings;
mod store;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use clients::RemoteClients;
pub use engine::{Aggregator, ConsoleRead, Target};
pub use settings::EngineSettings;
pub use store::{JsonFileNodeStore, MemoryNodeStore};
