//! Timing knobs for the aggregation engine.

use std::time::Duration;

/// Timeouts and cache lifetimes used by [`crate::Aggregator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Upper bound for a single adapter call. Exceeding it is reported as
    /// [`hub::RemoteError::Unreachable`].
    pub call_timeout: Duration,
    /// Upper bound for one node's share of a cross-node listing. The view
    /// listing and the job listings each get part of it, so it should hold
    /// two call timeouts.
    pub fanout_timeout: Duration,
    /// How long view and job listings are served from cache without asking
    /// the node again.
    pub view_cache_ttl: Duration,
    /// How long console and pipeline answers are shared between pollers.
    pub poll_ttl: Duration,
    /// After a successful start, repeat starts of the same job within this
    /// window are answered locally.
    pub start_grace: Duration,
    /// How long expired entries are kept as last-known-good fallback before
    /// the sweeper drops them.
    pub retention: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            fanout_timeout: Duration::from_secs(20),
            view_cache_ttl: Duration::from_secs(30),
            poll_ttl: Duration::from_secs(2),
            start_grace: Duration::from_secs(10),
            retention: Duration::from_secs(600),
        }
    }
}
