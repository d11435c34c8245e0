//! Port traits implemented by infrastructure crates.
//!
//! - [`RemoteClient`]: the capability set the engine needs from one node
//!   family. One implementation per family (the `jenkins` crate provides the
//!   Jenkins one); selected per node by [`crate::NodeKind`].
//! - [`NodeStore`]: the key-value contract for durable registry entries.
//!
//! Implementations of [`RemoteClient`] are stateless per call: everything a
//! call needs arrives in its [`CallContext`], so one instance can serve any
//! number of nodes concurrently.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    Build, BuildNumber, BuildSelector, ConsoleChunk, Job, JobName, Node, NodeConnection, NodeId,
    PipelineOverview, RemoteError, StageId, StageLog, StoreError, View, ViewId, ViewSpec,
    ViewUpdate,
};

/// Per-call inputs: who to talk to and how long the caller is willing to wait.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Resolved target node.
    pub connection: NodeConnection,
    /// Upper bound for the whole call, including any adapter-internal retries.
    pub timeout: Duration,
}

impl CallContext {
    /// Creates a call context.
    pub fn new(connection: NodeConnection, timeout: Duration) -> Self {
        Self {
            connection,
            timeout,
        }
    }
}

/// Capability set of one remote CI system family.
///
/// Every method returns either its result or a typed [`RemoteError`]. Adapters
/// may retry idempotent reads on [`RemoteError::Unreachable`] within the call
/// timeout; they never retry the mutating methods.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Lists all views on the node.
    async fn list_views(&self, ctx: &CallContext) -> Result<Vec<View>, RemoteError>;

    /// Reads one view.
    async fn get_view(&self, ctx: &CallContext, view: &ViewId) -> Result<View, RemoteError>;

    /// Creates a view and returns it as the node now reports it.
    async fn create_view(&self, ctx: &CallContext, spec: &ViewSpec) -> Result<View, RemoteError>;

    /// Updates a view and returns it as the node now reports it.
    async fn update_view(
        &self,
        ctx: &CallContext,
        view: &ViewId,
        update: &ViewUpdate,
    ) -> Result<View, RemoteError>;

    /// Deletes a view. Jobs in the view are not affected.
    async fn delete_view(&self, ctx: &CallContext, view: &ViewId) -> Result<(), RemoteError>;

    /// Lists the jobs of a view with their current status.
    async fn list_jobs(&self, ctx: &CallContext, view: &ViewId) -> Result<Vec<Job>, RemoteError>;

    /// Reads one job's current status.
    async fn get_job(&self, ctx: &CallContext, job: &JobName) -> Result<Job, RemoteError>;

    /// Triggers a new build of the job.
    async fn start_job(&self, ctx: &CallContext, job: &JobName) -> Result<(), RemoteError>;

    /// Aborts the job's running build, if any.
    async fn stop_job(&self, ctx: &CallContext, job: &JobName) -> Result<(), RemoteError>;

    /// Reads console text of a build starting at byte `offset`.
    async fn get_console(
        &self,
        ctx: &CallContext,
        job: &JobName,
        build: BuildNumber,
        offset: u64,
    ) -> Result<ConsoleChunk, RemoteError>;

    /// Reads the stage overview of a pipeline build.
    async fn get_pipeline_overview(
        &self,
        ctx: &CallContext,
        job: &JobName,
        build: BuildNumber,
    ) -> Result<PipelineOverview, RemoteError>;

    /// Reads the log of one pipeline stage.
    async fn get_pipeline_console(
        &self,
        ctx: &CallContext,
        job: &JobName,
        build: BuildNumber,
        stage: &StageId,
    ) -> Result<StageLog, RemoteError>;

    /// Reads a build addressed absolutely or relative to another build.
    async fn get_build(
        &self,
        ctx: &CallContext,
        job: &JobName,
        selector: BuildSelector,
    ) -> Result<Build, RemoteError>;

    /// Deletes a build and its logs.
    async fn delete_build(
        &self,
        ctx: &CallContext,
        job: &JobName,
        build: BuildNumber,
    ) -> Result<(), RemoteError>;
}

/// Durable key-value store for registry entries, keyed by [`NodeId`].
///
/// The registry writes through on every mutation and loads everything once at
/// startup; implementations need not cache.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Returns every stored node.
    async fn load_all(&self) -> Result<Vec<Node>, StoreError>;

    /// Inserts or replaces the entry for `node.id`.
    async fn put(&self, node: &Node) -> Result<(), StoreError>;

    /// Removes the entry for `id`. Removing a missing entry is not an error.
    async fn remove(&self, id: NodeId) -> Result<(), StoreError>;
}
