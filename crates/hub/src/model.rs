//! Unified view/job/build model shared by every node family.
//!
//! Adapters translate their remote payloads into these types; the engine
//! caches and merges them; the HTTP edge serialises them. Field names are
//! camelCase on the wire.

use serde::{Deserialize, Serialize};

use crate::{BuildNumber, ErrorNote, JobName, NodeId, StageId, Timestamp, ViewId};

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// A named grouping of jobs on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct View {
    /// Remote identity of the view.
    pub id: ViewId,
    /// Display name.
    pub name: String,
    /// Free-text description, if the remote has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Jobs in the order the remote lists them.
    #[serde(default)]
    pub jobs: Vec<JobName>,
}

/// Request to create a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewSpec {
    /// Name (and therefore id) of the new view.
    pub name: ViewId,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Jobs to place in the view.
    #[serde(default)]
    pub jobs: Vec<JobName>,
}

/// Partial update of an existing view. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewUpdate {
    /// Replacement description.
    #[serde(default)]
    pub description: Option<String>,
    /// Replacement job membership (the full desired list).
    #[serde(default)]
    pub jobs: Option<Vec<JobName>>,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Normalised status of a job.
///
/// [`JobStatus::Unknown`] is used when the node could not say; it is never
/// replaced by a guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Not building; no result to report (never built, disabled, aborted).
    Idle,
    /// A build is executing or queued.
    Running,
    /// Last build succeeded.
    Succeeded,
    /// Last build failed or was unstable.
    Failed,
    /// The node did not report a recognisable status.
    Unknown,
}

/// A buildable unit within a view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Full job name.
    pub name: JobName,
    /// Number of the most recent build, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_build_id: Option<BuildNumber>,
    /// Normalised status.
    pub status: JobStatus,
}

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

/// Final outcome of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    /// All steps passed.
    Success,
    /// Completed with test failures or warnings.
    Unstable,
    /// A step failed.
    Failure,
    /// Not executed (e.g. skipped by the scheduler).
    NotBuilt,
    /// Interrupted by a user or timeout.
    Aborted,
}

/// One execution of a job.
///
/// Immutable once `result` is set; only the console grows while running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    /// Remote-assigned build number.
    pub id: BuildNumber,
    /// When the build started.
    pub started_at: Timestamp,
    /// Outcome; `None` while running.
    #[serde(default)]
    pub result: Option<BuildResult>,
    /// Whether the remote still reports the build as executing.
    pub building: bool,
    /// Number of the preceding build, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<BuildNumber>,
    /// Number of the following build, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_id: Option<BuildNumber>,
}

impl Build {
    /// Returns `true` once the build has a result and is no longer executing.
    pub fn is_finished(&self) -> bool {
        self.result.is_some() && !self.building
    }
}

/// Which build of a job to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildSelector {
    /// The job's most recent build.
    Latest,
    /// A specific build number.
    Number(BuildNumber),
    /// The build before the given one.
    Previous(BuildNumber),
    /// The build after the given one.
    Next(BuildNumber),
}

/// Cache key for console and pipeline state of one build.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildKey {
    /// Registered node.
    pub node: NodeId,
    /// View the job was addressed through.
    pub view: ViewId,
    /// Job name.
    pub job: JobName,
    /// Build number.
    pub build: BuildNumber,
}

// ---------------------------------------------------------------------------
// Console and pipeline
// ---------------------------------------------------------------------------

/// Incremental console text starting at a caller-supplied byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleChunk {
    /// Text from the requested offset up to `next_offset`.
    pub text: String,
    /// Byte offset to pass on the next poll.
    pub next_offset: u64,
    /// `true` once the remote reports the build finished and all text is in.
    pub complete: bool,
}

/// Status of a pipeline run or one of its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Completed successfully.
    Success,
    /// Completed with a failure.
    Failed,
    /// Completed but marked unstable.
    Unstable,
    /// Executing now.
    InProgress,
    /// Waiting for input.
    Paused,
    /// Interrupted.
    Aborted,
    /// Skipped or not reached.
    NotExecuted,
    /// Anything the adapter did not recognise.
    Unknown,
}

impl StageStatus {
    /// Returns `true` while the run or stage can still change.
    pub fn is_active(self) -> bool {
        matches!(self, Self::InProgress | Self::Paused)
    }
}

/// One stage of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// Remote identity of the stage.
    pub id: StageId,
    /// Display name.
    pub name: String,
    /// Current status.
    pub status: StageStatus,
    /// Elapsed wall time in milliseconds.
    pub duration_millis: u64,
}

/// Stage-by-stage status of one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOverview {
    /// Build this overview describes.
    pub build_id: BuildNumber,
    /// Aggregate run status.
    pub status: StageStatus,
    /// Stages in execution order.
    pub stages: Vec<Stage>,
}

/// Console text of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageLog {
    /// Stage this log belongs to.
    pub stage_id: StageId,
    /// Log text.
    pub text: String,
    /// Whether the remote has more text than it returned.
    pub has_more: bool,
    /// Total log length reported by the remote, in bytes.
    pub length: u64,
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// One node's share of a cross-node job listing.
///
/// `jobs` is `None` when the node could not be listed; `error` then says
/// why. Both are set when the jobs are a stale copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeJobs {
    /// Node the entry is about.
    pub node_id: NodeId,
    /// Host of the node, for display.
    pub host: String,
    /// Jobs across all of the node's views, deduplicated by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<Vec<Job>>,
    /// Whether any part of `jobs` came from last-known-good cache.
    #[serde(default)]
    pub stale: bool,
    /// Why the node could not be listed (or why the data is stale).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorNote>,
}
