//! Control-plane domain for CiHub.
//!
//! This crate holds the unified node → view → job → build model that every
//! remote CI family is normalised into, the error taxonomy shared by every
//! layer, and the port traits infrastructure crates implement.
//!
//! ## Architectural Layer
//!
//! **Domain + port definitions.** No I/O dependencies. It defines *what* the
//! aggregation engine needs from a remote node and from durable storage;
//! adapter and store crates define *how*.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`NodeId`, `ViewId`, `JobName`, `BuildNumber`, `StageId`) |
//! | [`node`] | Registered nodes, public summaries, registry requests, resolved connections |
//! | [`model`] | Views, jobs, builds, console chunks, pipeline overviews, fan-out entries |
//! | [`types`] | Timestamps, secrets, stale-read annotation |
//! | [`errors`] | Remote/engine error taxonomy and retry policy |
//! | [`ports`] | `RemoteClient` and `NodeStore` traits |

pub mod errors;
pub mod identifiers;
pub mod model;
pub mod node;
pub mod ports;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use errors::{ErrorKind, ErrorNote, HubError, RemoteError, RetryPolicy, StoreError};
pub use identifiers::{BuildNumber, EmptyIdentifier, JobName, NodeId, StageId, ViewId};
pub use model::{
    Build, BuildKey, BuildResult, BuildSelector, ConsoleChunk, Job, JobStatus, NodeJobs,
    PipelineOverview, Stage, StageLog, StageStatus, View, ViewSpec, ViewUpdate,
};
pub use node::{NewNode, Node, NodeConnection, NodeFilter, NodeKind, NodePatch, NodeSummary};
pub use ports::{CallContext, NodeStore, RemoteClient};
pub use types::{Fetched, Secret, Timestamp};
