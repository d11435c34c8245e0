//! Request and response bodies of the HTTP surface. Field names are camelCase.

use serde::{Deserialize, Serialize};

use engine::Target;
use hub::{BuildNumber, HubError, JobName, JobStatus, NodeId, NodePatch, Secret, StageId, ViewId};

/// `PUT server/node`: the node id plus the fields to change.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNodeRequest {
    pub id: NodeId,
    #[serde(flatten)]
    pub patch: NodePatch,
}

/// `POST server/node_view/get/view`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewsRequest {
    pub node_id: NodeId,
}

/// `POST server/view_jobs/get/job` query string.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobsQuery {
    pub node_id: NodeId,
    pub view_id: ViewId,
}

/// Body of start and stop requests.
///
/// The node is named either by `nodeId` or by its endpoint. An endpoint that
/// is registered is served with the registry's credentials; `password` only
/// matters for endpoints that are not.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub job_name: JobName,
    pub view_id: ViewId,
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub password: Option<Secret>,
}

impl ControlRequest {
    pub fn target(&self) -> Result<Target, HubError> {
        if let Some(id) = self.node_id {
            return Ok(Target::Node(id));
        }
        match (&self.host, self.port, &self.account) {
            (Some(host), Some(port), Some(account)) => Ok(Target::Endpoint {
                host: host.clone(),
                port,
                account: account.clone(),
                password: self.password.clone().unwrap_or_else(|| Secret::new("")),
            }),
            _ => Err(HubError::invalid(
                "either nodeId or host, port and account must be given",
            )),
        }
    }
}

/// `POST server/view_console/get`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleRequest {
    #[serde(flatten)]
    pub control: ControlRequest,
    /// Display name of the view; accepted for compatibility, not used.
    #[serde(default)]
    pub view_name: Option<String>,
    /// Build to read; the latest build when absent.
    #[serde(default)]
    pub build_id: Option<BuildNumber>,
    #[serde(default)]
    pub offset: u64,
}

/// Query of build routes. `buildId` anchors `previous`/`next`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildQuery {
    pub job_name: JobName,
    #[serde(default)]
    pub build_id: Option<BuildNumber>,
}

/// Query of the pipeline overview route.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineQuery {
    pub job_name: JobName,
    pub build_id: BuildNumber,
}

/// Query of the pipeline console route.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageQuery {
    pub job_name: JobName,
    pub build_id: BuildNumber,
    pub stage_id: StageId,
}

/// Answer to start and stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub job_name: JobName,
    pub status: JobStatus,
}

/// Answer to `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: String,
    pub nodes: usize,
}
