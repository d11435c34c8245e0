//! Router and handlers.
//!
//! ```text
//! /health
//! /server/node                  POST add, GET list, PUT update
//! /server/nodes                 GET list (legacy path)
//! /server/node/{id}             DELETE
//! /server/node_view/get/view    POST list views
//! /server/node_view/{nodeId}/view                       POST create
//! /server/node_view/{nodeId}/view/{viewId}              GET, PUT, DELETE
//! /server/node_view/{nodeId}/view/{viewId}/build/...    previous, next, latest, {buildId}
//! /server/node_view/{nodeId}/view/{viewId}/pipeline/... overview, console
//! /server/view_jobs/get/job     POST list jobs of a view
//! /server/view_jobs/all         GET jobs of every node
//! /server/view_jobs/start/job   POST
//! /server/view_jobs/stop/job    POST
//! /server/view_console/get      POST
//! ```

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{delete, get, post};
use axum::Router;

use engine::{Aggregator, ConsoleRead};
use hub::{
    Build, BuildNumber, BuildSelector, Fetched, HubError, Job, NewNode, NodeFilter, NodeId,
    NodeJobs, NodeSummary, PipelineOverview, StageLog, View, ViewId, ViewSpec, ViewUpdate,
};

use crate::envelope::{ok, ApiResult, Body, Params, Segments};
use crate::requests::{
    BuildQuery, ConsoleRequest, ControlRequest, Health, JobState, JobsQuery, PipelineQuery,
    StageQuery, UpdateNodeRequest, ViewsRequest,
};

type Engine = State<Arc<Aggregator>>;

/// Builds the control-plane router, mounted under `base_path` (empty or `/`
/// mounts at the root).
pub fn router(engine: Arc<Aggregator>, base_path: &str) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .nest("/server", server_routes())
        .with_state(engine);

    match base_path.trim_end_matches('/') {
        "" => api,
        prefix if prefix.starts_with('/') => Router::new().nest(prefix, api),
        prefix => Router::new().nest(&format!("/{prefix}"), api),
    }
}

fn server_routes() -> Router<Arc<Aggregator>> {
    let view = "/node_view/{node_id}/view/{view_id}";
    Router::new()
        .route("/node", post(add_node).get(list_nodes).put(update_node))
        .route("/nodes", get(list_nodes))
        .route("/node/{id}", delete(remove_node))
        .route("/node_view/get/view", post(list_views))
        .route("/node_view/{node_id}/view", post(create_view))
        .route(view, get(get_view).put(update_view).delete(delete_view))
        .route(&format!("{view}/build/previous"), get(previous_build))
        .route(&format!("{view}/build/next"), get(next_build))
        .route(&format!("{view}/build/latest"), get(latest_build))
        .route(&format!("{view}/build/{{build_id}}"), get(get_build).delete(delete_build))
        .route(&format!("{view}/pipeline/overview"), get(pipeline_overview))
        .route(&format!("{view}/pipeline/console"), get(pipeline_console))
        .route("/view_jobs/get/job", post(list_jobs))
        .route("/view_jobs/all", get(list_all_jobs))
        .route("/view_jobs/start/job", post(start_job))
        .route("/view_jobs/stop/job", post(stop_job))
        .route("/view_console/get", post(get_console))
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

async fn health(State(engine): Engine) -> ApiResult<Health> {
    ok(Health {
        status: "ok".into(),
        nodes: engine.node_count(),
    })
}

async fn add_node(State(engine): Engine, Body(new): Body<NewNode>) -> ApiResult<NodeSummary> {
    ok(engine.add_node(new).await?)
}

async fn list_nodes(
    State(engine): Engine,
    Params(filter): Params<NodeFilter>,
) -> ApiResult<Vec<NodeSummary>> {
    ok(engine.list_nodes(&filter))
}

async fn update_node(
    State(engine): Engine,
    Body(req): Body<UpdateNodeRequest>,
) -> ApiResult<NodeSummary> {
    ok(engine.update_node(req.id, req.patch).await?)
}

async fn remove_node(
    State(engine): Engine,
    Segments(id): Segments<NodeId>,
) -> ApiResult<NodeSummary> {
    ok(engine.remove_node(id).await?)
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

async fn list_views(
    State(engine): Engine,
    Body(req): Body<ViewsRequest>,
) -> ApiResult<Fetched<Vec<View>>> {
    ok(engine.list_views(req.node_id).await?)
}

async fn create_view(
    State(engine): Engine,
    Segments(node): Segments<NodeId>,
    Body(spec): Body<ViewSpec>,
) -> ApiResult<View> {
    ok(engine.create_view(node, spec).await?)
}

async fn get_view(
    State(engine): Engine,
    Segments((node, view)): Segments<(NodeId, ViewId)>,
) -> ApiResult<View> {
    ok(engine.get_view(node, &view).await?)
}

async fn update_view(
    State(engine): Engine,
    Segments((node, view)): Segments<(NodeId, ViewId)>,
    Body(update): Body<ViewUpdate>,
) -> ApiResult<View> {
    ok(engine.update_view(node, &view, update).await?)
}

async fn delete_view(
    State(engine): Engine,
    Segments((node, view)): Segments<(NodeId, ViewId)>,
) -> ApiResult<()> {
    ok(engine.delete_view(node, &view).await?)
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

async fn list_jobs(
    State(engine): Engine,
    Params(q): Params<JobsQuery>,
) -> ApiResult<Fetched<Vec<Job>>> {
    ok(engine.list_jobs(q.node_id, &q.view_id).await?)
}

async fn list_all_jobs(State(engine): Engine) -> ApiResult<Vec<NodeJobs>> {
    ok(engine.list_all_jobs().await)
}

async fn start_job(State(engine): Engine, Body(req): Body<ControlRequest>) -> ApiResult<JobState> {
    let status = engine.start_job(req.target()?, &req.view_id, &req.job_name).await?;
    ok(JobState {
        job_name: req.job_name,
        status,
    })
}

async fn stop_job(State(engine): Engine, Body(req): Body<ControlRequest>) -> ApiResult<JobState> {
    let status = engine.stop_job(req.target()?, &req.view_id, &req.job_name).await?;
    ok(JobState {
        job_name: req.job_name,
        status,
    })
}

async fn get_console(
    State(engine): Engine,
    Body(req): Body<ConsoleRequest>,
) -> ApiResult<ConsoleRead> {
    let control = &req.control;
    let read = engine
        .get_console(
            control.target()?,
            &control.view_id,
            &control.job_name,
            req.build_id,
            req.offset,
        )
        .await?;
    ok(read)
}

// ---------------------------------------------------------------------------
// Builds and pipelines
// ---------------------------------------------------------------------------

async fn read_build(
    engine: &Aggregator,
    (node, view): (NodeId, ViewId),
    q: &BuildQuery,
    selector: BuildSelector,
) -> ApiResult<Build> {
    ok(engine.get_build(node, &view, &q.job_name, selector).await?)
}

fn anchor(q: &BuildQuery) -> Result<BuildNumber, HubError> {
    q.build_id
        .ok_or_else(|| HubError::invalid("buildId is required"))
}

async fn previous_build(
    State(engine): Engine,
    Segments(path): Segments<(NodeId, ViewId)>,
    Params(q): Params<BuildQuery>,
) -> ApiResult<Build> {
    let selector = BuildSelector::Previous(anchor(&q)?);
    read_build(&engine, path, &q, selector).await
}

async fn next_build(
    State(engine): Engine,
    Segments(path): Segments<(NodeId, ViewId)>,
    Params(q): Params<BuildQuery>,
) -> ApiResult<Build> {
    let selector = BuildSelector::Next(anchor(&q)?);
    read_build(&engine, path, &q, selector).await
}

async fn latest_build(
    State(engine): Engine,
    Segments(path): Segments<(NodeId, ViewId)>,
    Params(q): Params<BuildQuery>,
) -> ApiResult<Build> {
    read_build(&engine, path, &q, BuildSelector::Latest).await
}

async fn get_build(
    State(engine): Engine,
    Segments((node, view, build)): Segments<(NodeId, ViewId, BuildNumber)>,
    Params(q): Params<BuildQuery>,
) -> ApiResult<Build> {
    read_build(&engine, (node, view), &q, BuildSelector::Number(build)).await
}

async fn delete_build(
    State(engine): Engine,
    Segments((node, view, build)): Segments<(NodeId, ViewId, BuildNumber)>,
    Params(q): Params<BuildQuery>,
) -> ApiResult<()> {
    ok(engine.delete_build(node, &view, &q.job_name, build).await?)
}

async fn pipeline_overview(
    State(engine): Engine,
    Segments((node, view)): Segments<(NodeId, ViewId)>,
    Params(q): Params<PipelineQuery>,
) -> ApiResult<PipelineOverview> {
    ok(engine.pipeline_overview(node, &view, &q.job_name, q.build_id).await?)
}

async fn pipeline_console(
    State(engine): Engine,
    Segments((node, view)): Segments<(NodeId, ViewId)>,
    Params(q): Params<StageQuery>,
) -> ApiResult<StageLog> {
    ok(engine
        .pipeline_console(node, &view, &q.job_name, q.build_id, &q.stage_id)
        .await?)
}

#[cfg(test)]
#[path = "routes_tests.rs"]
mod tests;
