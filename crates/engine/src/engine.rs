//! The aggregation engine.
//!
//! [`Aggregator`] is the only component that talks to adapters and the only
//! writer of cached state. Every operation resolves its target node through
//! the registry first, so a removed node is reported as not found even while
//! stale cache entries for it are still waiting for the sweeper.
//!
//! Partial-failure policy:
//!
//! | Operation | On remote failure |
//! |-----------|-------------------|
//! | `list_views`, `list_jobs` | `Unreachable` with an expired entry → stale answer |
//! | view and build mutations, start, stop | surface the failure as-is; nothing is cached |
//! | console, pipeline | failure is shared with concurrent pollers for the poll TTL |
//! | `list_all_jobs` | per-node error entry; the listing itself never fails |

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use hub::{
    Build, BuildKey, BuildNumber, BuildSelector, CallContext, ConsoleChunk, ErrorNote, Fetched,
    HubError, Job, JobName, JobStatus, NewNode, NodeConnection, NodeFilter, NodeId, NodeJobs,
    NodeKind, NodePatch, NodeStore, NodeSummary, PipelineOverview, RemoteClient, RemoteError,
    Secret, StageId, StageLog, View, ViewId, ViewSpec, ViewUpdate,
};

use crate::cache::{Lookup, Slots, TtlCache};
use crate::clients::RemoteClients;
use crate::poller::Poller;
use crate::registry::NodeRegistry;
use crate::settings::EngineSettings;

// ---------------------------------------------------------------------------
// Request shapes
// ---------------------------------------------------------------------------

/// Where a control request is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A registered node.
    Node(NodeId),
    /// An endpoint given by the caller. If a registered node serves it, the
    /// registry's credentials are used and `password` is ignored.
    Endpoint {
        /// Host name or address of the node.
        host: String,
        /// HTTP port of the node.
        port: u16,
        /// Account the caller acts as.
        account: String,
        /// Password or API token for `account`; used only for unregistered
        /// endpoints and never stored.
        password: Secret,
    },
}

/// Console text together with the build it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleRead {
    /// Build the text was read from; resolved when the caller gave none.
    pub build_id: BuildNumber,
    #[serde(flatten)]
    pub chunk: ConsoleChunk,
}

#[derive(Default)]
struct StartState {
    started_at: Option<Instant>,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Unified node → view → job → build facade over every registered node.
pub struct Aggregator {
    registry: NodeRegistry,
    clients: RemoteClients,
    settings: EngineSettings,
    views: TtlCache<NodeId, Vec<View>>,
    jobs: TtlCache<(NodeId, ViewId), Vec<Job>>,
    poller: Poller,
    /// Keyed by connection label and job so ad-hoc targets are serialised too.
    starts: Slots<(String, JobName), StartState>,
}

impl Aggregator {
    /// Loads the registry from `store` and builds an engine around it.
    pub async fn open(
        store: Arc<dyn NodeStore>,
        clients: RemoteClients,
        settings: EngineSettings,
    ) -> Result<Self, HubError> {
        let registry = NodeRegistry::open(store).await?;
        Ok(Self {
            registry,
            clients,
            poller: Poller::new(settings.poll_ttl),
            settings,
            views: TtlCache::new(),
            jobs: TtlCache::new(),
            starts: Slots::new(),
        })
    }

    // -- registry ----------------------------------------------------------

    /// Registers a node; the answer never carries its credential.
    #[instrument(skip(self, new), fields(host = %new.host, port = new.port))]
    pub async fn add_node(&self, new: NewNode) -> Result<NodeSummary, HubError> {
        let added = self.registry.add(new).await?;
        info!(node = %added.id, "node registered");
        Ok(added)
    }

    /// Registered nodes matching `filter`, without credentials.
    pub fn list_nodes(&self, filter: &NodeFilter) -> Vec<NodeSummary> {
        self.registry.list(filter)
    }

    /// Number of registered nodes.
    pub fn node_count(&self) -> usize {
        self.registry.len()
    }

    /// Applies `patch`. Cached state is dropped when the node is reached
    /// differently afterwards.
    #[instrument(skip(self, patch))]
    pub async fn update_node(
        &self,
        id: NodeId,
        patch: NodePatch,
    ) -> Result<NodeSummary, HubError> {
        let reconnects = patch.changes_connection();
        let (before, after) = self.registry.update(id, patch).await?;
        if reconnects && before.connection() != after.connection() {
            debug!("connection changed; dropping cached state");
            self.forget_node(id, &before.connection());
        }
        Ok(after.summary())
    }

    /// Unregisters a node and drops all of its cached state.
    #[instrument(skip(self))]
    pub async fn remove_node(&self, id: NodeId) -> Result<NodeSummary, HubError> {
        let removed = self.registry.remove(id).await?;
        self.forget_node(id, &removed.connection());
        info!("node removed");
        Ok(removed.summary())
    }

    fn forget_node(&self, id: NodeId, conn: &NodeConnection) {
        let label = conn.label();
        self.views.invalidate(&id);
        self.jobs.invalidate_where(|(node, _)| *node == id);
        self.poller.invalidate_node(id);
        self.starts.remove_where(|(l, _)| *l == label);
    }

    // -- views -------------------------------------------------------------

    /// Lists a node's views, falling back to the last-known-good list while
    /// the node is unreachable.
    #[instrument(skip(self))]
    pub async fn list_views(&self, node: NodeId) -> Result<Fetched<Vec<View>>, HubError> {
        self.views_within(node, self.settings.call_timeout).await
    }

    async fn views_within(
        &self,
        node: NodeId,
        limit: Duration,
    ) -> Result<Fetched<Vec<View>>, HubError> {
        let (client, ctx) = self.remote_within(self.registry.connection(node)?, limit)?;
        self.read_through(&self.views, node, || {
            timed(&ctx, "list_views", client.list_views(&ctx))
        })
        .await
    }

    /// One view with its job names, read straight from the node.
    #[instrument(skip(self))]
    pub async fn get_view(&self, node: NodeId, view: &ViewId) -> Result<View, HubError> {
        let (client, ctx) = self.remote(self.registry.connection(node)?)?;
        Ok(timed(&ctx, "get_view", client.get_view(&ctx, view)).await?)
    }

    /// Creates a view on the node; the cached view list is invalidated.
    #[instrument(skip(self, spec), fields(view = %spec.name))]
    pub async fn create_view(&self, node: NodeId, spec: ViewSpec) -> Result<View, HubError> {
        let (client, ctx) = self.remote(self.registry.connection(node)?)?;
        let created = timed(&ctx, "create_view", client.create_view(&ctx, &spec)).await?;
        self.views.invalidate(&node);
        Ok(created)
    }

    /// Replaces a view's description or job membership.
    #[instrument(skip(self, update))]
    pub async fn update_view(
        &self,
        node: NodeId,
        view: &ViewId,
        update: ViewUpdate,
    ) -> Result<View, HubError> {
        let (client, ctx) = self.remote(self.registry.connection(node)?)?;
        let updated = timed(&ctx, "update_view", client.update_view(&ctx, view, &update)).await?;
        self.views.invalidate(&node);
        self.jobs.invalidate(&(node, view.clone()));
        Ok(updated)
    }

    /// Deletes a view; it disappears from the next listing.
    #[instrument(skip(self))]
    pub async fn delete_view(&self, node: NodeId, view: &ViewId) -> Result<(), HubError> {
        let (client, ctx) = self.remote(self.registry.connection(node)?)?;
        timed(&ctx, "delete_view", client.delete_view(&ctx, view)).await?;
        self.views.invalidate(&node);
        self.jobs.invalidate(&(node, view.clone()));
        Ok(())
    }

    // -- jobs --------------------------------------------------------------

    /// Lists the jobs of a view with the same fallback as [`Self::list_views`].
    #[instrument(skip(self))]
    pub async fn list_jobs(
        &self,
        node: NodeId,
        view: &ViewId,
    ) -> Result<Fetched<Vec<Job>>, HubError> {
        self.jobs_within(node, view, self.settings.call_timeout).await
    }

    async fn jobs_within(
        &self,
        node: NodeId,
        view: &ViewId,
        limit: Duration,
    ) -> Result<Fetched<Vec<Job>>, HubError> {
        let (client, ctx) = self.remote_within(self.registry.connection(node)?, limit)?;
        self.read_through(&self.jobs, (node, view.clone()), || {
            timed(&ctx, "list_jobs", client.list_jobs(&ctx, view))
        })
        .await
    }

    /// Lists every registered node's jobs concurrently.
    ///
    /// Each node gets at most the fan-out timeout, split between listing its
    /// views and listing their jobs so that a node that stops answering still
    /// falls back to its cached listings. A node that fails with nothing
    /// cached contributes an error entry instead of its jobs.
    #[instrument(skip(self))]
    pub async fn list_all_jobs(&self) -> Vec<NodeJobs> {
        let nodes = self.registry.list(&NodeFilter::default());
        let limit = self.settings.fanout_timeout;
        let per_node = nodes.into_iter().map(|node| async move {
            let deadline = Instant::now() + limit;
            let listing = self.node_jobs(node.id, deadline);
            let outcome = match tokio::time::timeout_at(deadline, listing).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let err = RemoteError::unreachable(format!(
                        "no answer within {} ms",
                        limit.as_millis()
                    ));
                    self.cached_node_jobs(node.id, &err)
                        .ok_or(HubError::Remote(err))
                }
            };
            match outcome {
                Ok(fetched) => NodeJobs {
                    node_id: node.id,
                    host: node.host,
                    jobs: Some(fetched.items),
                    stale: fetched.stale,
                    error: fetched.note,
                },
                Err(err) => {
                    warn!(node = %node.id, error = %err, "node left out of job listing");
                    NodeJobs {
                        node_id: node.id,
                        host: node.host,
                        jobs: None,
                        stale: false,
                        error: Some(ErrorNote::from(&err)),
                    }
                }
            }
        });
        join_all(per_node).await
    }

    /// Jobs across all views of one node, deduplicated by name in view order.
    ///
    /// The view listing may use half of the time left before `deadline`; the
    /// job listings share whatever remains.
    async fn node_jobs(
        &self,
        node: NodeId,
        deadline: Instant,
    ) -> Result<Fetched<Vec<Job>>, HubError> {
        let budget = deadline.saturating_duration_since(Instant::now()) / 2;
        let views = self
            .views_within(node, budget.min(self.settings.call_timeout))
            .await?;

        let budget = deadline.saturating_duration_since(Instant::now());
        let limit = budget.min(self.settings.call_timeout);
        let lists = views.items.iter().map(|v| self.jobs_within(node, &v.id, limit));
        let lists = join_all(lists).await;
        merge_job_lists(views.stale, views.note, lists)
    }

    /// Builds a node's entry purely from cache, expired entries included.
    /// `None` unless the views and the jobs of every view are cached.
    fn cached_node_jobs(&self, node: NodeId, cause: &RemoteError) -> Option<Fetched<Vec<Job>>> {
        let ttl = self.settings.view_cache_ttl;
        let views = match self.views.lookup(&node, ttl) {
            Lookup::Fresh(views) | Lookup::Expired(views) => views,
            Lookup::Missing => return None,
        };
        let mut lists = Vec::with_capacity(views.len());
        for view in &views {
            match self.jobs.lookup(&(node, view.id.clone()), ttl) {
                Lookup::Fresh(jobs) | Lookup::Expired(jobs) => {
                    lists.push(Ok(Fetched::fresh(jobs)));
                }
                Lookup::Missing => return None,
            }
        }
        warn!(node = %node, error = %cause, "serving cached job listing");
        merge_job_lists(true, Some(ErrorNote::from(cause)), lists).ok()
    }

    /// Starts a build of `job` unless one is already running.
    ///
    /// Repeating the call while the job runs (or within the start grace
    /// window, before the node reports it running) answers `Running` again
    /// without triggering a second build.
    #[instrument(skip(self, target), fields(endpoint = %self.describe(&target)))]
    pub async fn start_job(
        &self,
        target: Target,
        view: &ViewId,
        job: &JobName,
    ) -> Result<JobStatus, HubError> {
        let conn = self.resolve(target)?;
        let slot = self.starts.slot(&(conn.label(), job.clone()));
        let mut state = slot.lock().await;
        if state
            .started_at
            .is_some_and(|at| at.elapsed() < self.settings.start_grace)
        {
            debug!("start answered from grace window");
            return Ok(JobStatus::Running);
        }

        let (client, ctx) = self.remote(conn)?;
        let current = timed(&ctx, "get_job", client.get_job(&ctx, job)).await?;
        if current.status == JobStatus::Running {
            return Ok(JobStatus::Running);
        }
        timed(&ctx, "start_job", client.start_job(&ctx, job)).await?;
        state.started_at = Some(Instant::now());
        self.job_changed(&ctx.connection);
        info!("job started");
        Ok(JobStatus::Running)
    }

    /// Stops `job` if it is running; otherwise returns its current status.
    #[instrument(skip(self, target), fields(endpoint = %self.describe(&target)))]
    pub async fn stop_job(
        &self,
        target: Target,
        view: &ViewId,
        job: &JobName,
    ) -> Result<JobStatus, HubError> {
        let conn = self.resolve(target)?;
        let slot = self.starts.slot(&(conn.label(), job.clone()));
        let mut state = slot.lock().await;
        let just_started = state
            .started_at
            .is_some_and(|at| at.elapsed() < self.settings.start_grace);

        let (client, ctx) = self.remote(conn)?;
        let current = timed(&ctx, "get_job", client.get_job(&ctx, job)).await?;
        if current.status != JobStatus::Running && !just_started {
            return Ok(current.status);
        }
        timed(&ctx, "stop_job", client.stop_job(&ctx, job)).await?;
        state.started_at = None;
        self.job_changed(&ctx.connection);
        info!("job stopped");
        Ok(JobStatus::Idle)
    }

    fn job_changed(&self, conn: &NodeConnection) {
        if let Some(id) = conn.node {
            self.jobs.invalidate_where(|(node, _)| *node == id);
        }
    }

    // -- builds and console --------------------------------------------------

    /// Reads console text from `offset`. Without `build`, the job's latest
    /// build is used.
    #[instrument(skip(self, target), fields(endpoint = %self.describe(&target)))]
    pub async fn get_console(
        &self,
        target: Target,
        view: &ViewId,
        job: &JobName,
        build: Option<BuildNumber>,
        offset: u64,
    ) -> Result<ConsoleRead, HubError> {
        let (client, ctx) = self.remote(self.resolve(target)?)?;
        let build = match build {
            Some(build) => build,
            None => {
                timed(&ctx, "get_build", client.get_build(&ctx, job, BuildSelector::Latest))
                    .await?
                    .id
            }
        };

        let fetch =
            |from: u64| timed(&ctx, "get_console", client.get_console(&ctx, job, build, from));
        // Ad-hoc targets have no registry id to key a snapshot on.
        let chunk = match ctx.connection.node {
            Some(node) => {
                let key = build_key(node, view, job, build);
                self.poller.console(&key, offset, fetch).await?
            }
            None => fetch(offset).await?,
        };
        Ok(ConsoleRead {
            build_id: build,
            chunk,
        })
    }

    /// Reads one build of `job`, addressed absolutely or relative to another.
    #[instrument(skip(self))]
    pub async fn get_build(
        &self,
        node: NodeId,
        view: &ViewId,
        job: &JobName,
        selector: BuildSelector,
    ) -> Result<Build, HubError> {
        let (client, ctx) = self.remote(self.registry.connection(node)?)?;
        Ok(timed(&ctx, "get_build", client.get_build(&ctx, job, selector)).await?)
    }

    /// Deletes a build and drops everything cached about it.
    #[instrument(skip(self))]
    pub async fn delete_build(
        &self,
        node: NodeId,
        view: &ViewId,
        job: &JobName,
        build: BuildNumber,
    ) -> Result<(), HubError> {
        let (client, ctx) = self.remote(self.registry.connection(node)?)?;
        timed(&ctx, "delete_build", client.delete_build(&ctx, job, build)).await?;
        self.poller.invalidate_build(node, job, build);
        self.jobs.invalidate_where(|(n, _)| *n == node);
        Ok(())
    }

    // -- pipeline ------------------------------------------------------------

    /// Stage statuses of a pipeline build, shared between concurrent pollers.
    #[instrument(skip(self))]
    pub async fn pipeline_overview(
        &self,
        node: NodeId,
        view: &ViewId,
        job: &JobName,
        build: BuildNumber,
    ) -> Result<PipelineOverview, HubError> {
        let (client, ctx) = self.remote(self.registry.connection(node)?)?;
        let key = build_key(node, view, job, build);
        let overview = self
            .poller
            .overview(&key, || {
                timed(&ctx, "get_pipeline_overview", client.get_pipeline_overview(&ctx, job, build))
            })
            .await?;
        Ok(overview)
    }

    /// Log of one pipeline stage, shared like [`Self::pipeline_overview`].
    #[instrument(skip(self))]
    pub async fn pipeline_console(
        &self,
        node: NodeId,
        view: &ViewId,
        job: &JobName,
        build: BuildNumber,
        stage: &StageId,
    ) -> Result<StageLog, HubError> {
        let (client, ctx) = self.remote(self.registry.connection(node)?)?;
        let key = build_key(node, view, job, build);
        let log = self
            .poller
            .stage_log(&key, stage, || {
                timed(
                    &ctx,
                    "get_pipeline_console",
                    client.get_pipeline_console(&ctx, job, build, stage),
                )
            })
            .await?;
        Ok(log)
    }

    // -- housekeeping --------------------------------------------------------

    /// Evicts cache entries older than the retention period and finished
    /// start records. Returns the number of entries dropped.
    pub fn sweep(&self) -> usize {
        let retention = self.settings.retention;
        let grace = self.settings.start_grace;
        let evicted = self.views.sweep(retention)
            + self.jobs.sweep(retention)
            + self.poller.sweep(retention)
            + self
                .starts
                .sweep(|s| s.started_at.map_or(true, |at| at.elapsed() >= grace));
        if evicted > 0 {
            debug!(evicted, "cache sweep");
        }
        evicted
    }

    // -- plumbing ------------------------------------------------------------

    fn remote(
        &self,
        conn: NodeConnection,
    ) -> Result<(Arc<dyn RemoteClient>, CallContext), HubError> {
        self.remote_within(conn, self.settings.call_timeout)
    }

    fn remote_within(
        &self,
        conn: NodeConnection,
        limit: Duration,
    ) -> Result<(Arc<dyn RemoteClient>, CallContext), HubError> {
        let client = self.clients.get(conn.kind)?;
        Ok((client, CallContext::new(conn, limit)))
    }

    /// Turns a control target into a connection. Registered endpoints always
    /// use the registry's credentials.
    fn resolve(&self, target: Target) -> Result<NodeConnection, HubError> {
        match target {
            Target::Node(id) => self.registry.connection(id),
            Target::Endpoint {
                host,
                port,
                account,
                password,
            } => {
                if let Some(conn) = self.registry.find_endpoint(&host, port, &account) {
                    return Ok(conn);
                }
                if host.trim().is_empty() || port == 0 || account.is_empty() {
                    return Err(HubError::invalid("host, port and account are required"));
                }
                if password.is_empty() {
                    return Err(HubError::invalid(format!(
                        "{account}@{host}:{port} is not registered and no password was given"
                    )));
                }
                Ok(NodeConnection {
                    node: None,
                    kind: NodeKind::default(),
                    host: host.trim().to_string(),
                    port,
                    account,
                    secret: password,
                    tls: false,
                })
            }
        }
    }

    fn describe(&self, target: &Target) -> String {
        match target {
            Target::Node(id) => id.to_string(),
            Target::Endpoint {
                host, port, account, ..
            } => format!("{account}@{host}:{port}"),
        }
    }

    async fn read_through<K, V, F, Fut>(
        &self,
        cache: &TtlCache<K, V>,
        key: K,
        fetch: F,
    ) -> Result<Fetched<V>, HubError>
    where
        K: Eq + std::hash::Hash + Clone,
        V: Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, RemoteError>>,
    {
        let expired = match cache.lookup(&key, self.settings.view_cache_ttl) {
            Lookup::Fresh(value) => return Ok(Fetched::fresh(value)),
            Lookup::Expired(value) => Some(value),
            Lookup::Missing => None,
        };
        let epoch = cache.epoch();
        match fetch().await {
            Ok(value) => {
                cache.store(key, value.clone(), epoch);
                Ok(Fetched::fresh(value))
            }
            Err(err @ RemoteError::Unreachable { .. }) => match expired {
                Some(value) => {
                    warn!(error = %err, "serving last-known-good data");
                    Ok(Fetched::stale(value, ErrorNote::from(&err)))
                }
                None => Err(err.into()),
            },
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("nodes", &self.registry.len())
            .field("clients", &self.clients)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Concatenates per-view job lists, keeping the first occurrence of each job.
/// Any stale list marks the whole result stale.
fn merge_job_lists(
    mut stale: bool,
    mut note: Option<ErrorNote>,
    lists: Vec<Result<Fetched<Vec<Job>>, HubError>>,
) -> Result<Fetched<Vec<Job>>, HubError> {
    let mut seen = HashSet::new();
    let mut jobs = Vec::new();
    for list in lists {
        let list = list?;
        if list.stale {
            stale = true;
            note = note.or(list.note);
        }
        jobs.extend(list.items.into_iter().filter(|j| seen.insert(j.name.clone())));
    }
    Ok(Fetched {
        items: jobs,
        stale,
        note,
    })
}

fn build_key(node: NodeId, view: &ViewId, job: &JobName, build: BuildNumber) -> BuildKey {
    BuildKey {
        node,
        view: view.clone(),
        job: job.clone(),
        build,
    }
}

/// Bounds `call` by the context's timeout. Running out of time is reported as
/// [`RemoteError::Unreachable`].
async fn timed<T>(
    ctx: &CallContext,
    op: &'static str,
    call: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    let outcome = match tokio::time::timeout(ctx.timeout, call).await {
        Ok(outcome) => outcome,
        Err(_) => Err(RemoteError::unreachable(format!(
            "{} gave no answer within {} ms",
            ctx.connection.label(),
            ctx.timeout.as_millis()
        ))),
    };
    if let Err(err) = &outcome {
        warn!(node = %ctx.connection.label(), op, error = %err, "remote call failed");
    }
    outcome
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
