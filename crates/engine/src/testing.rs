//! Scripted in-memory [`RemoteClient`] for tests.
//!
//! Each fake node is addressed by host. Tests shape a node's views, jobs,
//! builds, console text and pipelines up front, flip it unreachable or hung
//! at will, and count how many calls of each kind reached it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use hub::{
    Build, BuildNumber, BuildResult, BuildSelector, CallContext, ConsoleChunk, Job, JobName,
    JobStatus, PipelineOverview, RemoteClient, RemoteError, StageId, StageLog, Timestamp, View,
    ViewId, ViewSpec, ViewUpdate,
};

/// State of one fake node.
#[derive(Debug, Clone, Default)]
pub struct FakeNode {
    pub views: BTreeMap<ViewId, View>,
    pub jobs: BTreeMap<JobName, Job>,
    pub builds: BTreeMap<(JobName, BuildNumber), Build>,
    /// Full console text and whether the build has finished.
    pub consoles: HashMap<(JobName, BuildNumber), (String, bool)>,
    pub overviews: HashMap<(JobName, BuildNumber), PipelineOverview>,
    pub stage_logs: HashMap<(JobName, BuildNumber, StageId), StageLog>,
    /// Credential the node accepts; `None` accepts anything.
    pub password: Option<String>,
    pub unreachable: bool,
    /// Never answers; only a caller-side timeout ends the call.
    pub hung: bool,
}

impl FakeNode {
    /// Adds a view holding `jobs`, creating the jobs with the given status.
    pub fn with_view(mut self, view: &str, jobs: &[(&str, JobStatus)]) -> Self {
        let id = view_id(view);
        let mut names = Vec::new();
        for (name, status) in jobs {
            let name = job_name(name);
            self.jobs.insert(
                name.clone(),
                Job {
                    name: name.clone(),
                    last_build_id: None,
                    status: *status,
                },
            );
            names.push(name);
        }
        self.views.insert(
            id.clone(),
            View {
                id,
                name: view.to_string(),
                description: None,
                jobs: names,
            },
        );
        self
    }

    /// Adds a build of `job` with its console text.
    pub fn with_build(mut self, job: &str, number: u64, console: &str, finished: bool) -> Self {
        let job = job_name(job);
        let id = BuildNumber::new(number);
        self.builds.insert(
            (job.clone(), id),
            Build {
                id,
                started_at: Timestamp::now(),
                result: finished.then_some(BuildResult::Success),
                building: !finished,
                previous_id: None,
                next_id: None,
            },
        );
        self.consoles.insert((job.clone(), id), (console.to_string(), finished));
        if let Some(entry) = self.jobs.get_mut(&job) {
            if entry.last_build_id.map_or(true, |last| last < id) {
                entry.last_build_id = Some(id);
            }
        }
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    fn view(&self, id: &ViewId) -> Result<&View, RemoteError> {
        self.views
            .get(id)
            .ok_or_else(|| RemoteError::not_found(format!("view {id}")))
    }

    fn job(&self, name: &JobName) -> Result<&Job, RemoteError> {
        self.jobs
            .get(name)
            .ok_or_else(|| RemoteError::not_found(format!("job {name}")))
    }

    fn build(&self, job: &JobName, id: BuildNumber) -> Result<Build, RemoteError> {
        let mut build = self
            .builds
            .get(&(job.clone(), id))
            .cloned()
            .ok_or_else(|| RemoteError::not_found(format!("build {job}#{id}")))?;
        let numbers = self.numbers(job);
        build.previous_id = numbers.iter().rev().find(|n| **n < id).copied();
        build.next_id = numbers.iter().find(|n| **n > id).copied();
        Ok(build)
    }

    fn numbers(&self, job: &JobName) -> Vec<BuildNumber> {
        self.builds
            .keys()
            .filter(|(j, _)| j == job)
            .map(|(_, n)| *n)
            .collect()
    }
}

/// A recorded call: method, host, and the secret presented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub method: &'static str,
    pub host: String,
    pub secret: String,
}

/// [`RemoteClient`] backed by [`FakeNode`]s.
#[derive(Debug, Default)]
pub struct FakeClient {
    nodes: Mutex<HashMap<String, FakeNode>>,
    calls: Mutex<Vec<FakeCall>>,
    latency: Mutex<Duration>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs (or replaces) the node answering for `host`.
    pub fn set_node(&self, host: &str, node: FakeNode) {
        self.lock_nodes().insert(host.to_string(), node);
    }

    /// Edits the node answering for `host`.
    pub fn edit(&self, host: &str, f: impl FnOnce(&mut FakeNode)) {
        if let Some(node) = self.lock_nodes().get_mut(host) {
            f(node);
        }
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        self.edit(host, |n| n.unreachable = unreachable);
    }

    /// Delay applied to every call before it is answered.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Number of calls of `method` made so far, across all hosts.
    pub fn count(&self, method: &str) -> usize {
        self.recorded().iter().filter(|c| c.method == method).count()
    }

    pub fn recorded(&self) -> Vec<FakeCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lock_nodes(&self) -> std::sync::MutexGuard<'_, HashMap<String, FakeNode>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records the call, waits out latency, and applies the node's health.
    async fn enter(&self, method: &'static str, ctx: &CallContext) -> Result<(), RemoteError> {
        let host = ctx.connection.host.clone();
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(FakeCall {
                method,
                host: host.clone(),
                secret: ctx.connection.secret.expose().to_string(),
            });

        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let (hung, unreachable, password) = match self.lock_nodes().get(&host) {
            Some(node) => (node.hung, node.unreachable, node.password.clone()),
            None => (false, true, None),
        };
        if hung {
            std::future::pending::<()>().await;
        }
        if unreachable {
            return Err(RemoteError::unreachable(format!("{host} refused the connection")));
        }
        if password.is_some_and(|p| p != ctx.connection.secret.expose()) {
            return Err(RemoteError::AuthRejected);
        }
        Ok(())
    }

    async fn with_node<T>(
        &self,
        method: &'static str,
        ctx: &CallContext,
        f: impl FnOnce(&mut FakeNode) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        self.enter(method, ctx).await?;
        let mut nodes = self.lock_nodes();
        let node = nodes
            .get_mut(&ctx.connection.host)
            .ok_or_else(|| RemoteError::unreachable("no such host"))?;
        f(node)
    }
}

#[async_trait]
impl RemoteClient for FakeClient {
    async fn list_views(&self, ctx: &CallContext) -> Result<Vec<View>, RemoteError> {
        self.with_node("list_views", ctx, |n| Ok(n.views.values().cloned().collect()))
            .await
    }

    async fn get_view(&self, ctx: &CallContext, view: &ViewId) -> Result<View, RemoteError> {
        self.with_node("get_view", ctx, |n| n.view(view).cloned()).await
    }

    async fn create_view(&self, ctx: &CallContext, spec: &ViewSpec) -> Result<View, RemoteError> {
        self.with_node("create_view", ctx, |n| {
            if n.views.contains_key(&spec.name) {
                return Err(RemoteError::Remote {
                    code: 400,
                    message: format!("view {} already exists", spec.name),
                });
            }
            let view = View {
                id: spec.name.clone(),
                name: spec.name.to_string(),
                description: spec.description.clone(),
                jobs: spec.jobs.clone(),
            };
            n.views.insert(spec.name.clone(), view.clone());
            Ok(view)
        })
        .await
    }

    async fn update_view(
        &self,
        ctx: &CallContext,
        view: &ViewId,
        update: &ViewUpdate,
    ) -> Result<View, RemoteError> {
        self.with_node("update_view", ctx, |n| {
            let entry = n
                .views
                .get_mut(view)
                .ok_or_else(|| RemoteError::not_found(format!("view {view}")))?;
            if let Some(description) = &update.description {
                entry.description = Some(description.clone());
            }
            if let Some(jobs) = &update.jobs {
                entry.jobs = jobs.clone();
            }
            Ok(entry.clone())
        })
        .await
    }

    async fn delete_view(&self, ctx: &CallContext, view: &ViewId) -> Result<(), RemoteError> {
        self.with_node("delete_view", ctx, |n| {
            n.views
                .remove(view)
                .map(|_| ())
                .ok_or_else(|| RemoteError::not_found(format!("view {view}")))
        })
        .await
    }

    async fn list_jobs(&self, ctx: &CallContext, view: &ViewId) -> Result<Vec<Job>, RemoteError> {
        self.with_node("list_jobs", ctx, |n| {
            let view = n.view(view)?;
            Ok(view
                .jobs
                .iter()
                .map(|name| {
                    n.jobs.get(name).cloned().unwrap_or(Job {
                        name: name.clone(),
                        last_build_id: None,
                        status: JobStatus::Unknown,
                    })
                })
                .collect())
        })
        .await
    }

    async fn get_job(&self, ctx: &CallContext, job: &JobName) -> Result<Job, RemoteError> {
        self.with_node("get_job", ctx, |n| n.job(job).cloned()).await
    }

    async fn start_job(&self, ctx: &CallContext, job: &JobName) -> Result<(), RemoteError> {
        self.with_node("start_job", ctx, |n| {
            n.job(job)?;
            let next = n
                .numbers(job)
                .last()
                .map_or(1, |last| last.as_u64() + 1);
            let number = BuildNumber::new(next);
            n.builds.insert(
                (job.clone(), number),
                Build {
                    id: number,
                    started_at: Timestamp::now(),
                    result: None,
                    building: true,
                    previous_id: None,
                    next_id: None,
                },
            );
            n.consoles.insert((job.clone(), number), (String::new(), false));
            if let Some(entry) = n.jobs.get_mut(job) {
                entry.status = JobStatus::Running;
                entry.last_build_id = Some(number);
            }
            Ok(())
        })
        .await
    }

    async fn stop_job(&self, ctx: &CallContext, job: &JobName) -> Result<(), RemoteError> {
        self.with_node("stop_job", ctx, |n| {
            n.job(job)?;
            if let Some(entry) = n.jobs.get_mut(job) {
                entry.status = JobStatus::Idle;
            }
            Ok(())
        })
        .await
    }

    async fn get_console(
        &self,
        ctx: &CallContext,
        job: &JobName,
        build: BuildNumber,
        offset: u64,
    ) -> Result<ConsoleChunk, RemoteError> {
        self.with_node("get_console", ctx, |n| {
            let (text, complete) = n
                .consoles
                .get(&(job.clone(), build))
                .ok_or_else(|| RemoteError::not_found(format!("build {job}#{build}")))?;
            let from = usize::try_from(offset).unwrap_or(usize::MAX).min(text.len());
            Ok(ConsoleChunk {
                text: text.get(from..).unwrap_or_default().to_string(),
                next_offset: text.len() as u64,
                complete: *complete,
            })
        })
        .await
    }

    async fn get_pipeline_overview(
        &self,
        ctx: &CallContext,
        job: &JobName,
        build: BuildNumber,
    ) -> Result<PipelineOverview, RemoteError> {
        self.with_node("get_pipeline_overview", ctx, |n| {
            n.overviews
                .get(&(job.clone(), build))
                .cloned()
                .ok_or_else(|| RemoteError::not_found(format!("pipeline {job}#{build}")))
        })
        .await
    }

    async fn get_pipeline_console(
        &self,
        ctx: &CallContext,
        job: &JobName,
        build: BuildNumber,
        stage: &StageId,
    ) -> Result<StageLog, RemoteError> {
        self.with_node("get_pipeline_console", ctx, |n| {
            n.stage_logs
                .get(&(job.clone(), build, stage.clone()))
                .cloned()
                .ok_or_else(|| RemoteError::not_found(format!("stage {stage} of {job}#{build}")))
        })
        .await
    }

    async fn get_build(
        &self,
        ctx: &CallContext,
        job: &JobName,
        selector: BuildSelector,
    ) -> Result<Build, RemoteError> {
        self.with_node("get_build", ctx, |n| {
            n.job(job)?;
            let numbers = n.numbers(job);
            let target = match selector {
                BuildSelector::Latest => numbers.last().copied(),
                BuildSelector::Number(id) => Some(id),
                BuildSelector::Previous(id) => numbers.iter().rev().find(|x| **x < id).copied(),
                BuildSelector::Next(id) => numbers.iter().find(|x| **x > id).copied(),
            };
            let target = target.ok_or_else(|| RemoteError::not_found(format!("build of {job}")))?;
            n.build(job, target)
        })
        .await
    }

    async fn delete_build(
        &self,
        ctx: &CallContext,
        job: &JobName,
        build: BuildNumber,
    ) -> Result<(), RemoteError> {
        self.with_node("delete_build", ctx, |n| {
            n.builds
                .remove(&(job.clone(), build))
                .ok_or_else(|| RemoteError::not_found(format!("build {job}#{build}")))?;
            n.consoles.remove(&(job.clone(), build));
            Ok(())
        })
        .await
    }
}

/// Shorthand for a [`ViewId`] in tests. Panics on an empty name.
pub fn view_id(name: &str) -> ViewId {
    ViewId::new(name).unwrap_or_else(|| panic!("empty view name"))
}

/// Shorthand for a [`JobName`] in tests. Panics on an empty name.
pub fn job_name(name: &str) -> JobName {
    JobName::new(name).unwrap_or_else(|| panic!("empty job name"))
}
