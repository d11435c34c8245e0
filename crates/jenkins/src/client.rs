//! [`JenkinsClient`]: the [`RemoteClient`] implementation for Jenkins nodes.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use hub::{
    Build, BuildNumber, BuildSelector, CallContext, ConsoleChunk, Job, JobName, NodeConnection,
    PipelineOverview, RemoteClient, RemoteError, RetryPolicy, StageId, StageLog, View, ViewId,
    ViewSpec, ViewUpdate,
};

use crate::wire::{
    self, BuildPayload, CrumbPayload, DescribePayload, JobPayload, RootPayload, StageLogPayload,
    ViewPayload, BUILD_TREE, JOB_TREE, VIEWS_TREE, VIEW_TREE,
};

/// A CSRF crumb and the session it belongs to.
struct Crumb {
    payload: CrumbPayload,
    /// `Cookie` header value echoing the issuer's `Set-Cookie` pairs.
    cookies: Option<String>,
}

/// Longest remote error body carried into a [`RemoteError::Remote`] message.
const MAX_ERROR_BODY: usize = 256;

/// Jenkins class used for views created through the control plane.
const LIST_VIEW_MODE: &str = "hudson.model.ListView";

/// Tuning knobs for [`JenkinsClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JenkinsConfig {
    /// How many times an idempotent read is repeated after a transport failure.
    pub max_retries: u32,
    /// Base back-off between read retries; multiplied by the attempt number.
    pub retry_backoff: Duration,
    /// `User-Agent` sent with every request.
    pub user_agent: String,
}

impl Default for JenkinsConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff: Duration::from_millis(200),
            user_agent: concat!("cihub/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Failure to construct a [`JenkinsClient`].
#[derive(Debug, Error)]
pub enum JenkinsError {
    /// The underlying HTTP client could not be built (e.g. TLS backend init).
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Talks to Jenkins masters over their JSON API.
///
/// Holds no per-node state: the connection pool inside [`reqwest::Client`] is
/// shared by all nodes and is safe for concurrent use, and every call reads
/// its target and credentials from the [`CallContext`].
#[derive(Debug, Clone)]
pub struct JenkinsClient {
    http: reqwest::Client,
    config: JenkinsConfig,
}

impl JenkinsClient {
    /// Creates a client with the given configuration.
    pub fn new(config: JenkinsConfig) -> Result<Self, JenkinsError> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { http, config })
    }

    // -----------------------------------------------------------------------
    // Request plumbing
    // -----------------------------------------------------------------------

    /// Sends one authenticated request and classifies the response status.
    async fn send(
        &self,
        ctx: &CallContext,
        request: RequestBuilder,
        what: &str,
    ) -> Result<Response, RemoteError> {
        let conn = &ctx.connection;
        let response = request
            .basic_auth(&conn.account, Some(conn.secret.expose()))
            .timeout(ctx.timeout)
            .send()
            .await
            .map_err(transport_error)?;
        classify(response, what).await
    }

    /// Repeats `op` while it fails with a retryable error, up to
    /// `max_retries` extra attempts. Only used for idempotent reads.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err) if attempt < self.config.max_retries => match err.retry_policy() {
                    RetryPolicy::Retryable { after } => {
                        attempt += 1;
                        let delay = after.unwrap_or(self.config.retry_backoff * attempt);
                        debug!(what, attempt, ?delay, error = %err, "retrying read");
                        tokio::time::sleep(delay).await;
                    }
                    RetryPolicy::NonRetryable => return Err(err),
                },
                other => return other,
            }
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        url: Url,
        what: &str,
    ) -> Result<T, RemoteError> {
        let url = &url;
        self.with_retries(what, move || async move {
            let response = self.send(ctx, self.http.get(url.clone()), what).await?;
            response
                .json::<T>()
                .await
                .map_err(|e| wire::malformed(format!("{what}: {e}")))
        })
        .await
    }

    /// Fetches a CSRF crumb. Nodes with crumbs disabled answer 404.
    ///
    /// Jenkins binds crumbs to the web session that requested them, so the
    /// session cookies of the answer travel with the crumb.
    async fn crumb(&self, ctx: &CallContext) -> Result<Option<Crumb>, RemoteError> {
        let url = endpoint(&ctx.connection, &["crumbIssuer", "api", "json"])?;
        let url = &url;
        let fetched = self
            .with_retries("crumb", move || async move {
                let response = self.send(ctx, self.http.get(url.clone()), "crumb").await?;
                let cookies = session_cookies(response.headers());
                let payload = response
                    .json::<CrumbPayload>()
                    .await
                    .map_err(|e| wire::malformed(format!("crumb: {e}")))?;
                Ok(Crumb { payload, cookies })
            })
            .await;
        match fetched {
            Ok(crumb) => Ok(Some(crumb)),
            Err(RemoteError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Sends a mutating POST, with crumb and optional form body. Never retried.
    async fn post(
        &self,
        ctx: &CallContext,
        url: Url,
        form: Option<&[(&str, &str)]>,
        what: &str,
    ) -> Result<Response, RemoteError> {
        let mut request = self.http.post(url);
        if let Some(crumb) = self.crumb(ctx).await? {
            let field = crumb.payload.crumb_request_field;
            request = request.header(field.as_str(), crumb.payload.crumb);
            if let Some(cookies) = crumb.cookies {
                request = request.header(header::COOKIE, cookies);
            }
        }
        if let Some(form) = form {
            request = request.form(form);
        }
        self.send(ctx, request, what).await
    }

    async fn fetch_build(
        &self,
        ctx: &CallContext,
        job: &JobName,
        build: &str,
    ) -> Result<Build, RemoteError> {
        let mut url = job_endpoint(&ctx.connection, job, &[build, "api", "json"])?;
        url.query_pairs_mut().append_pair("tree", BUILD_TREE);
        let what = format!("build {job}#{build}");
        self.get_json::<BuildPayload>(ctx, url, &what)
            .await?
            .into_build()
    }

    async fn set_membership(
        &self,
        ctx: &CallContext,
        view: &ViewId,
        current: &[JobName],
        desired: &[JobName],
    ) -> Result<(), RemoteError> {
        for job in desired.iter().filter(|j| !current.contains(j)) {
            let mut url = endpoint(&ctx.connection, &["view", view.as_str(), "addJobToView"])?;
            url.query_pairs_mut().append_pair("name", job.as_str());
            self.post(ctx, url, None, &format!("add {job} to view {view}"))
                .await?;
        }
        for job in current.iter().filter(|j| !desired.contains(j)) {
            let mut url = endpoint(&ctx.connection, &["view", view.as_str(), "removeJobFromView"])?;
            url.query_pairs_mut().append_pair("name", job.as_str());
            self.post(ctx, url, None, &format!("remove {job} from view {view}"))
                .await?;
        }
        Ok(())
    }

    async fn set_description(
        &self,
        ctx: &CallContext,
        view: &ViewId,
        description: &str,
    ) -> Result<(), RemoteError> {
        let url = endpoint(&ctx.connection, &["view", view.as_str(), "submitDescription"])?;
        self.post(
            ctx,
            url,
            Some(&[("description", description)]),
            &format!("describe view {view}"),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for JenkinsClient {
    async fn list_views(&self, ctx: &CallContext) -> Result<Vec<View>, RemoteError> {
        let mut url = endpoint(&ctx.connection, &["api", "json"])?;
        url.query_pairs_mut().append_pair("tree", VIEWS_TREE);
        let root: RootPayload = self.get_json(ctx, url, "views").await?;
        root.views.into_iter().map(ViewPayload::into_view).collect()
    }

    async fn get_view(&self, ctx: &CallContext, view: &ViewId) -> Result<View, RemoteError> {
        let mut url = endpoint(&ctx.connection, &["view", view.as_str(), "api", "json"])?;
        url.query_pairs_mut().append_pair("tree", VIEW_TREE);
        let payload: ViewPayload = self.get_json(ctx, url, &format!("view {view}")).await?;
        payload.into_view()
    }

    async fn create_view(&self, ctx: &CallContext, spec: &ViewSpec) -> Result<View, RemoteError> {
        let mut url = endpoint(&ctx.connection, &["createView"])?;
        url.query_pairs_mut().append_pair("name", spec.name.as_str());
        let json = serde_json::json!({ "name": spec.name.as_str(), "mode": LIST_VIEW_MODE })
            .to_string();
        self.post(
            ctx,
            url,
            Some(&[
                ("name", spec.name.as_str()),
                ("mode", LIST_VIEW_MODE),
                ("json", json.as_str()),
            ]),
            &format!("create view {}", spec.name),
        )
        .await?;

        self.set_membership(ctx, &spec.name, &[], &spec.jobs).await?;
        if let Some(description) = spec.description.as_deref() {
            self.set_description(ctx, &spec.name, description).await?;
        }
        self.get_view(ctx, &spec.name).await
    }

    async fn update_view(
        &self,
        ctx: &CallContext,
        view: &ViewId,
        update: &ViewUpdate,
    ) -> Result<View, RemoteError> {
        if let Some(desired) = update.jobs.as_deref() {
            let current = self.get_view(ctx, view).await?;
            self.set_membership(ctx, view, &current.jobs, desired).await?;
        }
        if let Some(description) = update.description.as_deref() {
            self.set_description(ctx, view, description).await?;
        }
        self.get_view(ctx, view).await
    }

    async fn delete_view(&self, ctx: &CallContext, view: &ViewId) -> Result<(), RemoteError> {
        let url = endpoint(&ctx.connection, &["view", view.as_str(), "doDelete"])?;
        self.post(ctx, url, None, &format!("view {view}")).await?;
        Ok(())
    }

    async fn list_jobs(&self, ctx: &CallContext, view: &ViewId) -> Result<Vec<Job>, RemoteError> {
        let mut url = endpoint(&ctx.connection, &["view", view.as_str(), "api", "json"])?;
        url.query_pairs_mut().append_pair("tree", VIEW_TREE);
        let payload: ViewPayload = self.get_json(ctx, url, &format!("view {view}")).await?;
        payload.into_jobs()
    }

    async fn get_job(&self, ctx: &CallContext, job: &JobName) -> Result<Job, RemoteError> {
        let mut url = job_endpoint(&ctx.connection, job, &["api", "json"])?;
        url.query_pairs_mut().append_pair("tree", JOB_TREE);
        let payload: JobPayload = self.get_json(ctx, url, &format!("job {job}")).await?;
        payload.into_job()
    }

    async fn start_job(&self, ctx: &CallContext, job: &JobName) -> Result<(), RemoteError> {
        let url = job_endpoint(&ctx.connection, job, &["build"])?;
        self.post(ctx, url, None, &format!("job {job}")).await?;
        Ok(())
    }

    async fn stop_job(&self, ctx: &CallContext, job: &JobName) -> Result<(), RemoteError> {
        let url = job_endpoint(&ctx.connection, job, &["lastBuild", "stop"])?;
        self.post(ctx, url, None, &format!("last build of {job}"))
            .await?;
        Ok(())
    }

    async fn get_console(
        &self,
        ctx: &CallContext,
        job: &JobName,
        build: BuildNumber,
        offset: u64,
    ) -> Result<ConsoleChunk, RemoteError> {
        let number = build.to_string();
        let mut url = job_endpoint(
            &ctx.connection,
            job,
            &[number.as_str(), "logText", "progressiveText"],
        )?;
        url.query_pairs_mut()
            .append_pair("start", &offset.to_string());
        let what = format!("console of {job}#{build}");
        let (url, what) = (&url, what.as_str());

        self.with_retries(what, move || async move {
            let response = self.send(ctx, self.http.get(url.clone()), what).await?;
            let headers = response.headers();
            let text_size = headers
                .get("X-Text-Size")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let more_data = headers
                .get("X-More-Data")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.eq_ignore_ascii_case("true"));
            let text = response.text().await.map_err(transport_error)?;
            let next_offset = text_size.unwrap_or(offset + text.len() as u64);
            Ok(ConsoleChunk {
                text,
                next_offset,
                complete: !more_data,
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
        let number = build.to_string();
        let url = job_endpoint(&ctx.connection, job, &[number.as_str(), "wfapi", "describe"])?;
        let payload: DescribePayload = self
            .get_json(ctx, url, &format!("pipeline of {job}#{build}"))
            .await?;
        payload.into_overview(build)
    }

    async fn get_pipeline_console(
        &self,
        ctx: &CallContext,
        job: &JobName,
        build: BuildNumber,
        stage: &StageId,
    ) -> Result<StageLog, RemoteError> {
        let number = build.to_string();
        let url = job_endpoint(
            &ctx.connection,
            job,
            &[number.as_str(), "execution", "node", stage.as_str(), "wfapi", "log"],
        )?;
        let payload: StageLogPayload = self
            .get_json(ctx, url, &format!("stage {stage} of {job}#{build}"))
            .await?;
        Ok(payload.into_log(stage.clone()))
    }

    async fn get_build(
        &self,
        ctx: &CallContext,
        job: &JobName,
        selector: BuildSelector,
    ) -> Result<Build, RemoteError> {
        match selector {
            BuildSelector::Latest => self.fetch_build(ctx, job, "lastBuild").await,
            BuildSelector::Number(n) => self.fetch_build(ctx, job, &n.to_string()).await,
            BuildSelector::Previous(n) => {
                let anchor = self.fetch_build(ctx, job, &n.to_string()).await?;
                let previous = anchor
                    .previous_id
                    .ok_or_else(|| RemoteError::not_found(format!("build before {job}#{n}")))?;
                self.fetch_build(ctx, job, &previous.to_string()).await
            }
            BuildSelector::Next(n) => {
                let anchor = self.fetch_build(ctx, job, &n.to_string()).await?;
                let next = anchor
                    .next_id
                    .ok_or_else(|| RemoteError::not_found(format!("build after {job}#{n}")))?;
                self.fetch_build(ctx, job, &next.to_string()).await
            }
        }
    }

    async fn delete_build(
        &self,
        ctx: &CallContext,
        job: &JobName,
        build: BuildNumber,
    ) -> Result<(), RemoteError> {
        let number = build.to_string();
        let url = job_endpoint(&ctx.connection, job, &[number.as_str(), "doDelete"])?;
        self.post(ctx, url, None, &format!("build {job}#{build}"))
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Builds `base/seg1/seg2/...`, percent-encoding each segment.
fn endpoint(conn: &NodeConnection, segments: &[&str]) -> Result<Url, RemoteError> {
    let label = conn.label();
    let mut url = Url::parse(&conn.base_url())
        .map_err(|e| RemoteError::unreachable(format!("invalid node address {label}: {e}")))?;
    let unroutable =
        || RemoteError::unreachable(format!("node address {label} cannot carry a path"));
    url.path_segments_mut()
        .map_err(|_| unroutable())?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Builds the URL of a (possibly folder-nested) job, then appends `tail`.
///
/// `team/deploy` becomes `job/team/job/deploy`.
fn job_endpoint(conn: &NodeConnection, job: &JobName, tail: &[&str]) -> Result<Url, RemoteError> {
    let mut segments: Vec<&str> = Vec::new();
    for part in job.as_str().split('/').filter(|p| !p.is_empty()) {
        segments.push("job");
        segments.push(part);
    }
    segments.extend_from_slice(tail);
    endpoint(conn, &segments)
}

/// Collects the `name=value` pairs of every `Set-Cookie` header.
fn session_cookies(headers: &HeaderMap) -> Option<String> {
    let pairs: Vec<&str> = headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .collect();
    (!pairs.is_empty()).then(|| pairs.join("; "))
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::unreachable("request timed out")
    } else if err.is_connect() {
        RemoteError::unreachable(format!("connection failed: {}", err.without_url()))
    } else {
        RemoteError::unreachable(err.without_url().to_string())
    }
}

async fn classify(response: Response, what: &str) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RemoteError::AuthRejected),
        StatusCode::NOT_FOUND => Err(RemoteError::not_found(what)),
        _ => {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.trim().chars().take(MAX_ERROR_BODY).collect();
            warn!(what, status = status.as_u16(), "remote returned an error");
            Err(RemoteError::Remote {
                code: status.as_u16(),
                message: if message.is_empty() {
                    status.to_string()
                } else {
                    message
                },
            })
        }
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
