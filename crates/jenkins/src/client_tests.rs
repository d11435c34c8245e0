//! Tests for [`JenkinsClient`] against an in-process fake Jenkins.

use super::*;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode as AxumStatus};
use axum::response::{AppendHeaders, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use hub::{JobStatus, NodeKind, Secret};
use serde_json::json;

/// `svc:token` in HTTP basic auth form.
const AUTH: &str = "Basic c3ZjOnRva2Vu";

fn authorised(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == AUTH)
}

async fn serve(router: Router) -> CallContext {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    context(port)
}

fn context(port: u16) -> CallContext {
    CallContext::new(
        NodeConnection {
            node: None,
            kind: NodeKind::Jenkins,
            host: "127.0.0.1".into(),
            port,
            account: "svc".into(),
            secret: Secret::new("token"),
            tls: false,
        },
        Duration::from_secs(2),
    )
}

fn client() -> JenkinsClient {
    JenkinsClient::new(JenkinsConfig {
        max_retries: 1,
        retry_backoff: Duration::from_millis(1),
        ..JenkinsConfig::default()
    })
    .unwrap()
}

fn job(name: &str) -> JobName {
    JobName::new(name).unwrap()
}

#[tokio::test]
async fn list_views_sends_basic_auth_and_maps_jobs() {
    let router = Router::new().route(
        "/api/json",
        get(|headers: HeaderMap| async move {
            if !authorised(&headers) {
                return AxumStatus::UNAUTHORIZED.into_response();
            }
            Json(json!({
                "views": [
                    {
                        "name": "all",
                        "jobs": [
                            { "name": "build" },
                            { "name": "deploy", "fullName": "team/deploy" }
                        ]
                    },
                    { "name": "nightly", "description": "", "jobs": [] }
                ]
            }))
            .into_response()
        }),
    );
    let ctx = serve(router).await;

    let views = client().list_views(&ctx).await.unwrap();
    assert_eq!(views.len(), 2);
    assert_eq!(views[0].id.as_str(), "all");
    assert_eq!(views[0].jobs, vec![job("build"), job("team/deploy")]);
    assert_eq!(views[1].description, None);
}

#[tokio::test]
async fn rejected_credentials_map_to_auth_rejected() {
    let router = Router::new().route("/api/json", get(|| async { AxumStatus::FORBIDDEN }));
    let ctx = serve(router).await;

    let err = client().list_views(&ctx).await.unwrap_err();
    assert_eq!(err, RemoteError::AuthRejected);
}

#[tokio::test]
async fn missing_job_maps_to_not_found() {
    let ctx = serve(Router::new()).await;

    let err = client().get_job(&ctx, &job("ghost")).await.unwrap_err();
    assert!(matches!(err, RemoteError::NotFound { .. }));
}

#[tokio::test]
async fn server_errors_are_not_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let router = Router::new().route(
        "/view/{view}/api/json",
        get(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                (AxumStatus::INTERNAL_SERVER_ERROR, "boom")
            }
        }),
    );
    let ctx = serve(router).await;

    let err = client()
        .list_jobs(&ctx, &ViewId::new("all").unwrap())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RemoteError::Remote {
            code: 500,
            message: "boom".into()
        }
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn closed_port_is_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = client().list_views(&context(port)).await.unwrap_err();
    assert!(matches!(err, RemoteError::Unreachable { .. }));
}

#[tokio::test]
async fn folder_jobs_are_addressed_through_nested_paths() {
    let router = Router::new().route(
        "/job/{folder}/job/{name}/api/json",
        get(|Path((folder, name)): Path<(String, String)>| async move {
            let full_name = format!("{folder}/{name}");
            Json(json!({ "name": name, "fullName": full_name, "color": "blue_anime" }))
        }),
    );
    let ctx = serve(router).await;

    let found = client().get_job(&ctx, &job("team/deploy")).await.unwrap();
    assert_eq!(found.name, job("team/deploy"));
    assert_eq!(found.status, JobStatus::Running);
}

#[tokio::test]
async fn start_job_posts_with_crumb_header() {
    let router = Router::new()
        .route(
            "/crumbIssuer/api/json",
            get(|| async { Json(json!({ "crumb": "abc", "crumbRequestField": "Jenkins-Crumb" })) }),
        )
        .route(
            "/job/{name}/build",
            post(|headers: HeaderMap| async move {
                match headers.get("Jenkins-Crumb").and_then(|v| v.to_str().ok()) {
                    Some("abc") => AxumStatus::CREATED,
                    _ => AxumStatus::FORBIDDEN,
                }
            }),
        );
    let ctx = serve(router).await;

    client().start_job(&ctx, &job("deploy")).await.unwrap();
}

#[tokio::test]
async fn crumb_session_cookie_is_sent_with_the_mutation() {
    let router = Router::new()
        .route(
            "/crumbIssuer/api/json",
            get(|| async {
                (
                    AppendHeaders([
                        ("set-cookie", "JSESSIONID.a1=node0xyz; Path=/; HttpOnly"),
                        ("set-cookie", "remember=1; Path=/"),
                    ]),
                    Json(json!({ "crumb": "abc", "crumbRequestField": "Jenkins-Crumb" })),
                )
            }),
        )
        .route(
            "/job/{name}/build",
            post(|headers: HeaderMap| async move {
                match headers.get("cookie").and_then(|v| v.to_str().ok()) {
                    Some("JSESSIONID.a1=node0xyz; remember=1") => AxumStatus::CREATED,
                    _ => AxumStatus::FORBIDDEN,
                }
            }),
        );
    let ctx = serve(router).await;

    client().start_job(&ctx, &job("deploy")).await.unwrap();
}

#[test]
fn session_cookies_keep_only_name_value_pairs() {
    let mut headers = HeaderMap::new();
    assert_eq!(session_cookies(&headers), None);
    headers.append("set-cookie", "a=1; Path=/".parse().unwrap());
    headers.append("set-cookie", "b=2".parse().unwrap());
    assert_eq!(session_cookies(&headers).as_deref(), Some("a=1; b=2"));
}

#[tokio::test]
async fn mutations_work_without_a_crumb_issuer() {
    let router = Router::new().route("/job/{name}/7/doDelete", post(|| async { AxumStatus::OK }));
    let ctx = serve(router).await;

    client()
        .delete_build(&ctx, &job("deploy"), BuildNumber::new(7))
        .await
        .unwrap();
}

#[tokio::test]
async fn console_reads_progressive_text_headers() {
    let router = Router::new().route(
        "/job/{name}/{number}/logText/progressiveText",
        get(|Query(query): Query<HashMap<String, String>>| async move {
            let start: usize = query.get("start").and_then(|s| s.parse().ok()).unwrap_or(0);
            let log = "line one\nline two\n";
            let more = if start == 0 { "true" } else { "false" };
            (
                [("X-Text-Size", log.len().to_string()), ("X-More-Data", more.to_string())],
                log[start..].to_string(),
            )
        }),
    );
    let ctx = serve(router).await;
    let client = client();

    let first = client
        .get_console(&ctx, &job("deploy"), BuildNumber::new(3), 0)
        .await
        .unwrap();
    assert_eq!(first.text, "line one\nline two\n");
    assert_eq!(first.next_offset, 18);
    assert!(!first.complete);

    let second = client
        .get_console(&ctx, &job("deploy"), BuildNumber::new(3), 9)
        .await
        .unwrap();
    assert_eq!(second.text, "line two\n");
    assert!(second.complete);
}

#[tokio::test]
async fn previous_build_follows_the_anchor_link() {
    let router = Router::new().route(
        "/job/{name}/{number}/api/json",
        get(|Path((_, number)): Path<(String, u64)>| async move {
            let previous = if number > 1 {
                json!({ "number": number - 1 })
            } else {
                json!(null)
            };
            Json(json!({
                "number": number,
                "timestamp": 1_700_000_000_000_i64,
                "result": "SUCCESS",
                "building": false,
                "previousBuild": previous,
                "nextBuild": null
            }))
        }),
    );
    let ctx = serve(router).await;
    let client = client();

    let build = client
        .get_build(&ctx, &job("deploy"), BuildSelector::Previous(BuildNumber::new(5)))
        .await
        .unwrap();
    assert_eq!(build.id, BuildNumber::new(4));
    assert!(build.is_finished());

    let err = client
        .get_build(&ctx, &job("deploy"), BuildSelector::Next(BuildNumber::new(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::NotFound { .. }));
}

#[tokio::test]
async fn pipeline_overview_is_read_from_wfapi() {
    let router = Router::new().route(
        "/job/{name}/{number}/wfapi/describe",
        get(|| async {
            Json(json!({
                "id": "9",
                "status": "FAILED",
                "stages": [{ "id": "6", "name": "Test", "status": "FAILED", "durationMillis": 42 }]
            }))
        }),
    );
    let ctx = serve(router).await;

    let overview = client()
        .get_pipeline_overview(&ctx, &job("deploy"), BuildNumber::new(9))
        .await
        .unwrap();
    assert_eq!(overview.build_id, BuildNumber::new(9));
    assert_eq!(overview.stages.len(), 1);
    assert_eq!(overview.stages[0].duration_millis, 42);
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

/// Request lines seen by a [`serve_raw`] server, in arrival order.
type Seen = Arc<Mutex<Vec<String>>>;

/// Minimal HTTP/1.1 server for transport-level failures. `respond` gets the
/// request line and its arrival index; `None` closes the connection without
/// answering. Every answer closes the connection too.
async fn serve_raw<F>(respond: F) -> (CallContext, Seen)
where
    F: Fn(&str, usize) -> Option<(u16, String)> + Send + Sync + 'static,
{
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let seen: Seen = Arc::default();
    let log = seen.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => head.extend_from_slice(&buf[..n]),
                }
            }
            let text = String::from_utf8_lossy(&head);
            let line = text.lines().next().unwrap_or_default().to_string();
            let index = {
                let mut log = log.lock().unwrap();
                log.push(line.clone());
                log.len() - 1
            };
            if let Some((status, body)) = respond(&line, index) {
                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        }
    });
    (context(port), seen)
}

fn count(seen: &Seen, prefix: &str) -> usize {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|line| line.starts_with(prefix))
        .count()
}

#[tokio::test]
async fn read_is_retried_after_a_dropped_connection() {
    let (ctx, seen) = serve_raw(|_, index| {
        (index > 0).then(|| (200, r#"{"views":[{"name":"all","jobs":[]}]}"#.to_string()))
    })
    .await;

    let views = client().list_views(&ctx).await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(count(&seen, "GET /api/json"), 2);
}

#[tokio::test]
async fn read_retries_are_bounded() {
    let (ctx, seen) = serve_raw(|_, _| None).await;

    let err = client().list_views(&ctx).await.unwrap_err();
    assert!(matches!(err, RemoteError::Unreachable { .. }));
    // One attempt plus `max_retries`.
    assert_eq!(count(&seen, "GET /api/json"), 2);
}

#[tokio::test]
async fn start_is_sent_once_even_when_the_connection_drops() {
    let (ctx, seen) = serve_raw(|line, _| {
        line.starts_with("GET /crumbIssuer/")
            .then(|| (404, String::new()))
    })
    .await;

    let err = client().start_job(&ctx, &job("deploy")).await.unwrap_err();
    assert!(matches!(err, RemoteError::Unreachable { .. }));
    assert_eq!(count(&seen, "POST /job/deploy/build"), 1);
}

#[tokio::test]
async fn build_delete_is_sent_once_even_when_the_connection_drops() {
    let (ctx, seen) = serve_raw(|line, _| {
        line.starts_with("GET /crumbIssuer/")
            .then(|| (404, String::new()))
    })
    .await;

    let err = client()
        .delete_build(&ctx, &job("deploy"), BuildNumber::new(3))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Unreachable { .. }));
    assert_eq!(count(&seen, "POST /job/deploy/3/doDelete"), 1);
}
