#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::Uri;
use axum::routing::{any, post};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::net::TcpListener;

use warden_core::AgentConfig;
use warden_core::types::{OutputInfo, RepeatType, RunTaskInfo};

#[derive(Debug, Clone)]
pub struct Recorded {
    pub path: String,
    pub query: String,
    pub body: String,
}

pub type RequestLog = Arc<Mutex<Vec<Recorded>>>;

async fn record(State(log): State<RequestLog>, uri: Uri, body: String) -> String {
    log.lock().expect("request log").push(Recorded {
        path: uri.path().to_string(),
        query: uri.query().unwrap_or("").to_string(),
        body,
    });
    String::new()
}

/// Mock control plane recording every post and answering with empty bodies.
pub async fn spawn_control_plane() -> (SocketAddr, RequestLog) {
    spawn_control_plane_with_batch(String::new()).await
}

/// Mock control plane whose fetch-task-list endpoint answers with the given
/// batch body; everything is recorded.
pub async fn spawn_control_plane_with_batch(batch_body: String) -> (SocketAddr, RequestLog) {
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));

    let fetch_log = log.clone();
    let app = Router::new()
        .route(
            "/agent/fetch-task-list",
            post(move |uri: Uri, body: String| {
                let batch = batch_body.clone();
                let log = fetch_log.clone();
                async move {
                    log.lock().expect("request log").push(Recorded {
                        path: uri.path().to_string(),
                        query: uri.query().unwrap_or("").to_string(),
                        body,
                    });
                    batch
                }
            }),
        )
        .fallback(any(record))
        .with_state(log.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve test app");
    });
    (addr, log)
}

pub fn test_config(addr: SocketAddr, script_dir: &Path) -> AgentConfig {
    AgentConfig {
        server_url: format!("http://{addr}"),
        script_dir: script_dir.to_path_buf(),
        hybrid: false,
        fetch_lock_timeout_ms: 2_000,
        http_retry_attempts: 1,
        http_retry_pause_ms: 10,
        kick_retry_pause_ms: 50,
        hostpipe_poll_ms: 200,
        run_pool_size: 4,
        precheck_pool_size: 2,
    }
}

pub fn b64(script: &str) -> String {
    BASE64.encode(script)
}

pub fn shell_task(task_id: &str, script: &str, timeout: &str) -> RunTaskInfo {
    RunTaskInfo {
        instance_id: "i-test".into(),
        command_type: "RunShellScript".into(),
        task_id: task_id.into(),
        command_id: format!("c-{task_id}"),
        timeout: timeout.into(),
        content: b64(script),
        output: OutputInfo {
            interval: 1000,
            log_quota: 12_000,
            skip_empty: true,
            send_start: false,
        },
        repeat: RepeatType::Once,
        ..Default::default()
    }
}

pub fn posts_to(log: &RequestLog, path: &str) -> Vec<Recorded> {
    log.lock()
        .expect("request log")
        .iter()
        .filter(|r| r.path == path)
        .cloned()
        .collect()
}

pub fn terminal_posts(log: &RequestLog) -> Vec<Recorded> {
    log.lock()
        .expect("request log")
        .iter()
        .filter(|r| {
            matches!(
                r.path.as_str(),
                "/agent/finish-output"
                    | "/agent/timeout-output"
                    | "/agent/error-output"
                    | "/agent/stopped-output"
            )
        })
        .cloned()
        .collect()
}

pub async fn wait_for_post(log: &RequestLog, path: &str, timeout: Duration) -> Recorded {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(found) = posts_to(log, path).into_iter().next() {
            return found;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no post to {path} within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub fn query_param(recorded: &Recorded, key: &str) -> Option<String> {
    recorded
        .query
        .split('&')
        .find_map(|pair| pair.strip_prefix(&format!("{key}=")))
        .map(|v| v.to_string())
}
