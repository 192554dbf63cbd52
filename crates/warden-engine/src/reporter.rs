//! Control-plane client.
//!
//! Every task event leaves the agent through here: batch fetches, precheck
//! verdicts, running-output chunks and the single terminal report. Terminal
//! and error posts retry up to the configured budget; output is code-page
//! converted on non-en-US Windows and `errDesc` is truncated to 255 bytes on
//! a UTF-8 boundary before the query layer URL-encodes it.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};
use warden_core::config::AgentConfig;
use warden_core::error::{InvalidTaskKind, PresetErrorCode};
use warden_core::textutil::{gbk_to_utf8, needs_codepage_conversion, safe_truncate_bytes};
use warden_core::timeutil::{now_with_timezone, to_accurate_millis, wall_clock_query};
use warden_core::types::{RepeatType, TaskBatch};

pub const FETCH_TASK_LIST: &str = "/agent/fetch-task-list";
pub const VERIFIED_TASK: &str = "/agent/verified-task";
pub const INVALID_TASK: &str = "/agent/invalid-task";
pub const RUNNING_OUTPUT: &str = "/agent/running-output";
pub const FINISH_OUTPUT: &str = "/agent/finish-output";
pub const TIMEOUT_OUTPUT: &str = "/agent/timeout-output";
pub const ERROR_OUTPUT: &str = "/agent/error-output";
pub const STOPPED_OUTPUT: &str = "/agent/stopped-output";
pub const GSHELL_CHECK: &str = "/agent/gshell-check";

const STOP_REASON_KILLED: &str = "killed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReason {
    Kickoff,
    Startup,
}

impl FetchReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchReason::Kickoff => "kickoff",
            FetchReason::Startup => "startup",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Finished,
    Timeout,
    Failed,
    Canceled,
}

impl TerminalStatus {
    fn path(self) -> &'static str {
        match self {
            TerminalStatus::Finished => FINISH_OUTPUT,
            TerminalStatus::Timeout => TIMEOUT_OUTPUT,
            TerminalStatus::Failed => ERROR_OUTPUT,
            TerminalStatus::Canceled => STOPPED_OUTPUT,
        }
    }
}

/// Monotonic-corrected start/end stamps of one invocation, unix millis.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportTimes {
    pub start_ms: i64,
    pub end_ms: i64,
}

pub struct Reporter {
    client: reqwest::Client,
    base_url: String,
    retry_attempts: u32,
    retry_pause: Duration,
}

impl Reporter {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build http client"),
            base_url: config.server_url.trim_end_matches('/').to_string(),
            retry_attempts: config.http_retry_attempts,
            retry_pause: Duration::from_millis(config.http_retry_pause_ms),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: String,
    ) -> anyhow::Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .query(query)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("{path} request failed with status {}", response.status());
        }
        Ok(response.text().await?)
    }

    async fn post_with_retry(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: String,
    ) -> anyhow::Result<String> {
        let mut last_err = match self.post(path, query, body.clone()).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };
        for _ in 0..self.retry_attempts {
            sleep(self.retry_pause).await;
            match self.post(path, query, body.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    /// Pull a task batch. Transport failures and unparseable bodies degrade
    /// to an empty batch; the next kick retries.
    pub async fn fetch_task_list(
        &self,
        reason: FetchReason,
        task_id: Option<&str>,
        cold_start: bool,
    ) -> TaskBatch {
        let mut query: Vec<(&str, String)> = vec![("reason", reason.as_str().to_string())];
        if reason == FetchReason::Startup {
            query.push(("cold_start", cold_start.to_string()));
        }
        if let Some(id) = task_id {
            query.push(("taskId", id.to_string()));
        }
        let (now, offset, tz_name) = now_with_timezone();
        query.push(("currentTime", to_accurate_millis(now).to_string()));
        query.push(("offset", offset.to_string()));
        query.push(("timeZone", tz_name));

        match self.post_with_retry(FETCH_TASK_LIST, &query, String::new()).await {
            Ok(body) if !body.trim().is_empty() => TaskBatch::parse(&body),
            Ok(_) => TaskBatch::default(),
            Err(err) => {
                warn!(error = %err, "failed to fetch task list");
                TaskBatch::default()
            }
        }
    }

    pub async fn send_task_verified(&self, task_id: &str) {
        let query = [("taskId", task_id.to_string())];
        if let Err(err) = self.post(VERIFIED_TASK, &query, String::new()).await {
            warn!(task_id, error = %err, "failed to report verified task");
        }
    }

    pub async fn send_invalid_task(&self, task_id: &str, kind: InvalidTaskKind, info: &str) {
        let query = [
            ("taskId", task_id.to_string()),
            ("param", kind.as_str().to_string()),
            ("value", info.to_string()),
        ];
        if let Err(err) = self.post(INVALID_TASK, &query, String::new()).await {
            warn!(task_id, error = %err, "failed to report invalid task");
        }
    }

    /// One pre-spawn ping on the running-output endpoint when the task asks
    /// for a start notification.
    pub async fn send_task_start(&self, task_id: &str, start_ms: i64, repeat: RepeatType) {
        let mut query = vec![
            ("taskId", task_id.to_string()),
            ("start", start_ms.to_string()),
        ];
        query.extend(wall_clock_query(repeat));
        if let Err(err) = self.post(RUNNING_OUTPUT, &query, String::new()).await {
            warn!(task_id, error = %err, "failed to report task start");
        }
    }

    pub async fn send_running_output(
        &self,
        task_id: &str,
        start_ms: i64,
        repeat: RepeatType,
        chunk: Vec<u8>,
    ) {
        let mut query = vec![
            ("taskId", task_id.to_string()),
            ("start", start_ms.to_string()),
        ];
        query.extend(wall_clock_query(repeat));
        let body = encode_output(chunk);
        if let Err(err) = self.post(RUNNING_OUTPUT, &query, body).await {
            debug!(task_id, error = %err, "failed to send running output");
        }
    }

    /// The single terminal report of an invocation.
    pub async fn send_output(
        &self,
        status: TerminalStatus,
        task_id: &str,
        times: ReportTimes,
        exit_code: i32,
        dropped: usize,
        repeat: RepeatType,
        output: Vec<u8>,
    ) {
        let mut query = vec![
            ("taskId", task_id.to_string()),
            ("start", times.start_ms.to_string()),
            ("end", times.end_ms.to_string()),
            ("exitCode", exit_code.to_string()),
            ("dropped", dropped.to_string()),
        ];
        if status == TerminalStatus::Canceled {
            query.push(("stopReason", STOP_REASON_KILLED.to_string()));
        }
        query.extend(wall_clock_query(repeat));

        let body = encode_output(output);
        if let Err(err) = self.post_with_retry(status.path(), &query, body).await {
            warn!(task_id, ?status, error = %err, "failed to deliver terminal report");
        }
    }

    /// Terminal report for a categorised failure, with `errCode`/`errDesc`.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_error(
        &self,
        task_id: &str,
        times: ReportTimes,
        exit_code: i32,
        dropped: usize,
        err_code: PresetErrorCode,
        err_desc: &str,
        repeat: RepeatType,
        output: Vec<u8>,
    ) {
        let mut query = vec![
            ("taskId", task_id.to_string()),
            ("start", times.start_ms.to_string()),
            ("end", times.end_ms.to_string()),
            ("exitCode", exit_code.to_string()),
            ("dropped", dropped.to_string()),
            ("errCode", err_code.code().to_string()),
            (
                "errDesc",
                safe_truncate_bytes(err_desc, 255).to_string(),
            ),
        ];
        query.extend(wall_clock_query(repeat));

        let body = encode_output(output);
        if let Err(err) = self.post_with_retry(ERROR_OUTPUT, &query, body).await {
            warn!(task_id, error = %err, "failed to deliver error report");
        }
    }

    /// Probe whether the control plane supports the hostpipe channel.
    pub async fn gshell_check(&self) -> bool {
        let body = match self.post(GSHELL_CHECK, &[], String::new()).await {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "gshell support probe failed");
                return false;
            }
        };
        serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|status| {
                status
                    .get("gshellSupport")
                    .and_then(|v| v.as_str())
                    .map(|v| v == "true")
            })
            .unwrap_or(false)
    }
}

fn encode_output(output: Vec<u8>) -> String {
    if needs_codepage_conversion() {
        gbk_to_utf8(&output)
    } else {
        String::from_utf8_lossy(&output).into_owned()
    }
}
