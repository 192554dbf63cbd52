//! One invocation of a command: precheck, script materialisation, the
//! supervised run, and the single terminal report.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use warden_core::config::AgentConfig;
use warden_core::error::{EngineError, InvalidTaskKind, PresetErrorCode, categorize_io_error};
use warden_core::textutil::{needs_codepage_conversion, utf8_to_gbk};
use warden_core::timeutil::{stable_elapsed, to_accurate_millis};
use warden_core::types::{CommandKind, RunTaskInfo};

use crate::output::{DEFAULT_QUOTA_PRE, RUNNING_CHUNK, SharedBuffer, report_slice};
use crate::params::{ParameterStore, SECRET_SENTINEL, resolve_environment_parameters};
use crate::power::{EXIT_CODE_POWEROFF, EXIT_CODE_REBOOT, PowerAction};
use crate::reporter::{ReportTimes, Reporter, TerminalStatus};
use crate::script;
use crate::supervisor::{ExitKind, ProcessSupervisor, check_credentials};

#[derive(Debug, Default)]
struct Clock {
    start: Option<DateTime<Utc>>,
    start_ms: i64,
    end_ms: i64,
}

/// A single invocation. Non-periodic tasks create one per record; a
/// periodic schedule keeps one and reuses it, resetting the buffers between
/// fires.
pub struct Task {
    info: RunTaskInfo,
    reporter: Arc<Reporter>,
    config: Arc<AgentConfig>,
    param_store: Arc<dyn ParameterStore>,
    power: Arc<dyn PowerAction>,
    supervisor: ProcessSupervisor,
    output: SharedBuffer,
    data_sent: AtomicU32,
    dropped: AtomicUsize,
    exit_code: AtomicI32,
    canceled: tokio::sync::Mutex<bool>,
    clock: StdMutex<Clock>,
    working_dir: StdMutex<PathBuf>,
    home_dir: StdMutex<Option<PathBuf>>,
}

impl Task {
    pub fn new(
        info: RunTaskInfo,
        reporter: Arc<Reporter>,
        config: Arc<AgentConfig>,
        param_store: Arc<dyn ParameterStore>,
        power: Arc<dyn PowerAction>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            reporter,
            config,
            param_store,
            power,
            supervisor: ProcessSupervisor::new(),
            output: SharedBuffer::new(),
            data_sent: AtomicU32::new(0),
            dropped: AtomicUsize::new(0),
            exit_code: AtomicI32::new(0),
            canceled: tokio::sync::Mutex::new(false),
            clock: StdMutex::new(Clock::default()),
            working_dir: StdMutex::new(PathBuf::new()),
            home_dir: StdMutex::new(None),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.info.task_id
    }

    pub fn info(&self) -> &RunTaskInfo {
        &self.info
    }

    fn is_periodic(&self) -> bool {
        !self.info.cron_at.is_empty()
    }

    pub async fn is_canceled(&self) -> bool {
        *self.canceled.lock().await
    }

    fn start_ms(&self) -> i64 {
        self.clock.lock().expect("task clock poisoned").start_ms
    }

    fn report_times(&self) -> ReportTimes {
        let clock = self.clock.lock().expect("task clock poisoned");
        ReportTimes {
            start_ms: clock.start_ms,
            end_ms: clock.end_ms,
        }
    }

    /// Validate the record without executing it. Each failure posts an
    /// `invalid-task` report and aborts.
    pub async fn pre_check(&self, report_verified: bool) -> Result<(), EngineError> {
        let task_id = self.info.task_id.as_str();

        if !self.info.username.is_empty()
            && let Err(err) = check_credentials(&self.info.username, &self.info.password)
        {
            let detail = format!("UserInvalid_{}", self.info.username);
            self.reporter
                .send_invalid_task(task_id, InvalidTaskKind::UsernameOrPasswordInvalid, &detail)
                .await;
            error!(task_id, error = %err, "invalid task credentials");
            return Err(EngineError::InvalidTask {
                kind: InvalidTaskKind::UsernameOrPasswordInvalid,
                info: detail,
            });
        }

        if self.info.command_kind().is_none() {
            let detail = format!("TypeInvalid_{}", self.info.command_type);
            self.reporter
                .send_invalid_task(task_id, InvalidTaskKind::TypeInvalid, &detail)
                .await;
            error!(task_id, command_type = %self.info.command_type, "invalid command type");
            return Err(EngineError::InvalidTask {
                kind: InvalidTaskKind::TypeInvalid,
                info: detail,
            });
        }

        if let Err(err) = BASE64.decode(self.info.content.as_bytes()) {
            let detail = err.to_string();
            self.reporter
                .send_invalid_task(task_id, InvalidTaskKind::CommandContentInvalid, &detail)
                .await;
            error!(task_id, error = %err, "command content does not decode");
            return Err(EngineError::InvalidTask {
                kind: InvalidTaskKind::CommandContentInvalid,
                info: detail,
            });
        }

        match self.detect_home_directory() {
            Ok(home) => *self.home_dir.lock().expect("task state poisoned") = Some(home),
            Err(err) => warn!(task_id, error = %err, "home directory unavailable"),
        }

        match self.detect_working_directory() {
            Ok(dir) => *self.working_dir.lock().expect("task state poisoned") = dir,
            Err(err) => {
                self.reporter
                    .send_invalid_task(task_id, InvalidTaskKind::WorkingDirectory, &err.to_string())
                    .await;
                error!(task_id, error = %err, "invalid working directory");
                return Err(err);
            }
        }

        if report_verified {
            self.reporter.send_task_verified(task_id).await;
        }
        Ok(())
    }

    fn detect_home_directory(&self) -> Result<PathBuf, EngineError> {
        #[cfg(unix)]
        if !self.info.username.is_empty() {
            return crate::supervisor::lookup_user(&self.info.username)
                .map(|creds| creds.home)
                .map_err(|_| EngineError::HomeDirectoryNotAvailable);
        }
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(EngineError::HomeDirectoryNotAvailable)
    }

    fn detect_working_directory(&self) -> Result<PathBuf, EngineError> {
        if !self.info.working_dir.is_empty() {
            let dir = PathBuf::from(&self.info.working_dir);
            if dir.is_dir() {
                return Ok(dir);
            }
            return Err(EngineError::WorkingDirectoryNotExist);
        }

        if let Some(home) = self.home_dir.lock().expect("task state poisoned").clone()
            && home.is_dir()
        {
            return Ok(home);
        }
        script::script_dir(&self.config)
            .map_err(|_| EngineError::DefaultWorkingDirectoryNotAvailable)
    }

    /// Drive the invocation to its terminal report.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        self.reset_for_invocation();
        self.pre_check(false).await?;

        let task_id = self.info.task_id.clone();
        info!(task_id = %task_id, "run task");

        let dir = match script::script_dir(&self.config) {
            Ok(dir) => dir,
            Err(EngineError::WriteFile { path, source }) => {
                let (code, detail) =
                    categorize_io_error(&source, PresetErrorCode::GetScriptPathFailed);
                self.send_preset_error(code, &format!("{}: {detail}", path.display())).await;
                return Err(source.into());
            }
            Err(err) => {
                self.send_preset_error(PresetErrorCode::GetScriptPathFailed, &err.to_string())
                    .await;
                return Err(err.into());
            }
        };

        let Some(kind) = self.info.command_kind() else {
            // unreachable after pre_check, but the report path must exist
            self.send_preset_error(
                PresetErrorCode::UnknownCommandType,
                &self.info.command_type.clone(),
            )
            .await;
            anyhow::bail!("unknown command type {}", self.info.command_type);
        };
        let path = script::script_path(&self.info, kind, &dir);

        let decoded = match BASE64.decode(self.info.content.as_bytes()) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.send_preset_error(PresetErrorCode::Base64DecodeFailed, &err.to_string())
                    .await;
                return Err(err.into());
            }
        };

        let mut content = String::from_utf8_lossy(&decoded).into_owned();
        let mut script_to_delete: Option<PathBuf> = None;
        if self.info.enable_parameter {
            content = match resolve_environment_parameters(&content, &self.info.env_arguments) {
                Ok(resolved) => resolved,
                Err(marker) => {
                    self.reporter
                        .send_invalid_task(
                            &task_id,
                            InvalidTaskKind::InvalidEnvironmentParameter,
                            &marker,
                        )
                        .await;
                    anyhow::bail!("unresolved environment parameter {marker}");
                }
            };
            if content.contains(SECRET_SENTINEL) {
                script_to_delete = Some(path.clone());
            }
            content = match self.param_store.replace(&content) {
                Ok(replaced) => replaced,
                Err(err) => {
                    self.reporter
                        .send_invalid_task(
                            &task_id,
                            InvalidTaskKind::InvalidEnvironmentParameter,
                            &err.to_string(),
                        )
                        .await;
                    return Err(err);
                }
            };
        }
        if kind == CommandKind::Bat {
            content = format!("@echo off\r\n{content}");
        }
        let script_bytes = if needs_codepage_conversion() {
            utf8_to_gbk(&content)
        } else {
            content.into_bytes()
        };

        if let Err(err) = script::save_script_file(&path, &script_bytes).await {
            let tolerated = self.info.repeat.is_repeated()
                && matches!(err, EngineError::ScriptFileExists { .. });
            if !tolerated {
                match &err {
                    EngineError::ScriptFileExists { .. } => {
                        self.send_preset_error(
                            PresetErrorCode::ScriptFileExisted,
                            &err.to_string(),
                        )
                        .await;
                    }
                    EngineError::WriteFile { path, source } => {
                        let (code, detail) =
                            categorize_io_error(source, PresetErrorCode::SaveScriptFileFailed);
                        self.send_preset_error(
                            code,
                            &format!("saving script to {} failed: {detail}", path.display()),
                        )
                        .await;
                    }
                    other => {
                        self.send_preset_error(
                            PresetErrorCode::SaveScriptFileFailed,
                            &other.to_string(),
                        )
                        .await;
                    }
                }
                return Err(err.into());
            }
        }

        if (kind == CommandKind::Shell || !self.info.username.is_empty())
            && let Err(err) = script::set_executable(&path)
        {
            let code = if kind == CommandKind::Shell {
                PresetErrorCode::SetExecutablePermissionFailed
            } else {
                PresetErrorCode::SetWindowsPermissionFailed
            };
            self.send_preset_error(code, &err.to_string()).await;
            error!(task_id = %task_id, error = %err, "failed to set script permissions");
            return Err(err.into());
        }

        let timeout = self.info.timeout_seconds();
        let start = Utc::now();
        {
            let mut clock = self.clock.lock().expect("task clock poisoned");
            clock.start = Some(start);
            clock.start_ms = to_accurate_millis(start);
            clock.end_ms = 0;
        }

        let script_arg = path.to_string_lossy().into_owned();
        let (program, args) = match kind {
            CommandKind::PowerShell => {
                let policy: Vec<String> = ["Set-ExecutionPolicy", "RemoteSigned"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                if let Err(err) = self.supervisor.sync_run_simple("powershell", &policy, 10).await {
                    warn!(task_id = %task_id, error = %err, "failed to set powershell execution policy");
                }
                ("powershell".to_string(), vec!["-file".to_string(), script_arg])
            }
            CommandKind::Shell => ("sh".to_string(), vec!["-c".to_string(), script_arg]),
            CommandKind::Bat => (script_arg, Vec::new()),
        };

        if self.info.output.send_start {
            self.reporter
                .send_task_start(&task_id, self.start_ms(), self.info.repeat)
                .await;
        }

        let stdout_buf = SharedBuffer::new();
        let stderr_buf = SharedBuffer::new();
        let stop_sending = CancellationToken::new();
        let sender = self.spawn_running_output_sender(
            stdout_buf.clone(),
            stderr_buf.clone(),
            stop_sending.clone(),
        );

        if !self.info.username.is_empty() {
            self.supervisor.set_username(&self.info.username);
        }
        if !self.info.password.is_empty() {
            self.supervisor.set_password(&self.info.password);
        }
        if let Some(home) = self.home_dir.lock().expect("task state poisoned").clone() {
            self.supervisor.set_home_dir(&home);
        }
        let work_dir = self.working_dir.lock().expect("task state poisoned").clone();

        let outcome = self
            .supervisor
            .sync_run(
                &work_dir,
                &program,
                &args,
                &stdout_buf,
                &stderr_buf,
                &HashMap::new(),
                timeout,
            )
            .await;
        self.exit_code.store(outcome.exit_code, Ordering::SeqCst);

        stop_sending.cancel();
        let _ = sender.await;
        self.output.write(&stdout_buf.drain());
        self.output.write(&stderr_buf.drain());

        let end = Utc::now();
        {
            let mut clock = self.clock.lock().expect("task clock poisoned");
            clock.end_ms = to_accurate_millis(stable_elapsed(end, start));
        }

        // A canceled invocation already posted its terminal report; the kill
        // then surfaces here as Fail (or loses a race with the deadline), and
        // that late report is suppressed.
        match outcome.kind {
            ExitKind::Fail => match outcome.error {
                None => {
                    if !self.is_canceled().await {
                        info!(task_id = %task_id, exit_code = outcome.exit_code, "task failed");
                        self.send_terminal(TerminalStatus::Failed).await;
                    }
                }
                Some(source) => {
                    error!(task_id = %task_id, error = %source, "task execution error");
                    let (code, detail) = categorize_spawn_error(kind, &source);
                    let body = self.bounded_output();
                    let desc = format!("{}: {detail}", code.prefix());
                    self.reporter
                        .send_error(
                            &task_id,
                            self.report_times(),
                            self.exit_code.load(Ordering::SeqCst),
                            self.dropped.load(Ordering::SeqCst),
                            code,
                            &desc,
                            self.info.repeat,
                            body,
                        )
                        .await;
                }
            },
            ExitKind::Timeout => {
                if !self.is_canceled().await {
                    info!(task_id = %task_id, timeout, "task timed out");
                    self.send_terminal(TerminalStatus::Timeout).await;
                }
            }
            ExitKind::Success => {
                if !self.is_canceled().await {
                    info!(task_id = %task_id, exit_code = outcome.exit_code, "task finished");
                    self.send_terminal(TerminalStatus::Finished).await;
                }
            }
        }

        self.output.clear();
        if let Some(secret_script) = script_to_delete {
            let _ = tokio::fs::remove_file(&secret_script).await;
        }

        if outcome.kind == ExitKind::Success {
            match outcome.exit_code {
                EXIT_CODE_POWEROFF => {
                    info!(task_id = %task_id, "poweroff requested by task exit code");
                    self.power.poweroff().await;
                }
                EXIT_CODE_REBOOT => {
                    info!(task_id = %task_id, "reboot requested by task exit code");
                    self.power.reboot().await;
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Cancel the invocation. The `canceled` terminal report is posted
    /// *before* the child is signalled so it reflects output up to the
    /// cancellation; the run path then suppresses its own `finished`.
    pub async fn cancel(&self) {
        let mut canceled = self.canceled.lock().await;
        if *canceled {
            info!(task_id = %self.info.task_id, "cancel already observed");
            return;
        }
        *canceled = true;

        let end = Utc::now();
        {
            let mut clock = self.clock.lock().expect("task clock poisoned");
            clock.end_ms = match clock.start {
                Some(start) => to_accurate_millis(stable_elapsed(end, start)),
                None => to_accurate_millis(end),
            };
        }

        self.send_canceled_ack().await;
        self.supervisor.cancel();
    }

    /// Post a `canceled` terminal report with the currently buffered
    /// (bounded) output. Also used by the periodic scheduler to acknowledge
    /// a cancel when no invocation is running.
    pub async fn send_canceled_ack(&self) {
        let body = self.bounded_output();
        self.reporter
            .send_output(
                TerminalStatus::Canceled,
                &self.info.task_id,
                self.report_times(),
                self.exit_code.load(Ordering::SeqCst),
                self.dropped.load(Ordering::SeqCst),
                self.info.repeat,
                body,
            )
            .await;
    }

    fn spawn_running_output_sender(
        self: &Arc<Self>,
        stdout_buf: SharedBuffer,
        stderr_buf: SharedBuffer,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let task = Arc::clone(self);
        tokio::spawn(async move {
            task.data_sent.store(0, Ordering::SeqCst);
            // Periodic invocations report no running output, only terminals.
            if task.is_periodic() {
                return;
            }

            let interval = Duration::from_millis(task.info.output.interval.max(1000) as u64);
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if task.data_sent.load(Ordering::SeqCst) > DEFAULT_QUOTA_PRE {
                            return;
                        }
                        let mut chunk = stdout_buf.read_chunk(RUNNING_CHUNK);
                        chunk.extend(stderr_buf.read_chunk(RUNNING_CHUNK));
                        if chunk.is_empty() && task.info.output.skip_empty {
                            continue;
                        }
                        let sent = chunk.len() as u32;
                        task.reporter
                            .send_running_output(
                                &task.info.task_id,
                                task.start_ms(),
                                task.info.repeat,
                                chunk,
                            )
                            .await;
                        task.data_sent.fetch_add(sent, Ordering::SeqCst);
                    }
                    _ = stop.cancelled() => return,
                }
            }
        })
    }

    fn bounded_output(&self) -> Vec<u8> {
        let snapshot = self.output.snapshot();
        let (body, dropped) = report_slice(
            &snapshot,
            self.info.output.log_quota,
            self.data_sent.load(Ordering::SeqCst),
        );
        self.dropped.store(dropped, Ordering::SeqCst);
        body
    }

    async fn send_terminal(&self, status: TerminalStatus) {
        let body = self.bounded_output();
        self.reporter
            .send_output(
                status,
                &self.info.task_id,
                self.report_times(),
                self.exit_code.load(Ordering::SeqCst),
                self.dropped.load(Ordering::SeqCst),
                self.info.repeat,
                body,
            )
            .await;
    }

    async fn send_preset_error(&self, code: PresetErrorCode, detail: &str) {
        let desc = format!("{}: {detail}", code.prefix());
        self.reporter
            .send_error(
                &self.info.task_id,
                self.report_times(),
                self.exit_code.load(Ordering::SeqCst),
                self.dropped.load(Ordering::SeqCst),
                code,
                &desc,
                self.info.repeat,
                Vec::new(),
            )
            .await;
    }

    // The canceled flag and the supervisor's cancel signal deliberately
    // survive across invocations: a cancel tears the schedule down, so a
    // racing fire must stay suppressed.
    fn reset_for_invocation(&self) {
        self.output.clear();
        self.data_sent.store(0, Ordering::SeqCst);
        self.dropped.store(0, Ordering::SeqCst);
        self.exit_code.store(0, Ordering::SeqCst);
        *self.clock.lock().expect("task clock poisoned") = Clock::default();
    }
}

fn categorize_spawn_error(kind: CommandKind, source: &std::io::Error) -> (PresetErrorCode, String) {
    if source.kind() == std::io::ErrorKind::NotFound {
        let code = match kind {
            CommandKind::Shell => PresetErrorCode::SystemDefaultShellNotFound,
            CommandKind::PowerShell => PresetErrorCode::PowershellNotFound,
            CommandKind::Bat => PresetErrorCode::ExecuteScriptFailed,
        };
        return (code, source.to_string());
    }
    categorize_io_error(source, PresetErrorCode::ExecuteScriptFailed)
}
