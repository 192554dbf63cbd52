//! Fetcher / dispatcher: pulls task batches from the control plane on kicks
//! and startup, and routes each record to the run, stop, test, file, or
//! session path.
//!
//! Fetchers coordinate with the self-updater through [`UpdaterGate`]: a
//! FIFO try-lock that fetchers pass through (never hold during I/O) plus an
//! in-flight counter the updater drains before replacing the binary.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::sleep;
use tracing::{error, info, warn};

use warden_core::config::AgentConfig;
use warden_core::types::{RepeatType, RunTaskInfo, SendFileTaskInfo, SessionTaskInfo};

use crate::factory::TaskFactory;
use crate::params::{IdentityParameterStore, ParameterStore};
use crate::periodic::PeriodicScheduler;
use crate::pool::WorkerPool;
use crate::power::{LoggingPowerAction, PowerAction};
pub use crate::reporter::FetchReason;
use crate::reporter::Reporter;
use crate::task::Task;

/// Returned by [`TaskEngine::fetch`] when an update procedure holds the gate.
pub const ERR_UPDATING_PROCEDURE_RUNNING: i32 = -7;

/// Fair lock + counter shared between fetchers and the self-updater.
///
/// A fetcher acquires the lock with a timeout and releases it immediately:
/// the lock's only job is to reject new fetches while an updater holds it
/// exclusively, concurrent fetchers are fine. The updater takes the lock,
/// then spins until the in-flight counter drains to zero.
#[derive(Debug, Default)]
pub struct UpdaterGate {
    lock: Mutex<()>,
    counter: AtomicI32,
}

/// Exclusive hold of the gate; fetches fail fast while this is alive.
pub struct UpdaterPermit<'a> {
    _guard: MutexGuard<'a, ()>,
}

pub(crate) struct FetchInFlight<'a> {
    gate: &'a UpdaterGate,
}

impl Drop for FetchInFlight<'_> {
    fn drop(&mut self) {
        self.gate.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl UpdaterGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass through the gate: acquire the (FIFO-fair) lock within `timeout`
    /// and release it at once.
    pub async fn try_pass(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.lock.lock()).await {
            Ok(guard) => {
                drop(guard);
                true
            }
            Err(_) => false,
        }
    }

    pub(crate) fn enter(&self) -> FetchInFlight<'_> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        FetchInFlight { gate: self }
    }

    pub fn in_flight(&self) -> i32 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Updater side: take the lock exclusively, then wait until no fetch is
    /// in flight. Dropping the permit reopens the gate.
    pub async fn begin_update(&self) -> UpdaterPermit<'_> {
        let guard = self.lock.lock().await;
        while self.counter.load(Ordering::SeqCst) != 0 {
            sleep(Duration::from_millis(10)).await;
        }
        UpdaterPermit { _guard: guard }
    }
}

/// File-transfer records are routed out of the execution core.
#[async_trait]
pub trait FileHandler: Send + Sync {
    async fn handle_files(&self, files: Vec<SendFileTaskInfo>);
}

/// Session records are routed out of the execution core.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    async fn handle_sessions(&self, sessions: Vec<SessionTaskInfo>);
}

pub struct LogOnlyFileHandler;

#[async_trait]
impl FileHandler for LogOnlyFileHandler {
    async fn handle_files(&self, files: Vec<SendFileTaskInfo>) {
        for file in files {
            warn!(task_id = %file.task_id, "file task routed without a transfer backend");
        }
    }
}

pub struct LogOnlySessionHandler;

#[async_trait]
impl SessionHandler for LogOnlySessionHandler {
    async fn handle_sessions(&self, sessions: Vec<SessionTaskInfo>) {
        for session in sessions {
            warn!(session_id = %session.session_id, "session task routed without a session backend");
        }
    }
}

pub struct TaskEngine {
    config: Arc<AgentConfig>,
    reporter: Arc<Reporter>,
    factory: Arc<TaskFactory>,
    periodic: PeriodicScheduler,
    run_pool: WorkerPool,
    precheck_pool: WorkerPool,
    gate: UpdaterGate,
    enabled: AtomicBool,
    param_store: Arc<dyn ParameterStore>,
    power: Arc<dyn PowerAction>,
    file_handler: Arc<dyn FileHandler>,
    session_handler: Arc<dyn SessionHandler>,
}

impl TaskEngine {
    pub fn new(config: Arc<AgentConfig>, reporter: Arc<Reporter>) -> Self {
        let factory = Arc::new(TaskFactory::new());
        let run_pool = WorkerPool::new(config.run_pool_size);
        Self {
            periodic: PeriodicScheduler::new(factory.clone(), run_pool.clone()),
            precheck_pool: WorkerPool::new(config.precheck_pool_size),
            run_pool,
            factory,
            reporter,
            gate: UpdaterGate::new(),
            enabled: AtomicBool::new(false),
            param_store: Arc::new(IdentityParameterStore),
            power: Arc::new(LoggingPowerAction),
            file_handler: Arc::new(LogOnlyFileHandler),
            session_handler: Arc::new(LogOnlySessionHandler),
            config,
        }
    }

    pub fn with_power(mut self, power: Arc<dyn PowerAction>) -> Self {
        self.power = power;
        self
    }

    pub fn with_param_store(mut self, store: Arc<dyn ParameterStore>) -> Self {
        self.param_store = store;
        self
    }

    pub fn with_file_handler(mut self, handler: Arc<dyn FileHandler>) -> Self {
        self.file_handler = handler;
        self
    }

    pub fn with_session_handler(mut self, handler: Arc<dyn SessionHandler>) -> Self {
        self.session_handler = handler;
        self
    }

    pub fn factory(&self) -> &Arc<TaskFactory> {
        &self.factory
    }

    pub fn periodic(&self) -> &PeriodicScheduler {
        &self.periodic
    }

    pub fn updater_gate(&self) -> &UpdaterGate {
        &self.gate
    }

    /// Allow fetching; flipped once at the end of agent startup wiring.
    pub fn enable_fetching(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn is_fetching_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Fetch a batch and dispatch it. Returns the number of actionable
    /// records, 0 when fetching is disabled, or
    /// [`ERR_UPDATING_PROCEDURE_RUNNING`] when the updater holds the gate.
    pub async fn fetch(&self, from_kick: bool, task_id: Option<&str>, cold_start: bool) -> i32 {
        if !self.is_fetching_enabled() {
            info!(from_kick, "fetching tasks is disabled, agent wiring not complete");
            return 0;
        }

        let timeout = Duration::from_millis(self.config.fetch_lock_timeout_ms);
        if !self.gate.try_pass(timeout).await {
            info!(from_kick, "fetch canceled, an updating procedure is running");
            return ERR_UPDATING_PROCEDURE_RUNNING;
        }
        let _in_flight = self.gate.enter();

        let reason = if from_kick {
            FetchReason::Kickoff
        } else {
            FetchReason::Startup
        };
        let mut size = self.fetch_once(reason, task_id, cold_start).await;

        // A kick promises work; an empty answer gets one delayed retry.
        if from_kick && size == 0 {
            sleep(Duration::from_millis(self.config.kick_retry_pause_ms)).await;
            size = self.fetch_once(FetchReason::Kickoff, task_id, false).await;
        }
        size
    }

    async fn fetch_once(
        &self,
        reason: FetchReason,
        task_id: Option<&str>,
        cold_start: bool,
    ) -> i32 {
        let batch = self.reporter.fetch_task_list(reason, task_id, cold_start).await;

        let files = batch.file_infos();
        let sessions = batch.session.clone();
        let runs = batch.run_infos();
        let stops = batch.stop_infos();
        let tests = batch.test_infos();
        let size = runs.len() + stops.len() + files.len() + sessions.len();

        if !files.is_empty() {
            self.file_handler.handle_files(files).await;
        }
        if !sessions.is_empty() {
            self.session_handler.handle_sessions(sessions).await;
        }
        for info in runs {
            self.dispatch_run_task(info).await;
        }
        for info in stops {
            self.dispatch_stop_task(info).await;
        }
        for info in tests {
            self.dispatch_test_task(info);
        }

        size as i32
    }

    fn new_task(&self, info: RunTaskInfo) -> Arc<Task> {
        Task::new(
            info,
            self.reporter.clone(),
            self.config.clone(),
            self.param_store.clone(),
            self.power.clone(),
        )
    }

    pub async fn dispatch_run_task(&self, info: RunTaskInfo) {
        let task_id = info.task_id.clone();
        info!(task_id = %task_id, repeat = ?info.repeat, "fetched task to run");

        match info.repeat {
            RepeatType::Once | RepeatType::NextRebootOnly | RepeatType::EveryReboot => {
                let task = self.new_task(info);
                if !self.factory.add_task(task.clone()) {
                    warn!(task_id = %task_id, "ignored duplicately fetched task");
                    return;
                }
                let factory = self.factory.clone();
                self.run_pool.spawn(async move {
                    let _ = task.run().await;
                    factory.remove_task(task.task_id());
                });
                info!(task_id = %task_id, "scheduled for pending or running");
            }
            RepeatType::Period | RepeatType::Rate | RepeatType::At => {
                let task = self.new_task(info);
                match self.periodic.schedule(task) {
                    Ok(()) => info!(task_id = %task_id, "scheduled periodic task"),
                    Err(err) => {
                        error!(task_id = %task_id, error = %err, "failed to schedule periodic task");
                    }
                }
            }
        }
    }

    pub async fn dispatch_stop_task(&self, info: RunTaskInfo) {
        let task_id = info.task_id.clone();
        info!(task_id = %task_id, repeat = ?info.repeat, "fetched task to cancel");

        match info.repeat {
            RepeatType::Once | RepeatType::NextRebootOnly | RepeatType::EveryReboot => {
                match self.factory.get_task(&task_id) {
                    Some(task) => {
                        task.cancel().await;
                        info!(task_id = %task_id, "canceled task and invocation");
                    }
                    None => {
                        warn!(task_id = %task_id, "ignore stop for task already finished or failed");
                    }
                }
            }
            RepeatType::Period | RepeatType::Rate | RepeatType::At => {
                match self.periodic.cancel(&info).await {
                    Ok(()) => info!(task_id = %task_id, "canceled periodic task"),
                    Err(err) => {
                        error!(task_id = %task_id, error = %err, "failed to cancel periodic task");
                    }
                }
            }
        }
    }

    /// Test tasks are pre-checked only, whatever their repeat type; they
    /// never schedule a timer or execute.
    pub fn dispatch_test_task(&self, info: RunTaskInfo) {
        let task_id = info.task_id.clone();
        info!(task_id = %task_id, "fetched task to pre-check");

        if self.factory.contains_task(&task_id) {
            warn!(task_id = %task_id, "ignored duplicately fetched test task");
            return;
        }
        let task = self.new_task(info);
        self.precheck_pool.spawn(async move {
            let _ = task.pre_check(true).await;
        });
    }

    /// Stop periodic timers; used on shutdown.
    pub fn shutdown(&self) {
        self.periodic.shutdown();
    }
}
