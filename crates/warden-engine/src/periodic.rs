//! Periodic task scheduler: one timer plus one reusable invocation per task
//! id, with the non-overlap guarantee enforced through factory registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tracing::{info, warn};
use warden_core::error::{EngineError, EngineResult};
use warden_core::types::RunTaskInfo;

use crate::factory::TaskFactory;
use crate::pool::WorkerPool;
use crate::task::Task;
use crate::timer::{Timer, TimerCallback, TimerManager};

struct PeriodicTaskSchedule {
    timer: Arc<Timer>,
    reusable_invocation: Arc<Task>,
}

pub struct PeriodicScheduler {
    schedules: StdMutex<HashMap<String, PeriodicTaskSchedule>>,
    timer_manager: TimerManager,
    factory: Arc<TaskFactory>,
    run_pool: WorkerPool,
}

impl PeriodicScheduler {
    pub fn new(factory: Arc<TaskFactory>, run_pool: WorkerPool) -> Self {
        Self {
            schedules: StdMutex::new(HashMap::new()),
            timer_manager: TimerManager,
            factory,
            run_pool,
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.schedules
            .lock()
            .expect("periodic schedules poisoned")
            .contains_key(task_id)
    }

    /// Register a timer for the task. Idempotent: a task id that is already
    /// scheduled is left untouched.
    pub fn schedule(&self, task: Arc<Task>) -> EngineResult<()> {
        let task_id = task.task_id().to_string();
        let mut schedules = self.schedules.lock().expect("periodic schedules poisoned");
        if schedules.contains_key(&task_id) {
            info!(task_id = %task_id, "periodic task already registered");
            return Ok(());
        }

        let callback = exclusive_invocation_callback(
            self.factory.clone(),
            self.run_pool.clone(),
            task.clone(),
        );
        let timer = self.timer_manager.create_timer(
            task.info().repeat,
            &task.info().cron_at,
            callback,
        )?;

        schedules.insert(
            task_id.clone(),
            PeriodicTaskSchedule {
                timer: timer.clone(),
                reusable_invocation: task,
            },
        );

        if let Err(err) = timer.run() {
            self.timer_manager.delete_timer(&timer);
            schedules.remove(&task_id);
            return Err(err);
        }
        info!(task_id = %task_id, "periodic task registered and timer armed");
        Ok(())
    }

    /// Tear down the schedule. The server always receives a terminal ACK for
    /// a cancel it issued: a running invocation is canceled, otherwise a
    /// `canceled` report is synthesised from the reusable invocation.
    pub async fn cancel(&self, info: &RunTaskInfo) -> EngineResult<()> {
        let schedule = {
            let mut schedules = self.schedules.lock().expect("periodic schedules poisoned");
            schedules
                .remove(&info.task_id)
                .ok_or_else(|| EngineError::UnregisteredPeriodicTask(info.task_id.clone()))?
        };
        self.timer_manager.delete_timer(&schedule.timer);
        info!(task_id = %info.task_id, "periodic task deregistered");

        if let Some(running) = self.factory.get_task(&info.task_id) {
            info!(task_id = %info.task_id, "cancel running invocation of periodic task");
            running.cancel().await;
        } else {
            schedule.reusable_invocation.send_canceled_ack().await;
            info!(task_id = %info.task_id, "sent canceled ack for idle periodic task");
        }
        Ok(())
    }

    /// Stop every armed timer; used on agent shutdown.
    pub fn shutdown(&self) {
        let mut schedules = self.schedules.lock().expect("periodic schedules poisoned");
        for (_, schedule) in schedules.drain() {
            self.timer_manager.delete_timer(&schedule.timer);
        }
    }
}

/// Timer callback firing one invocation, skipped entirely while the previous
/// invocation of the same task id is still registered in the factory.
fn exclusive_invocation_callback(
    factory: Arc<TaskFactory>,
    run_pool: WorkerPool,
    task: Arc<Task>,
) -> TimerCallback {
    Arc::new(move || {
        let factory = factory.clone();
        let run_pool = run_pool.clone();
        let task = task.clone();
        Box::pin(async move {
            // Registration doubles as the overlap check: it fails while the
            // previous invocation is still live.
            if !factory.add_task(task.clone()) {
                warn!(task_id = %task.task_id(), "skip invocation overlapping a running one");
                return;
            }
            let remove_from = factory.clone();
            run_pool.spawn(async move {
                let _ = task.run().await;
                remove_from.remove_task(task.task_id());
            });
        })
    })
}
