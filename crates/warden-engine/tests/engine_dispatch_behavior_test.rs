//! Fetch → dispatch behavior of the task engine: batch routing, duplicate
//! rejection, updater-gate coordination, and periodic non-overlap.

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use warden_core::types::RepeatType;
use warden_engine::reporter::Reporter;
use warden_engine::{TaskEngine, TaskFactory};

use support::*;

fn engine_against(
    addr: std::net::SocketAddr,
    script_dir: &std::path::Path,
) -> (Arc<TaskEngine>, Arc<TaskFactory>) {
    let config = Arc::new(test_config(addr, script_dir));
    let reporter = Arc::new(Reporter::from_config(&config));
    let engine = Arc::new(TaskEngine::new(config, reporter));
    let factory = engine.factory().clone();
    (engine, factory)
}

fn run_batch_json(task_id: &str, script: &str) -> String {
    serde_json::json!({
        "instanceId": "i-test",
        "run": [{
            "task": {
                "type": "RunShellScript",
                "taskID": task_id,
                "commandId": "c-1",
                "commandContent": b64(script),
                "timeOut": "30"
            },
            "output": {"interval": 1000, "logQuota": 12000, "skipEmpty": true},
            "repeat": "Once"
        }]
    })
    .to_string()
}

#[tokio::test]
async fn fetch_dispatches_run_tasks_to_completion() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (addr, log) =
        spawn_control_plane_with_batch(run_batch_json("t-fetch", "echo fetched")).await;
    let (engine, factory) = engine_against(addr, tmp.path());

    engine.enable_fetching();
    let size = engine.fetch(false, None, true).await;
    assert_eq!(size, 1);

    let fetch = wait_for_post(&log, "/agent/fetch-task-list", Duration::from_secs(2)).await;
    assert!(fetch.query.contains("reason=startup"));
    assert!(fetch.query.contains("cold_start=true"));

    let finish = wait_for_post(&log, "/agent/finish-output", Duration::from_secs(5)).await;
    assert_eq!(query_param(&finish, "taskId").as_deref(), Some("t-fetch"));
    assert_eq!(finish.body, "fetched\n");

    // the invocation is removed from the factory after its terminal report
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!factory.contains_task("t-fetch"));
}

#[tokio::test]
async fn fetch_is_a_noop_until_enabled() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (addr, log) = spawn_control_plane().await;
    let (engine, _) = engine_against(addr, tmp.path());

    assert_eq!(engine.fetch(true, None, false).await, 0);
    assert!(posts_to(&log, "/agent/fetch-task-list").is_empty());
}

#[tokio::test]
async fn fetch_fails_fast_while_updater_holds_the_gate() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (addr, _log) = spawn_control_plane().await;
    let (engine, _) = engine_against(addr, tmp.path());
    engine.enable_fetching();

    let permit = engine.updater_gate().begin_update().await;

    let started = Instant::now();
    let result = engine.fetch(true, None, false).await;
    assert_eq!(result, warden_engine::fetch::ERR_UPDATING_PROCEDURE_RUNNING);
    assert!(started.elapsed() <= Duration::from_millis(2_500));

    drop(permit);
    assert_eq!(engine.fetch(true, None, false).await, 0);
}

#[tokio::test]
async fn duplicate_run_task_is_rejected_while_running() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (addr, log) = spawn_control_plane().await;
    let (engine, factory) = engine_against(addr, tmp.path());

    let info = shell_task("t-dup", "sleep 2", "30");
    engine.dispatch_run_task(info.clone()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(factory.contains_task("t-dup"));

    // the same id fetched again is dropped, not run twice
    engine.dispatch_run_task(info).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    wait_for_post(&log, "/agent/finish-output", Duration::from_secs(6)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(terminal_posts(&log).len(), 1);
}

#[tokio::test]
async fn stop_record_cancels_a_running_task() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (addr, log) = spawn_control_plane().await;
    let (engine, factory) = engine_against(addr, tmp.path());

    let info = shell_task("t-stop", "sleep 10", "30");
    engine.dispatch_run_task(info.clone()).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    engine.dispatch_stop_task(info).await;

    let stopped = wait_for_post(&log, "/agent/stopped-output", Duration::from_secs(3)).await;
    assert_eq!(query_param(&stopped, "taskId").as_deref(), Some("t-stop"));
    assert_eq!(query_param(&stopped, "stopReason").as_deref(), Some("killed"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(posts_to(&log, "/agent/finish-output").is_empty());
    assert!(!factory.contains_task("t-stop"));
}

#[tokio::test]
async fn stop_for_an_unknown_task_is_ignored() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (addr, log) = spawn_control_plane().await;
    let (engine, _) = engine_against(addr, tmp.path());

    engine.dispatch_stop_task(shell_task("t-ghost", "echo hi", "30")).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(terminal_posts(&log).is_empty());
}

#[tokio::test]
async fn test_record_prechecks_without_executing() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (addr, log) = spawn_control_plane().await;
    let (engine, _) = engine_against(addr, tmp.path());

    engine.dispatch_test_task(shell_task("t-test", "echo never-run", "30"));

    let verified = wait_for_post(&log, "/agent/verified-task", Duration::from_secs(2)).await;
    assert_eq!(query_param(&verified, "taskId").as_deref(), Some("t-test"));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(terminal_posts(&log).is_empty());
    assert!(!tmp.path().join("t-test.sh").exists());
}

#[tokio::test]
async fn periodic_invocations_never_overlap() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (addr, log) = spawn_control_plane().await;
    let (engine, factory) = engine_against(addr, tmp.path());

    let mut info = shell_task("t-cron", "sleep 2", "30");
    info.cron_at = "* * * * * *".into();
    info.repeat = RepeatType::Period;
    engine.dispatch_run_task(info.clone()).await;

    // fire-every-second against a 2 s task: watch for factory overlap
    let watch_until = Instant::now() + Duration::from_secs(5);
    while Instant::now() < watch_until {
        assert!(factory.len() <= 1, "overlapping periodic invocations");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    engine.dispatch_stop_task(info).await;
    let stopped = wait_for_post(&log, "/agent/stopped-output", Duration::from_secs(3)).await;
    assert_eq!(query_param(&stopped, "taskId").as_deref(), Some("t-cron"));

    let terminals = terminal_posts(&log);
    assert!(terminals.len() <= 5, "terminals: {terminals:?}");
    engine.shutdown();
}

#[tokio::test]
async fn canceling_an_idle_periodic_task_still_acks_the_server() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (addr, log) = spawn_control_plane().await;
    let (engine, _) = engine_against(addr, tmp.path());

    let mut info = shell_task("t-idle-cron", "echo tick", "30");
    // far-future fire time keeps the invocation idle for the whole test
    info.cron_at = "0 0 0 1 1 * 2099".into();
    info.repeat = RepeatType::Period;
    engine.dispatch_run_task(info.clone()).await;

    engine.dispatch_stop_task(info.clone()).await;
    let stopped = wait_for_post(&log, "/agent/stopped-output", Duration::from_secs(2)).await;
    assert_eq!(query_param(&stopped, "taskId").as_deref(), Some("t-idle-cron"));

    // a second stop for the now-unregistered schedule is an error, not an ack
    engine.dispatch_stop_task(info).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(posts_to(&log, "/agent/stopped-output").len(), 1);
    engine.shutdown();
}

#[tokio::test]
async fn rate_schedule_runs_repeatedly() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (addr, log) = spawn_control_plane().await;
    let (engine, _) = engine_against(addr, tmp.path());

    let mut info = shell_task("t-rate", "echo beat", "30");
    info.cron_at = "Rate(1s)".into();
    info.repeat = RepeatType::Rate;
    // rate tasks are periodic: the script file is reused across fires
    engine.dispatch_run_task(info.clone()).await;

    tokio::time::sleep(Duration::from_millis(2_600)).await;
    engine.dispatch_stop_task(info).await;

    let finishes = posts_to(&log, "/agent/finish-output");
    assert!(finishes.len() >= 2, "rate task fired {} times", finishes.len());
    assert!(finishes.iter().all(|r| r.body == "beat\n"));
    engine.shutdown();
}
