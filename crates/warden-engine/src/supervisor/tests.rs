use super::*;
use std::sync::Arc;
use std::time::Instant;

fn sh(script: &str) -> (String, Vec<String>) {
    ("sh".to_string(), vec!["-c".to_string(), script.to_string()])
}

async fn run_script(
    supervisor: &ProcessSupervisor,
    script: &str,
    timeout_secs: u64,
) -> (RunOutcome, SharedBuffer, SharedBuffer) {
    let stdout = SharedBuffer::new();
    let stderr = SharedBuffer::new();
    let (program, args) = sh(script);
    let outcome = supervisor
        .sync_run(
            Path::new(""),
            &program,
            &args,
            &stdout,
            &stderr,
            &HashMap::new(),
            timeout_secs,
        )
        .await;
    (outcome, stdout, stderr)
}

#[tokio::test]
async fn captures_output_and_exit_code() {
    let supervisor = ProcessSupervisor::new();
    let (outcome, stdout, stderr) =
        run_script(&supervisor, "printf hello; printf warn 1>&2", 30).await;

    assert_eq!(outcome.kind, ExitKind::Success);
    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.error.is_none());
    assert_eq!(stdout.drain(), b"hello");
    assert_eq!(stderr.drain(), b"warn");
}

#[tokio::test]
async fn exit_code_is_passed_through() {
    let supervisor = ProcessSupervisor::new();
    let (outcome, _, _) = run_script(&supervisor, "exit 7", 30).await;

    assert_eq!(outcome.kind, ExitKind::Fail);
    assert_eq!(outcome.exit_code, 7);
    assert!(outcome.error.is_none());
}

#[tokio::test]
async fn deadline_kills_the_child() {
    let supervisor = ProcessSupervisor::new();
    let started = Instant::now();
    let (outcome, _, _) = run_script(&supervisor, "sleep 5", 1).await;

    assert_eq!(outcome.kind, ExitKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn deadline_kills_descendants_too() {
    let supervisor = ProcessSupervisor::new();
    let started = Instant::now();
    // the inner sleep would hold the pipes open long after the parent died
    let (outcome, _, _) = run_script(&supervisor, "sleep 30 & wait", 1).await;

    assert_eq!(outcome.kind, ExitKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn cancel_interrupts_a_running_child() {
    let supervisor = Arc::new(ProcessSupervisor::new());
    let canceller = supervisor.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let (outcome, _, _) = run_script(&supervisor, "sleep 10", 30).await;

    assert_eq!(outcome.kind, ExitKind::Fail);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn reset_rearms_after_cancel() {
    let supervisor = ProcessSupervisor::new();
    supervisor.cancel();
    supervisor.reset();

    let (outcome, stdout, _) = run_script(&supervisor, "printf ok", 30).await;
    assert_eq!(outcome.kind, ExitKind::Success);
    assert_eq!(stdout.drain(), b"ok");
}

#[tokio::test]
async fn spawn_failure_is_reported() {
    let supervisor = ProcessSupervisor::new();
    let stdout = SharedBuffer::new();
    let stderr = SharedBuffer::new();
    let outcome = supervisor
        .sync_run(
            Path::new(""),
            "definitely-no-such-interpreter",
            &[],
            &stdout,
            &stderr,
            &HashMap::new(),
            5,
        )
        .await;

    assert_eq!(outcome.kind, ExitKind::Fail);
    let error = outcome.error.expect("spawn error");
    assert_eq!(error.kind(), std::io::ErrorKind::NotFound);
}

#[tokio::test]
async fn unknown_user_fails_before_spawn() {
    let supervisor = ProcessSupervisor::new();
    supervisor.set_username("no-such-user-zzz");
    let (outcome, stdout, _) = run_script(&supervisor, "printf leaked", 5).await;

    assert_eq!(outcome.kind, ExitKind::Fail);
    assert!(outcome.error.is_some());
    assert!(stdout.is_empty());
}

#[tokio::test]
async fn home_dir_is_injected() {
    let supervisor = ProcessSupervisor::new();
    supervisor.set_home_dir(Path::new("/tmp/fake-home"));
    let (outcome, stdout, _) = run_script(&supervisor, "printf \"$HOME\"", 30).await;

    assert_eq!(outcome.kind, ExitKind::Success);
    assert_eq!(stdout.drain(), b"/tmp/fake-home");
}

#[tokio::test]
async fn sync_run_simple_reports_failures() {
    let supervisor = ProcessSupervisor::new();
    supervisor
        .sync_run_simple("true", &[], 5)
        .await
        .expect("true succeeds");

    let err = supervisor.sync_run_simple("false", &[], 5).await.unwrap_err();
    assert!(err.to_string().contains("exited with"));
}
