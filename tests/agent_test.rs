mod common;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use feature_golem::agent::{read_result_file, run_subprocess_agent, FeatureExecutor, MockExecutor};
use feature_golem::events::{LifecycleNotifier, ProgressSink};
use feature_golem::types::{FeatureStatus, RunResult};

use common::{make_feature, memory_scope};

fn shell(script: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("bash");
    cmd.arg("-c").arg(script);
    cmd
}

// --- read_result_file ---

#[tokio::test]
async fn read_result_file_missing_is_none() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(read_result_file(&dir.path().join("r.json")).await.unwrap(), None);
}

#[tokio::test]
async fn read_result_file_parses_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("r.json");
    std::fs::write(&path, r#"{"passes": false, "message": "3 tests failing"}"#).unwrap();

    assert_eq!(
        read_result_file(&path).await.unwrap(),
        Some(RunResult::not_passed("3 tests failing"))
    );
}

#[tokio::test]
async fn read_result_file_malformed_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("r.json");
    std::fs::write(&path, "passes: yes").unwrap();

    let err = read_result_file(&path).await.unwrap_err();
    assert!(err.contains("Failed to parse result JSON"));
}

// --- run_subprocess_agent ---

#[tokio::test]
async fn subprocess_result_file_is_read_and_removed() {
    let dir = tempfile::tempdir().unwrap();
    let result_path = dir.path().join("results").join("FG-001.json");
    let script = format!(
        "echo starting; echo '{{\"passes\": true, \"message\": \"built\"}}' > '{}'; echo finished",
        result_path.display()
    );
    let notifier = LifecycleNotifier::new();
    let sink = ProgressSink::new(&notifier, "FG-001");

    let result = run_subprocess_agent(
        shell(&script),
        &result_path,
        Duration::from_secs(30),
        &sink,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result, RunResult::passed("built"));
    assert!(!result_path.exists());
    assert_eq!(sink.take_transcript(), vec!["starting", "finished"]);
}

#[tokio::test]
async fn subprocess_without_result_file_is_not_passed() {
    let dir = tempfile::tempdir().unwrap();
    let result_path = dir.path().join("FG-001.json");
    let sink = ProgressSink::new(&LifecycleNotifier::new(), "FG-001");

    let result = run_subprocess_agent(
        shell("exit 3"),
        &result_path,
        Duration::from_secs(30),
        &sink,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(!result.passes);
    assert!(result.message.contains("exit code 3"), "got: {}", result.message);
}

#[tokio::test]
async fn subprocess_stale_result_file_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let result_path = dir.path().join("FG-001.json");
    std::fs::write(&result_path, r#"{"passes": true, "message": "stale"}"#).unwrap();
    let sink = ProgressSink::new(&LifecycleNotifier::new(), "FG-001");

    let result = run_subprocess_agent(
        shell("true"),
        &result_path,
        Duration::from_secs(30),
        &sink,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(!result.passes);
}

#[tokio::test]
async fn subprocess_timeout_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let sink = ProgressSink::new(&LifecycleNotifier::new(), "FG-001");

    let err = run_subprocess_agent(
        shell("sleep 30"),
        &dir.path().join("FG-001.json"),
        Duration::from_millis(200),
        &sink,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(err.contains("timed out"), "got: {}", err);
}

#[tokio::test]
async fn subprocess_cancellation_kills_agent() {
    let dir = tempfile::tempdir().unwrap();
    let sink = ProgressSink::new(&LifecycleNotifier::new(), "FG-001");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = run_subprocess_agent(
        shell("sleep 30"),
        &dir.path().join("FG-001.json"),
        Duration::from_secs(60),
        &sink,
        &cancel,
    )
    .await
    .unwrap_err();

    assert_eq!(err, "Cancelled");
    assert!(started.elapsed() < Duration::from_secs(20));
}

#[tokio::test]
async fn subprocess_spawn_failure_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let sink = ProgressSink::new(&LifecycleNotifier::new(), "FG-001");

    let err = run_subprocess_agent(
        tokio::process::Command::new("/nonexistent/agent-binary"),
        &dir.path().join("FG-001.json"),
        Duration::from_secs(5),
        &sink,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(err.contains("Failed to spawn agent"));
}

// --- MockExecutor ---

#[tokio::test]
async fn mock_scripted_results_then_fallback() {
    let executor = MockExecutor::with_fallback(Ok(RunResult::passed("fallback"))).scripted(
        "FG-001",
        vec![Ok(RunResult::not_passed("first")), Err("second".to_string())],
    );
    let feature = make_feature("FG-001", FeatureStatus::InProgress);
    let sink = ProgressSink::new(&LifecycleNotifier::new(), "FG-001");
    let cancel = CancellationToken::new();
    let scope = memory_scope();

    let first = executor.run(&feature, &scope, &sink, &cancel).await;
    let second = executor.resume(&feature, &scope, &sink, "ctx", &cancel).await;
    let third = executor.resume(&feature, &scope, &sink, "ctx", &cancel).await;

    assert_eq!(first, Ok(RunResult::not_passed("first")));
    assert_eq!(second, Err("second".to_string()));
    assert_eq!(third, Ok(RunResult::passed("fallback")));

    let calls = executor.calls_for("FG-001");
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].prior_context, None);
    assert_eq!(calls[1].prior_context.as_deref(), Some("ctx"));
}

#[tokio::test]
async fn mock_clones_share_call_log() {
    let executor = MockExecutor::new();
    let clone = executor.clone();
    let feature = make_feature("FG-001", FeatureStatus::InProgress);
    let sink = ProgressSink::new(&LifecycleNotifier::new(), "FG-001");

    clone
        .run(&feature, &memory_scope(), &sink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(executor.call_count(), 1);
}
