mod common;

use std::time::Duration;

use feature_golem::events::{
    append_event, read_events, spawn_event_writer, EventRecord, LifecycleEvent,
    LifecycleNotifier, ProgressSink,
};
use feature_golem::types::FeatureStatus;

use common::{make_feature, wait_until};

#[test]
fn publish_without_subscribers_does_not_fail() {
    let notifier = LifecycleNotifier::new();
    notifier.progress("FG-001", "nobody is listening");
    notifier.error("FG-001", "still fine");
}

#[test]
fn subscribers_receive_events_in_order() {
    let notifier = LifecycleNotifier::new();
    let mut rx = notifier.subscribe();
    let feature = make_feature("FG-001", FeatureStatus::InProgress);

    notifier.start(&feature);
    notifier.progress("FG-001", "working");
    notifier.complete("FG-001", true, "done");

    assert_eq!(
        rx.try_recv().unwrap(),
        LifecycleEvent::Start {
            feature_id: "FG-001".to_string(),
            feature,
        }
    );
    assert_eq!(
        rx.try_recv().unwrap(),
        LifecycleEvent::Progress {
            feature_id: "FG-001".to_string(),
            content: "working".to_string(),
        }
    );
    let last = rx.try_recv().unwrap();
    assert_eq!(last.feature_id(), "FG-001");
    assert!(matches!(last, LifecycleEvent::Complete { passes: true, .. }));
}

#[test]
fn sink_publishes_and_keeps_transcript() {
    let notifier = LifecycleNotifier::new();
    let mut rx = notifier.subscribe();
    let sink = ProgressSink::new(&notifier, "FG-002");

    sink.emit("line 1");
    sink.emit("line 2");

    assert_eq!(sink.feature_id(), "FG-002");
    assert_eq!(sink.take_transcript(), vec!["line 1", "line 2"]);
    assert!(sink.take_transcript().is_empty());
    assert!(matches!(
        rx.try_recv().unwrap(),
        LifecycleEvent::Progress { ref content, .. } if content == "line 1"
    ));
}

#[test]
fn event_serializes_with_type_tag() {
    let record = EventRecord::now(LifecycleEvent::Complete {
        feature_id: "FG-001".to_string(),
        passes: false,
        message: "tests fail".to_string(),
    });

    let line = record.to_ndjson_line().unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();

    assert_eq!(value["type"], "complete");
    assert_eq!(value["feature_id"], "FG-001");
    assert_eq!(value["passes"], false);
    assert!(value["ts"].is_string());
    assert!(!line.contains('\n'));
}

#[test]
fn append_and_read_events_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtime").join("events.ndjson");

    append_event(
        &path,
        &EventRecord::now(LifecycleEvent::Error {
            feature_id: "FG-001".to_string(),
            message: "stopped".to_string(),
        }),
    )
    .unwrap();
    append_event(
        &path,
        &EventRecord::now(LifecycleEvent::Progress {
            feature_id: "FG-002".to_string(),
            content: "hi".to_string(),
        }),
    )
    .unwrap();

    let records = read_events(&path).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].event.feature_id(), "FG-001");
    assert!(matches!(records[1].event, LifecycleEvent::Progress { .. }));
}

#[test]
fn read_events_rejects_malformed_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.ndjson");
    std::fs::write(&path, "{\"not\": \"an event\"}\n").unwrap();

    assert!(read_events(&path).is_err());
}

#[tokio::test]
async fn event_writer_appends_published_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.ndjson");
    let notifier = LifecycleNotifier::new();
    let writer = spawn_event_writer(&notifier, path.clone());

    notifier.progress("FG-001", "one");
    notifier.complete("FG-001", true, "two");

    let written = wait_until(Duration::from_secs(5), || {
        read_events(&path).map(|r| r.len() == 2).unwrap_or(false)
    })
    .await;
    assert!(written);

    drop(notifier);
    writer.await.unwrap();
}
