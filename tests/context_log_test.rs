use feature_golem::context_log;

#[test]
fn read_missing_file_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(context_log::read(&dir.path().join("FG-001.md")).unwrap(), "");
}

#[test]
fn append_creates_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("context").join("nested").join("FG-001.md");

    context_log::append(&path, "hello").unwrap();

    assert_eq!(context_log::read(&path).unwrap(), "hello\n");
}

#[test]
fn append_never_truncates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("FG-001.md");

    context_log::append(&path, "one\n").unwrap();
    context_log::append(&path, "two").unwrap();
    context_log::append(&path, "three\n").unwrap();

    assert_eq!(context_log::read(&path).unwrap(), "one\ntwo\nthree\n");
}

#[test]
fn retry_marker_names_attempt_and_budget() {
    let marker = context_log::retry_marker(2, 3);
    assert!(marker.starts_with("\n## Retry 2/3 ("));
    assert!(marker.contains("Continue from here."));
}

#[test]
fn follow_up_entry_contains_trimmed_note() {
    let entry = context_log::follow_up_entry("Use the staging DB\n\n");
    assert!(entry.starts_with("\n## Follow-up ("));
    assert!(entry.ends_with("\n\nUse the staging DB\n"));
}
