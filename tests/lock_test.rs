use feature_golem::lock::{self, LockHolder};

#[test]
fn lock_records_holder_and_releases_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let runtime_dir = dir.path().join(".feature-golem");

    let guard = lock::try_acquire(&runtime_dir, "run").unwrap();

    assert_eq!(
        lock::read_holder(&runtime_dir),
        Some(LockHolder {
            pid: std::process::id() as i32,
            command: "run".to_string(),
        })
    );

    drop(guard);
    assert!(!runtime_dir.join("feature-golem.pid").exists());
    assert_eq!(lock::read_holder(&runtime_dir), None);
}

#[test]
fn lock_creates_directory_if_missing() {
    let dir = tempfile::tempdir().unwrap();
    let runtime_dir = dir.path().join("nested").join(".feature-golem");

    let _guard = lock::try_acquire(&runtime_dir, "commit").unwrap();
    assert!(runtime_dir.exists());
}

#[test]
fn second_acquire_names_the_holder() {
    let dir = tempfile::tempdir().unwrap();
    let runtime_dir = dir.path().join(".feature-golem");

    let _guard = lock::try_acquire(&runtime_dir, "run").unwrap();

    let err = lock::try_acquire(&runtime_dir, "start").unwrap_err();
    assert_eq!(
        err,
        format!("Another feature-golem run is running (PID {})", std::process::id())
    );
}

#[test]
fn lock_acquires_over_stale_holder_file() {
    let dir = tempfile::tempdir().unwrap();
    let runtime_dir = dir.path().join(".feature-golem");
    std::fs::create_dir_all(&runtime_dir).unwrap();
    std::fs::write(runtime_dir.join("feature-golem.pid"), "99999999\nrun\n").unwrap();
    std::fs::write(runtime_dir.join("feature-golem.lock"), "").unwrap();

    let _guard = lock::try_acquire(&runtime_dir, "resume").unwrap();

    let holder = lock::read_holder(&runtime_dir).unwrap();
    assert_eq!(holder.pid, std::process::id() as i32);
    assert_eq!(holder.command, "resume");
}

#[test]
fn lock_can_be_reacquired_after_release() {
    let dir = tempfile::tempdir().unwrap();
    let runtime_dir = dir.path().join(".feature-golem");

    drop(lock::try_acquire(&runtime_dir, "run").unwrap());
    assert!(lock::try_acquire(&runtime_dir, "run").is_ok());
}
