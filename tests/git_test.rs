mod common;

use std::fs;
use std::process::Command;

use feature_golem::git;

use common::setup_git_repo;

fn last_commit_subject(dir: &std::path::Path) -> String {
    let output = Command::new("git")
        .args(["log", "-1", "--format=%s"])
        .current_dir(dir)
        .output()
        .unwrap();
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

#[test]
fn is_git_repo_detects_repo() {
    let repo = setup_git_repo();
    assert!(git::is_git_repo(repo.path()).is_ok());

    let plain = tempfile::tempdir().unwrap();
    assert!(git::is_git_repo(plain.path()).is_err());
}

#[test]
fn has_changes_sees_untracked_and_modified_files() {
    let repo = setup_git_repo();
    assert!(!git::has_changes(repo.path()).unwrap());

    fs::write(repo.path().join("new.txt"), "new").unwrap();
    assert!(git::has_changes(repo.path()).unwrap());

    git::stage_all(repo.path()).unwrap();
    git::commit("add new", repo.path()).unwrap();
    assert!(!git::has_changes(repo.path()).unwrap());

    fs::write(repo.path().join("README.md"), "# Changed\n").unwrap();
    assert!(git::has_changes(repo.path()).unwrap());
}

#[test]
fn commit_returns_head_sha() {
    let repo = setup_git_repo();
    fs::write(repo.path().join("a.txt"), "a").unwrap();
    git::stage_all(repo.path()).unwrap();

    let sha = git::commit("add a", repo.path()).unwrap();

    assert_eq!(sha, git::head_sha(repo.path()).unwrap());
    assert_eq!(sha.len(), 40);
}

#[test]
fn commit_feature_uses_feature_message() {
    let repo = setup_git_repo();
    fs::write(repo.path().join("search.rs"), "// search").unwrap();
    fs::remove_file(repo.path().join("README.md")).unwrap();

    git::commit_feature("FG-012", "Add search", repo.path()).unwrap();

    assert_eq!(last_commit_subject(repo.path()), "feat: Add search [FG-012]");
    assert!(!git::has_changes(repo.path()).unwrap());
}

#[test]
fn commit_feature_with_nothing_to_commit_fails() {
    let repo = setup_git_repo();
    let before = git::head_sha(repo.path()).unwrap();

    let err = git::commit_feature("FG-012", "Add search", repo.path()).unwrap_err();

    assert!(err.contains("Nothing to commit for FG-012"));
    assert_eq!(git::head_sha(repo.path()).unwrap(), before);
}

#[test]
fn commit_feature_outside_repo_fails() {
    let plain = tempfile::tempdir().unwrap();
    assert!(git::commit_feature("FG-001", "x", plain.path()).is_err());
}
