#![allow(dead_code)]

use std::fs;
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;

use feature_golem::feature_list;
use feature_golem::types::{Feature, FeatureFile, FeatureStatus, ProjectScope, FEATURES_SCHEMA_VERSION};

/// Creates a `Feature` with minimal defaults.
///
/// The description is `"Test feature {id}"`, so the title matches it.
/// Timestamps are fixed at `"2026-02-10T00:00:00+00:00"`.
pub fn make_feature(id: &str, status: FeatureStatus) -> Feature {
    Feature {
        id: id.to_string(),
        description: format!("Test feature {}", id),
        status,
        created: "2026-02-10T00:00:00+00:00".to_string(),
        updated: "2026-02-10T00:00:00+00:00".to_string(),
        ..Default::default()
    }
}

/// A backlog feature depending on `deps`.
pub fn make_dependent(id: &str, deps: &[&str]) -> Feature {
    let mut feature = make_feature(id, FeatureStatus::Backlog);
    feature.dependencies = deps.iter().map(|d| d.to_string()).collect();
    feature
}

pub fn make_file(features: Vec<Feature>) -> FeatureFile {
    FeatureFile {
        schema_version: FEATURES_SCHEMA_VERSION,
        next_feature_id: 0,
        features,
    }
}

/// Scope rooted at a throwaway path, for stores that ignore the filesystem.
pub fn memory_scope() -> ProjectScope {
    ProjectScope::new(std::path::Path::new("/nonexistent/feature-golem-test"))
}

/// Writes `features` to the default feature list location under `dir`.
pub fn write_features(dir: &TempDir, features: Vec<Feature>) -> ProjectScope {
    let scope = ProjectScope::new(dir.path());
    feature_list::save(scope.features_path(), &make_file(features)).expect("Failed to save features");
    scope
}

/// Creates a temporary directory initialized as a git repository.
///
/// The repo has user config (`test@test.com` / `Test`) and an initial commit
/// containing `README.md`.
pub fn setup_git_repo() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let git = |args: &[&str]| {
        Command::new("git")
            .args(args)
            .current_dir(dir.path())
            .output()
            .expect("Failed to run git");
    };

    git(&["init"]);
    git(&["config", "user.email", "test@test.com"]);
    git(&["config", "user.name", "Test"]);
    fs::write(dir.path().join("README.md"), "# Test\n").expect("Failed to write README");
    git(&["add", "README.md"]);
    git(&["commit", "-m", "Initial commit"]);

    dir
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
