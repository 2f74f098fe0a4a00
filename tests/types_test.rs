use std::path::Path;

use feature_golem::error::FgError;
use feature_golem::types::{
    parse_feature_status, Feature, FeatureStatus, ProjectScope, RunMode, RunResult,
};

#[test]
fn status_display_matches_serde() {
    for status in [
        FeatureStatus::Backlog,
        FeatureStatus::InProgress,
        FeatureStatus::WaitingApproval,
        FeatureStatus::Verified,
        FeatureStatus::Completed,
    ] {
        let yaml = serde_yaml_ng::to_string(&status).unwrap();
        assert_eq!(yaml.trim(), status.to_string());
        assert_eq!(parse_feature_status(&status.to_string()).unwrap(), status);
    }
}

#[test]
fn parse_status_accepts_dashes_and_case() {
    assert_eq!(
        parse_feature_status("In-Progress").unwrap(),
        FeatureStatus::InProgress
    );
    assert_eq!(
        parse_feature_status(" WAITING_APPROVAL ").unwrap(),
        FeatureStatus::WaitingApproval
    );
    assert!(parse_feature_status("done").is_err());
}

#[test]
fn only_verified_and_completed_satisfy_dependents() {
    assert!(FeatureStatus::Verified.satisfies_dependents());
    assert!(FeatureStatus::Completed.satisfies_dependents());
    assert!(!FeatureStatus::WaitingApproval.satisfies_dependents());
    assert!(!FeatureStatus::InProgress.satisfies_dependents());
    assert!(!FeatureStatus::Backlog.satisfies_dependents());
}

#[test]
fn manual_start_allowed_from_backlog_and_in_progress() {
    assert!(FeatureStatus::Backlog.accepts_manual_start());
    assert!(FeatureStatus::InProgress.accepts_manual_start());
    assert!(!FeatureStatus::WaitingApproval.accepts_manual_start());
    assert!(!FeatureStatus::Verified.accepts_manual_start());
    assert!(!FeatureStatus::Completed.accepts_manual_start());
}

#[test]
fn success_status_depends_on_skip_tests() {
    assert_eq!(FeatureStatus::on_success(false), FeatureStatus::Verified);
    assert_eq!(FeatureStatus::on_success(true), FeatureStatus::WaitingApproval);
}

#[test]
fn title_is_first_non_empty_line() {
    let feature = Feature {
        id: "FG-001".to_string(),
        description: "\n\n  Add search  \nwith filters".to_string(),
        ..Default::default()
    };
    assert_eq!(feature.title(), "Add search");
}

#[test]
fn title_falls_back_to_id() {
    let feature = Feature {
        id: "FG-001".to_string(),
        ..Default::default()
    };
    assert_eq!(feature.title(), "FG-001");
}

#[test]
fn run_mode_labels() {
    assert_eq!(RunMode::Fresh.label(), "run");
    assert_eq!(RunMode::Resume.label(), "resume");
    assert_eq!(
        RunMode::FollowUp {
            note: "x".to_string()
        }
        .label(),
        "follow-up"
    );
    assert!(RunMode::Fresh.is_fresh());
    assert!(!RunMode::Resume.is_fresh());
}

#[test]
fn run_result_json_message_is_optional() {
    let result: RunResult = serde_json::from_str(r#"{"passes": true}"#).unwrap();
    assert_eq!(result, RunResult::passed(""));
}

#[test]
fn scope_paths() {
    let scope = ProjectScope::new(Path::new("/work/app"));
    assert_eq!(scope.root(), Path::new("/work/app"));
    assert_eq!(
        scope.features_path(),
        Path::new("/work/app/.feature-golem/features.yaml")
    );
    assert_eq!(
        scope.context_path("FG-001"),
        Path::new("/work/app/.feature-golem/context/FG-001.md")
    );
    assert_eq!(
        scope.result_path("FG-001"),
        Path::new("/work/app/.feature-golem/results/FG-001.json")
    );
    assert_eq!(
        scope.events_path(),
        Path::new("/work/app/.feature-golem/events.ndjson")
    );
}

#[test]
fn scope_with_absolute_features_path_keeps_it() {
    let scope = ProjectScope::with_features_path(Path::new("/work/app"), Path::new("/shared/f.yaml"));
    assert_eq!(scope.features_path(), Path::new("/shared/f.yaml"));
}

#[test]
fn error_categories() {
    assert!(FgError::AlreadyRunning("A".to_string()).is_rejection());
    assert!(FgError::NotFound("A".to_string()).is_rejection());
    assert!(FgError::InvalidTransition {
        id: "A".to_string(),
        from: FeatureStatus::Verified,
        action: "run",
    }
    .is_rejection());
    assert!(!FgError::Storage("disk".to_string()).is_rejection());
    assert!(FgError::ExecutorFailure("boom".to_string()).is_executor_failure());
}

#[test]
fn invalid_transition_message_names_action_and_status() {
    let err = FgError::InvalidTransition {
        id: "FG-003".to_string(),
        from: FeatureStatus::WaitingApproval,
        action: "commit",
    };
    assert_eq!(err.to_string(), "Cannot commit FG-003 while it is waiting_approval");
    let as_string: String = err.into();
    assert!(as_string.starts_with("Cannot commit"));
}
