mod common;

use std::path::Path;

use feature_golem::prompt::{build_resume_prompt, build_run_prompt};
use feature_golem::types::FeatureStatus;

use common::make_feature;

#[test]
fn run_prompt_contains_feature_and_result_contract() {
    let mut feature = make_feature("FG-003", FeatureStatus::InProgress);
    feature.category = "api".to_string();
    feature.steps = vec!["Add route".to_string(), "Add handler".to_string()];

    let prompt = build_run_prompt(&feature, Path::new("/p/.feature-golem/results/FG-003.json"));

    assert!(prompt.starts_with("# Feature FG-003"));
    assert!(prompt.contains("**Category:** api"));
    assert!(prompt.contains("Test feature FG-003"));
    assert!(prompt.contains("1. Add route\n2. Add handler"));
    assert!(prompt.contains("/p/.feature-golem/results/FG-003.json"));
    assert!(prompt.contains("\"passes\""));
    assert!(!prompt.contains("## Previous Work"));
}

#[test]
fn skip_tests_changes_the_bar() {
    let mut feature = make_feature("FG-003", FeatureStatus::InProgress);
    let with_tests = build_run_prompt(&feature, Path::new("r.json"));
    feature.skip_tests = true;
    let without_tests = build_run_prompt(&feature, Path::new("r.json"));

    assert!(with_tests.contains("passes only when its tests pass"));
    assert!(without_tests.contains("No automated tests are required"));
}

#[test]
fn resume_prompt_includes_prior_context() {
    let feature = make_feature("FG-003", FeatureStatus::InProgress);
    let prompt = build_resume_prompt(&feature, "## Attempt 1 output\n\nwrote the handler", Path::new("r.json"));

    assert!(prompt.contains("## Previous Work"));
    assert!(prompt.contains("wrote the handler"));
    let context_at = prompt.find("wrote the handler").unwrap();
    let reporting_at = prompt.find("## Reporting").unwrap();
    assert!(context_at < reporting_at);
}

#[test]
fn resume_prompt_with_empty_context_matches_run_prompt() {
    let feature = make_feature("FG-003", FeatureStatus::InProgress);
    assert_eq!(
        build_resume_prompt(&feature, "  \n", Path::new("r.json")),
        build_run_prompt(&feature, Path::new("r.json"))
    );
}
