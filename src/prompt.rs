use std::path::Path;

use crate::types::Feature;

/// Prompt for a fresh run: the feature payload plus the result-file contract.
pub fn build_run_prompt(feature: &Feature, result_path: &Path) -> String {
    [
        build_preamble(feature),
        build_feature_section(feature),
        build_output_suffix(feature, result_path),
    ]
    .join("\n\n")
}

/// Prompt for a resume: as a fresh run, with the accumulated context appended.
///
/// Follow-up notes reach the agent through the context, where they were
/// appended before the resume started.
pub fn build_resume_prompt(feature: &Feature, prior_context: &str, result_path: &Path) -> String {
    let mut sections = vec![build_preamble(feature), build_feature_section(feature)];

    let context = prior_context.trim();
    if !context.is_empty() {
        sections.push(format!(
            "## Previous Work\n\n\
            An earlier session worked on this feature and stopped before reporting success. \
            Its log follows. Continue from where it left off rather than starting over.\n\n{}",
            context
        ));
    }

    sections.push(build_output_suffix(feature, result_path));
    sections.join("\n\n")
}

fn build_preamble(feature: &Feature) -> String {
    format!(
        "# Feature {}\n\n\
        You are running autonomously. No human is available for questions; use your judgment.",
        feature.id
    )
}

fn build_feature_section(feature: &Feature) -> String {
    let mut section = String::from("## Feature\n\n");
    if !feature.category.is_empty() {
        section.push_str(&format!("**Category:** {}\n\n", feature.category));
    }
    section.push_str(feature.description.trim());

    if !feature.steps.is_empty() {
        section.push_str("\n\n### Steps\n\n");
        let steps: Vec<String> = feature
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {}", i + 1, step))
            .collect();
        section.push_str(&steps.join("\n"));
    }

    if feature.skip_tests {
        section.push_str("\n\nNo automated tests are required for this feature.");
    } else {
        section.push_str("\n\nThe feature passes only when its tests pass.");
    }

    section
}

fn build_output_suffix(feature: &Feature, result_path: &Path) -> String {
    format!(
        "## Reporting\n\n\
        When you stop, write a JSON file to `{}` with this shape:\n\n\
        ```json\n{{\"passes\": true, \"message\": \"one line summary\"}}\n```\n\n\
        Set `passes` to true only if {} is fully implemented{}. \
        If you stop for any other reason, set it to false and explain why in `message`.",
        result_path.display(),
        feature.id,
        if feature.skip_tests {
            ""
        } else {
            " and verified by tests"
        }
    )
}
