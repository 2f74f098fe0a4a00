use std::path::Path;
use std::process::Command;

/// Verify that `repo_dir` is inside a git work tree.
pub fn is_git_repo(repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["rev-parse", "--git-dir"], repo_dir)
        .map_err(|_| "Not a git repository (or git is not installed)".to_string())?;
    Ok(())
}

/// True if the work tree or index differs from HEAD, untracked files included.
pub fn has_changes(repo_dir: &Path) -> Result<bool, String> {
    let output = run_git_command(&["status", "--porcelain"], repo_dir)?;
    Ok(output.lines().any(|line| !line.trim().is_empty()))
}

/// Stage every change in the work tree, including deletions and new files.
pub fn stage_all(repo_dir: &Path) -> Result<(), String> {
    run_git_command(&["add", "--all"], repo_dir)?;
    Ok(())
}

/// Create a commit with `message` and return the new HEAD SHA.
pub fn commit(message: &str, repo_dir: &Path) -> Result<String, String> {
    run_git_command(&["commit", "-m", message], repo_dir)?;
    head_sha(repo_dir)
}

/// Full 40-character SHA of HEAD.
pub fn head_sha(repo_dir: &Path) -> Result<String, String> {
    let output = run_git_command(&["rev-parse", "HEAD"], repo_dir)?;
    Ok(output.trim().to_string())
}

/// `feat: <title> [<id>]`
pub fn build_commit_message(feature_id: &str, title: &str) -> String {
    format!("feat: {} [{}]", title.trim(), feature_id)
}

/// Stage everything and commit it under the feature's message.
///
/// Fails without committing if there is nothing to commit.
pub fn commit_feature(feature_id: &str, title: &str, repo_dir: &Path) -> Result<String, String> {
    is_git_repo(repo_dir)?;
    if !has_changes(repo_dir)? {
        return Err(format!("Nothing to commit for {}", feature_id));
    }
    stage_all(repo_dir)?;
    commit(&build_commit_message(feature_id, title), repo_dir)
}

/// Run a git command in `repo_dir` and return its stdout.
fn run_git_command(args: &[&str], repo_dir: &Path) -> Result<String, String> {
    let subcommand = args.first().copied().unwrap_or("");
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_dir)
        .output()
        .map_err(|e| format!("Failed to run git {}: {}", subcommand, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("git {} failed: {}", subcommand, stderr.trim()));
    }

    String::from_utf8(output.stdout).map_err(|e| format!("git output is not valid UTF-8: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_message_trims_title_and_tags_id() {
        assert_eq!(
            build_commit_message("FG-004", "  Add login form "),
            "feat: Add login form [FG-004]"
        );
    }
}
