use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Per-project directory holding the feature list, context logs, results and locks.
pub const RUNTIME_DIR: &str = ".feature-golem";

/// Default feature list location, relative to the project root.
pub const DEFAULT_FEATURES_PATH: &str = ".feature-golem/features.yaml";

pub const FEATURES_SCHEMA_VERSION: u32 = 1;

// --- Enums ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    #[default]
    Backlog,
    InProgress,
    WaitingApproval,
    Verified,
    Completed,
}

impl FeatureStatus {
    /// Whether a dependency in this status unblocks its dependents.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, FeatureStatus::Verified | FeatureStatus::Completed)
    }

    /// Whether an explicit run, resume or follow-up may start from this status.
    ///
    /// `InProgress` is accepted because a feature without a live handle in
    /// that status is either a failed resume or a stopped run awaiting a
    /// manual restart. The registry check rejects ids that are actually running.
    pub fn accepts_manual_start(&self) -> bool {
        matches!(self, FeatureStatus::Backlog | FeatureStatus::InProgress)
    }

    /// Terminal status reached when a run passes.
    pub fn on_success(skip_tests: bool) -> FeatureStatus {
        if skip_tests {
            FeatureStatus::WaitingApproval
        } else {
            FeatureStatus::Verified
        }
    }
}

impl std::fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureStatus::Backlog => write!(f, "backlog"),
            FeatureStatus::InProgress => write!(f, "in_progress"),
            FeatureStatus::WaitingApproval => write!(f, "waiting_approval"),
            FeatureStatus::Verified => write!(f, "verified"),
            FeatureStatus::Completed => write!(f, "completed"),
        }
    }
}

pub fn parse_feature_status(s: &str) -> Result<FeatureStatus, String> {
    match s.trim().to_lowercase().replace('-', "_").as_str() {
        "backlog" => Ok(FeatureStatus::Backlog),
        "in_progress" => Ok(FeatureStatus::InProgress),
        "waiting_approval" => Ok(FeatureStatus::WaitingApproval),
        "verified" => Ok(FeatureStatus::Verified),
        "completed" => Ok(FeatureStatus::Completed),
        _ => Err(format!(
            "Invalid status '{}': expected backlog, in_progress, waiting_approval, verified, or completed",
            s
        )),
    }
}

/// How a top-level invocation starts the executor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Start from scratch with no prior context.
    Fresh,
    /// Continue from the feature's accumulated context log.
    Resume,
    /// Append a note to the context log, then resume.
    FollowUp { note: String },
}

impl RunMode {
    pub fn is_fresh(&self) -> bool {
        matches!(self, RunMode::Fresh)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunMode::Fresh => "run",
            RunMode::Resume => "resume",
            RunMode::FollowUp { .. } => "follow-up",
        }
    }
}

/// How a dispatched run ended, as seen by whoever awaits its task.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Passed(RunResult),
    NotPassed(RunResult),
    Cancelled,
    Failed(String),
}

// --- Structs ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Feature {
    pub id: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
    pub status: FeatureStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub skip_tests: bool,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub updated: String,
}

impl Feature {
    /// First non-empty line of the description, used for titles and commit messages.
    pub fn title(&self) -> &str {
        self.description
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or(self.id.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct FeatureFile {
    pub schema_version: u32,
    #[serde(default)]
    pub next_feature_id: u32,
    #[serde(default)]
    pub features: Vec<Feature>,
}

/// The only signal an executor returns to the scheduler.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct RunResult {
    pub passes: bool,
    #[serde(default)]
    pub message: String,
}

impl RunResult {
    pub fn passed(message: &str) -> Self {
        Self {
            passes: true,
            message: message.to_string(),
        }
    }

    pub fn not_passed(message: &str) -> Self {
        Self {
            passes: false,
            message: message.to_string(),
        }
    }
}

/// Snapshot answer to `Scheduler::status`.
#[derive(Serialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct SchedulerStatus {
    pub running: bool,
    pub active_ids: BTreeSet<String>,
    pub count: usize,
}

/// The project a scheduler operates on: its root and where its feature list lives.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProjectScope {
    root: PathBuf,
    features_path: PathBuf,
}

impl ProjectScope {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            features_path: root.join(DEFAULT_FEATURES_PATH),
        }
    }

    /// Scope whose feature list sits at `features_path` relative to `root`
    /// (absolute paths are kept as-is).
    pub fn with_features_path(root: &Path, features_path: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            features_path: root.join(features_path),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn features_path(&self) -> &Path {
        &self.features_path
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join(RUNTIME_DIR)
    }

    pub fn context_dir(&self) -> PathBuf {
        self.runtime_dir().join("context")
    }

    pub fn context_path(&self, feature_id: &str) -> PathBuf {
        self.context_dir().join(format!("{}.md", feature_id))
    }

    pub fn result_path(&self, feature_id: &str) -> PathBuf {
        self.runtime_dir()
            .join("results")
            .join(format!("{}.json", feature_id))
    }

    pub fn events_path(&self) -> PathBuf {
        self.runtime_dir().join("events.ndjson")
    }
}
