use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;

use feature_golem::agent::{
    install_signal_handlers, is_shutdown_requested, kill_all_children, CliAgentExecutor,
};
use feature_golem::config::{self, FeatureGolemConfig, CONFIG_FILE};
use feature_golem::coordinator::{spawn_coordinator, CoordinatorHandle};
use feature_golem::dependency::{blocking_dependencies, find_dependency_cycles};
use feature_golem::events::{spawn_event_writer, LifecycleNotifier};
use feature_golem::feature_list::{self, NewFeature};
use feature_golem::lock;
use feature_golem::log::parse_log_level;
use feature_golem::scheduler::{Scheduler, SchedulerSettings};
use feature_golem::types::{parse_feature_status, ProjectScope, RunOutcome, RUNTIME_DIR};
use feature_golem::{log_info, log_warn};

/// How often the foreground commands check the shutdown flag.
const SHUTDOWN_POLL_MS: u64 = 200;

/// Runtime files that never belong in version control.
const GITIGNORE_ENTRIES: [&str; 5] = [
    ".feature-golem/results/",
    ".feature-golem/events.ndjson",
    ".feature-golem/feature-golem.lock",
    ".feature-golem/feature-golem.pid",
    ".feature-golem/features.yaml.lock",
];

type CliScheduler = Scheduler<CoordinatorHandle, CliAgentExecutor>;

#[derive(Parser)]
#[command(
    name = "feature-golem",
    about = "Schedule backlog features onto AI coding agents"
)]
struct Cli {
    /// Project root directory (defaults to current directory)
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to config file (defaults to {root}/feature-golem.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the feature list, config and runtime directory
    Init {
        /// Prefix for feature ids (e.g., FG)
        #[arg(long, default_value = "FG")]
        prefix: String,
    },
    /// Add a feature to the backlog
    Add {
        /// What to build. The first line becomes the title.
        description: String,
        #[arg(long, default_value = "")]
        category: String,
        /// Acceptance step (repeatable)
        #[arg(long = "step", action = clap::ArgAction::Append)]
        steps: Vec<String>,
        /// Feature id this one depends on (repeatable)
        #[arg(long = "depends-on", action = clap::ArgAction::Append)]
        depends_on: Vec<String>,
        /// Succeed into waiting_approval instead of verified
        #[arg(long)]
        skip_tests: bool,
    },
    /// Show every feature with its status and blockers
    Status,
    /// Run the admission loop until interrupted
    Run {
        /// Override scheduler.max_concurrency
        #[arg(long)]
        max_concurrency: Option<u32>,
    },
    /// Start a fresh run of one feature and wait for it
    Start { feature_id: String },
    /// Resume one feature from its context log and wait for it
    Resume { feature_id: String },
    /// Send a note to one feature, resume it and wait for it
    FollowUp { feature_id: String, note: String },
    /// Commit the working tree for a verified feature
    Commit { feature_id: String },
    /// Set a feature's status by hand (e.g., to completed)
    SetStatus { feature_id: String, status: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => feature_golem::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let root = cli.root.as_path();
    let config_path = cli.config.as_deref();

    let result = match cli.command {
        Commands::Init { prefix } => handle_init(root, &prefix),
        Commands::Add {
            description,
            category,
            steps,
            depends_on,
            skip_tests,
        } => handle_add(
            root,
            config_path,
            NewFeature {
                category,
                description,
                steps,
                dependencies: depends_on,
                skip_tests,
            },
        ),
        Commands::Status => handle_status(root, config_path),
        Commands::Run { max_concurrency } => handle_run(root, config_path, max_concurrency).await,
        Commands::Start { feature_id } => {
            handle_manual(root, config_path, &feature_id, ManualOp::Start).await
        }
        Commands::Resume { feature_id } => {
            handle_manual(root, config_path, &feature_id, ManualOp::Resume).await
        }
        Commands::FollowUp { feature_id, note } => {
            handle_manual(root, config_path, &feature_id, ManualOp::FollowUp(note)).await
        }
        Commands::Commit { feature_id } => handle_commit(root, config_path, &feature_id).await,
        Commands::SetStatus { feature_id, status } => {
            handle_set_status(root, config_path, &feature_id, &status)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load(root: &Path, config_path: Option<&Path>) -> Result<(FeatureGolemConfig, ProjectScope), String> {
    let config = config::load_config_from(config_path, root)?;
    let scope = config.scope(root);
    Ok((config, scope))
}

fn handle_init(root: &Path, prefix: &str) -> Result<(), String> {
    if prefix.is_empty()
        || !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err("Prefix must contain only ASCII letters, digits and underscores".to_string());
    }

    feature_golem::git::is_git_repo(root)
        .map_err(|_| "Not a git repository. Run `git init` first.".to_string())?;

    let runtime_dir = root.join(RUNTIME_DIR);
    fs::create_dir_all(runtime_dir.join("context"))
        .map_err(|e| format!("Failed to create {}: {}", runtime_dir.display(), e))?;

    let scope = ProjectScope::new(root);
    if !scope.features_path().exists() {
        feature_list::init(scope.features_path())?;
    }

    let config_path = root.join(CONFIG_FILE);
    if !config_path.exists() {
        let contents = format!(
            r#"[project]
prefix = "{prefix}"
# features_path = ".feature-golem/features.yaml"

[scheduler]
max_concurrency = 3
tick_interval_ms = 5000
max_attempts = 3

[agent]
# cli = "claude"          # "claude" or "opencode"
# model = ""              # Model override (e.g., "opus", "sonnet")
timeout_minutes = 60
"#,
            prefix = prefix
        );
        fs::write(&config_path, contents)
            .map_err(|e| format!("Failed to write {}: {}", config_path.display(), e))?;
    }

    update_gitignore(root)?;

    println!("Initialized feature-golem in {}", root.display());
    println!("  Created: {}/, {}", RUNTIME_DIR, CONFIG_FILE);
    Ok(())
}

fn update_gitignore(root: &Path) -> Result<(), String> {
    let gitignore_path = root.join(".gitignore");
    let mut contents = if gitignore_path.exists() {
        fs::read_to_string(&gitignore_path)
            .map_err(|e| format!("Failed to read .gitignore: {}", e))?
    } else {
        String::new()
    };

    let missing: Vec<&str> = GITIGNORE_ENTRIES
        .iter()
        .copied()
        .filter(|entry| !contents.lines().any(|line| line.trim() == *entry))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    for entry in missing {
        contents.push_str(entry);
        contents.push('\n');
    }
    fs::write(&gitignore_path, contents).map_err(|e| format!("Failed to write .gitignore: {}", e))
}

fn handle_add(root: &Path, config_path: Option<&Path>, new: NewFeature) -> Result<(), String> {
    if new.description.trim().is_empty() {
        return Err("Description must not be empty".to_string());
    }
    let (config, scope) = load(root, config_path)?;
    let feature = feature_list::update(scope.features_path(), |file| {
        feature_list::add_feature(file, new, &config.project.prefix)
    })?;

    let deps = if feature.dependencies.is_empty() {
        String::new()
    } else {
        format!(" (depends on {})", feature.dependencies.join(", "))
    };
    println!("Added {} - {}{}", feature.id, feature.title(), deps);
    Ok(())
}

fn handle_status(root: &Path, config_path: Option<&Path>) -> Result<(), String> {
    let (_, scope) = load(root, config_path)?;
    let file = feature_list::load(scope.features_path())?;

    if file.features.is_empty() {
        println!("No features.");
        return Ok(());
    }

    println!("{:<10} {:<18} {:<20} TITLE", "ID", "STATUS", "BLOCKED BY");
    println!("{}", "-".repeat(80));
    for feature in &file.features {
        let blocked = blocking_dependencies(feature, &file.features);
        let blocked_str = if blocked.is_empty() {
            "-".to_string()
        } else {
            blocked.join(",")
        };
        println!(
            "{:<10} {:<18} {:<20} {}",
            feature.id,
            feature.status.to_string(),
            blocked_str,
            truncate_title(feature.title(), 40)
        );
    }

    for cycle in find_dependency_cycles(&file.features) {
        println!("\nWarning: dependency cycle {}", cycle.join(" -> "));
    }
    println!("\n{} feature(s) total", file.features.len());
    Ok(())
}

fn build_scheduler(config: &FeatureGolemConfig) -> Result<(CliScheduler, JoinHandle<()>), String> {
    let executor = CliAgentExecutor::from_config(&config.agent);
    log_info!("[pre] Verifying {}...", executor.tool.display_name());
    executor.verify_cli_available()?;

    let (coordinator, coordinator_task) = spawn_coordinator();
    let scheduler = Scheduler::new(
        coordinator,
        executor,
        LifecycleNotifier::new(),
        SchedulerSettings::from_config(&config.scheduler),
    );
    Ok((scheduler, coordinator_task))
}

async fn wait_for_shutdown() {
    while !is_shutdown_requested() {
        tokio::time::sleep(Duration::from_millis(SHUTDOWN_POLL_MS)).await;
    }
}

async fn handle_run(
    root: &Path,
    config_path: Option<&Path>,
    max_concurrency: Option<u32>,
) -> Result<(), String> {
    install_signal_handlers()?;
    let (config, scope) = load(root, config_path)?;

    log_info!("[pre] Acquiring lock...");
    let _lock = lock::try_acquire(&scope.runtime_dir(), "run")?;

    let max_concurrency = max_concurrency.unwrap_or(config.scheduler.max_concurrency);
    if max_concurrency < 1 {
        return Err("--max-concurrency must be at least 1".to_string());
    }

    let (scheduler, _coordinator_task) = build_scheduler(&config)?;
    let event_writer = spawn_event_writer(scheduler.notifier(), scope.events_path());

    log_info!("[config] Prefix: {}", config.project.prefix);
    log_info!(
        "[config] Scheduler: max_concurrency={}, tick={}ms, max_attempts={}",
        max_concurrency,
        config.scheduler.tick_interval_ms,
        config.scheduler.max_attempts
    );
    log_info!(
        "[config] Agent: {} (timeout={}min)",
        config.agent.cli.display_name(),
        config.agent.timeout_minutes
    );

    scheduler.start_loop(&scope, max_concurrency as usize)?;
    wait_for_shutdown().await;

    log_info!("[loop] Shutdown requested, stopping...");
    let active = scheduler.status().active_ids;
    scheduler.stop_loop();
    tokio::task::spawn_blocking(kill_all_children)
        .await
        .map_err(|e| format!("Failed to stop agents: {}", e))?;

    if !active.is_empty() {
        let ids: Vec<String> = active.into_iter().collect();
        println!("Stopped: {} (left in_progress; use `resume` to continue)", ids.join(", "));
    }
    // Let cancelled runs publish their final events before the writer goes.
    tokio::time::sleep(Duration::from_millis(SHUTDOWN_POLL_MS)).await;
    event_writer.abort();
    Ok(())
}

enum ManualOp {
    Start,
    Resume,
    FollowUp(String),
}

impl ManualOp {
    fn command(&self) -> &'static str {
        match self {
            ManualOp::Start => "start",
            ManualOp::Resume => "resume",
            ManualOp::FollowUp(_) => "follow-up",
        }
    }
}

async fn handle_manual(
    root: &Path,
    config_path: Option<&Path>,
    feature_id: &str,
    op: ManualOp,
) -> Result<(), String> {
    install_signal_handlers()?;
    let (config, scope) = load(root, config_path)?;
    let _lock = lock::try_acquire(&scope.runtime_dir(), op.command())?;

    let (scheduler, _coordinator_task) = build_scheduler(&config)?;
    let event_writer = spawn_event_writer(scheduler.notifier(), scope.events_path());

    let run = match op {
        ManualOp::Start => scheduler.run_one(&scope, feature_id).await?,
        ManualOp::Resume => scheduler.resume_one(&scope, feature_id).await?,
        ManualOp::FollowUp(note) => scheduler.follow_up(&scope, feature_id, &note).await?,
    };

    let outcome = wait_for_run(&scheduler, feature_id, run).await?;
    event_writer.abort();

    match outcome {
        RunOutcome::Passed(result) => {
            println!("{} passed: {}", feature_id, result.message);
            Ok(())
        }
        RunOutcome::NotPassed(result) => Err(format!("{} did not pass: {}", feature_id, result.message)),
        RunOutcome::Cancelled => Err(format!("{} stopped", feature_id)),
        RunOutcome::Failed(e) => Err(format!("{} failed: {}", feature_id, e)),
    }
}

/// Await a manual run, stopping it if the process is asked to shut down.
async fn wait_for_run(
    scheduler: &CliScheduler,
    feature_id: &str,
    mut run: JoinHandle<RunOutcome>,
) -> Result<RunOutcome, String> {
    tokio::select! {
        joined = &mut run => {
            return joined.map_err(|e| format!("Run task failed: {}", e));
        }
        _ = wait_for_shutdown() => {}
    }

    log_warn!("[{}] Shutdown requested, stopping...", feature_id);
    scheduler.stop_one(feature_id);
    let outcome = run.await.map_err(|e| format!("Run task failed: {}", e));
    tokio::task::spawn_blocking(kill_all_children)
        .await
        .map_err(|e| format!("Failed to stop agents: {}", e))?;
    outcome
}

async fn handle_commit(root: &Path, config_path: Option<&Path>, feature_id: &str) -> Result<(), String> {
    let (config, scope) = load(root, config_path)?;
    let _lock = lock::try_acquire(&scope.runtime_dir(), "commit")?;

    let (coordinator, _coordinator_task) = spawn_coordinator();
    let scheduler = Scheduler::new(
        coordinator,
        CliAgentExecutor::from_config(&config.agent),
        LifecycleNotifier::new(),
        SchedulerSettings::from_config(&config.scheduler),
    );
    let sha = scheduler.commit_one(&scope, feature_id).await?;
    println!("Committed {} as {}", feature_id, sha);
    Ok(())
}

fn handle_set_status(
    root: &Path,
    config_path: Option<&Path>,
    feature_id: &str,
    status: &str,
) -> Result<(), String> {
    let status = parse_feature_status(status)?;
    let (_, scope) = load(root, config_path)?;
    feature_list::update(scope.features_path(), |file| {
        feature_list::set_status(file, feature_id, status)
    })?;
    println!("{} -> {}", feature_id, status);
    Ok(())
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let truncated: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}
