use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::ChildStdout;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, CliTool};
use crate::events::ProgressSink;
use crate::prompt;
use crate::types::{Feature, ProjectScope, RunResult};
use crate::{log_debug, log_warn};

/// Maximum time to wait for a process group to exit after SIGTERM before SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

const KILL_POLL_INTERVAL_MS: u64 = 100;

/// How long to keep reading buffered stdout after the agent has exited.
const STDOUT_DRAIN_TIMEOUT_MS: u64 = 1000;

// --- Shutdown flag ---

fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// True once SIGTERM or SIGINT has been received.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Install SIGTERM and SIGINT handlers that set the shutdown flag.
///
/// Safe to call more than once.
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

// --- Child process groups ---

/// Process groups of agents still running, so shutdown can reap them all.
fn child_groups() -> &'static Mutex<HashSet<Pid>> {
    static GROUPS: OnceLock<Mutex<HashSet<Pid>>> = OnceLock::new();
    GROUPS.get_or_init(|| Mutex::new(HashSet::new()))
}

fn register_child(pgid: Pid) {
    if let Ok(mut groups) = child_groups().lock() {
        groups.insert(pgid);
    }
}

fn unregister_child(pgid: Pid) {
    if let Ok(mut groups) = child_groups().lock() {
        groups.remove(&pgid);
    }
}

/// SIGTERM every group, wait out the grace period, then SIGKILL survivors.
///
/// Blocks the calling thread while polling.
fn terminate_groups(pgids: &[Pid]) {
    for &pgid in pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while std::time::Instant::now() < deadline {
        // signal 0 probes whether the group still exists
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            return;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

/// Kill every registered agent process group. Used on process shutdown.
pub fn kill_all_children() {
    let pgids: Vec<Pid> = match child_groups().lock() {
        Ok(mut groups) => groups.drain().collect(),
        Err(_) => return,
    };
    if !pgids.is_empty() {
        log_debug!("[agent] Terminating {} agent process group(s)", pgids.len());
        terminate_groups(&pgids);
    }
}

/// Kill one process group on the blocking pool so async workers keep running.
async fn kill_process_group(pgid: Pid) {
    tokio::task::spawn_blocking(move || terminate_groups(&[pgid]))
        .await
        .unwrap_or_else(|e| log_warn!("[agent] kill_process_group task panicked: {}", e));
}

// --- Executor trait ---

/// Performs the work of one feature. The scheduler never looks inside.
///
/// Implementations must stop promptly once `cancel` fires and should stream
/// human-readable progress through `sink`.
pub trait FeatureExecutor: Send + Sync {
    fn run(
        &self,
        feature: &Feature,
        scope: &ProjectScope,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<RunResult, String>> + Send;

    fn resume(
        &self,
        feature: &Feature,
        scope: &ProjectScope,
        sink: &ProgressSink,
        prior_context: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<RunResult, String>> + Send;
}

/// Runs features by spawning an AI coding CLI as a subprocess.
pub struct CliAgentExecutor {
    pub tool: CliTool,
    pub model: Option<String>,
    pub timeout: Duration,
}

impl CliAgentExecutor {
    pub fn new(tool: CliTool, model: Option<String>, timeout: Duration) -> Self {
        Self {
            tool,
            model,
            timeout,
        }
    }

    pub fn from_config(agent: &AgentConfig) -> Self {
        Self::new(
            agent.cli,
            agent.model.clone(),
            Duration::from_secs(u64::from(agent.timeout_minutes) * 60),
        )
    }

    /// Verify that the configured CLI tool is available on PATH.
    pub fn verify_cli_available(&self) -> Result<(), String> {
        let output = std::process::Command::new(self.tool.binary_name())
            .args(self.tool.version_args())
            .output()
            .map_err(|e| {
                format!(
                    "{} not found on PATH. {} ({})",
                    self.tool.display_name(),
                    self.tool.install_hint(),
                    e
                )
            })?;

        if !output.status.success() {
            return Err(format!(
                "{} found but `{} {}` failed",
                self.tool.display_name(),
                self.tool.binary_name(),
                self.tool.version_args().join(" ")
            ));
        }

        Ok(())
    }

    fn command(&self, prompt: &str, scope: &ProjectScope) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(self.tool.binary_name());
        cmd.args(self.tool.build_args(prompt, self.model.as_deref()));
        cmd.current_dir(scope.root());
        cmd
    }
}

impl FeatureExecutor for CliAgentExecutor {
    async fn run(
        &self,
        feature: &Feature,
        scope: &ProjectScope,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RunResult, String> {
        let result_path = scope.result_path(&feature.id);
        let prompt = prompt::build_run_prompt(feature, &result_path);
        run_subprocess_agent(
            self.command(&prompt, scope),
            &result_path,
            self.timeout,
            sink,
            cancel,
        )
        .await
    }

    async fn resume(
        &self,
        feature: &Feature,
        scope: &ProjectScope,
        sink: &ProgressSink,
        prior_context: &str,
        cancel: &CancellationToken,
    ) -> Result<RunResult, String> {
        let result_path = scope.result_path(&feature.id);
        let prompt = prompt::build_resume_prompt(feature, prior_context, &result_path);
        run_subprocess_agent(
            self.command(&prompt, scope),
            &result_path,
            self.timeout,
            sink,
            cancel,
        )
        .await
    }
}

/// Spawn an agent subprocess and wait for it, streaming stdout to `sink`.
///
/// The caller configures the `Command` (program, args, cwd); this function
/// handles process-group isolation, timeout, cancellation and the result
/// file. The child runs in its own process group so a kill reaches anything
/// it spawned.
///
/// An agent that exits without writing `result_path` ended early: that is a
/// non-passing result, not an error. Spawn failures, timeouts, cancellation
/// and unreadable result files are errors.
pub async fn run_subprocess_agent(
    mut cmd: tokio::process::Command,
    result_path: &Path,
    timeout: Duration,
    sink: &ProgressSink,
    cancel: &CancellationToken,
) -> Result<RunResult, String> {
    // Unconditional delete avoids a check-then-remove race
    match tokio::fs::remove_file(result_path).await {
        Ok(()) => log_warn!(
            "[agent] Stale result file found at {}, deleted",
            result_path.display()
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(format!(
                "Failed to remove stale result file {}: {}",
                result_path.display(),
                e
            ))
        }
    }
    if let Some(parent) = result_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }

    // stdin must be null: in its own process group the child is in the
    // background, and reading the terminal would stop it with SIGTTIN.
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::inherit());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec() where only
    // async-signal-safe functions are permitted. setpgid is one of them.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("Failed to spawn agent: {}", e))?;
    let child_pid = child
        .id()
        .ok_or_else(|| "Failed to get agent PID".to_string())? as i32;
    let pgid = Pid::from_raw(child_pid);
    register_child(pgid);
    log_debug!(
        "[agent] Spawned pid={} (timeout={}s)",
        child_pid,
        timeout.as_secs()
    );

    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let waited = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log_debug!("[agent] Cancelled, killing process group {}", child_pid);
                kill_process_group(pgid).await;
                let _ = child.wait().await;
                unregister_child(pgid);
                return Err("Cancelled".to_string());
            }
            _ = &mut deadline => {
                log_debug!("[agent] Timed out after {}s, killing process group", timeout.as_secs());
                kill_process_group(pgid).await;
                let _ = child.wait().await;
                unregister_child(pgid);
                return Err(format!("Agent timed out after {} seconds", timeout.as_secs()));
            }
            line = next_line(&mut stdout) => match line {
                Some(line) => sink.emit(&line),
                None => stdout = None,
            },
            status = child.wait() => break status,
        }
    };
    unregister_child(pgid);

    let exit_status = waited.map_err(|e| format!("Error waiting for agent: {}", e))?;
    log_debug!("[agent] Exited (status={:?})", exit_status.code());

    // Lines still buffered in the pipe after exit
    let drain = async {
        while let Some(line) = next_line(&mut stdout).await {
            sink.emit(&line);
        }
    };
    let _ = tokio::time::timeout(Duration::from_millis(STDOUT_DRAIN_TIMEOUT_MS), drain).await;

    if is_shutdown_requested() {
        return Err("Shutdown requested".to_string());
    }

    match read_result_file(result_path).await? {
        Some(result) => {
            if !exit_status.success() {
                log_warn!("[agent] Agent exited with non-zero status but wrote a result");
            }
            cleanup_result_file(result_path).await;
            Ok(result)
        }
        None => {
            let exit_info = match exit_status.code() {
                Some(0) => "exit code 0".to_string(),
                Some(code) => format!("exit code {}", code),
                None => "killed by signal".to_string(),
            };
            Ok(RunResult::not_passed(&format!(
                "Agent ended without reporting a result ({})",
                exit_info
            )))
        }
    }
}

/// Next stdout line, or pending forever once the stream is gone.
async fn next_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> Option<String> {
    match lines {
        Some(reader) => reader.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

/// Read a result file. `Ok(None)` when the agent never wrote one.
pub async fn read_result_file(path: &Path) -> Result<Option<RunResult>, String> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(format!(
                "Failed to read result file {}: {}",
                path.display(),
                e
            ))
        }
    };

    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| format!("Failed to parse result JSON from {}: {}", path.display(), e))
}

async fn cleanup_result_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        log_warn!(
            "[agent] Failed to clean up result file {}: {}",
            path.display(),
            e
        );
    }
}

// --- Mock executor ---

/// One recorded call to a `MockExecutor`.
#[derive(Clone, Debug, PartialEq)]
pub struct MockCall {
    pub feature_id: String,
    /// `None` for `run`, the context passed for `resume`.
    pub prior_context: Option<String>,
}

struct MockState {
    scripts: Mutex<HashMap<String, VecDeque<Result<RunResult, String>>>>,
    fallback: Result<RunResult, String>,
    delay: Duration,
    progress: Vec<String>,
    calls: Mutex<Vec<MockCall>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Scripted executor for tests.
///
/// Each feature id can have its own queue of results; once a queue is empty
/// (or for ids without one) the fallback result is returned. An optional
/// delay keeps runs in flight, and cancellation during the delay returns
/// `Err("Cancelled")`. Clones share their call log.
#[derive(Clone)]
pub struct MockExecutor {
    state: Arc<MockState>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    /// Every call passes immediately.
    pub fn new() -> Self {
        Self::with_fallback(Ok(RunResult::passed("done")))
    }

    pub fn with_fallback(fallback: Result<RunResult, String>) -> Self {
        Self {
            state: Arc::new(MockState {
                scripts: Mutex::new(HashMap::new()),
                fallback,
                delay: Duration::ZERO,
                progress: Vec::new(),
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Builder: hold each call for `delay` before answering.
    pub fn delayed(self, delay: Duration) -> Self {
        self.rebuild(|state| state.delay = delay)
    }

    /// Builder: lines streamed to the sink on every call.
    pub fn emitting(self, lines: &[&str]) -> Self {
        let lines: Vec<String> = lines.iter().map(|l| l.to_string()).collect();
        self.rebuild(|state| state.progress = lines)
    }

    /// Builder: results returned, in order, for calls on `feature_id`.
    pub fn scripted(self, feature_id: &str, results: Vec<Result<RunResult, String>>) -> Self {
        if let Ok(mut scripts) = self.state.scripts.lock() {
            scripts.insert(feature_id.to_string(), results.into());
        }
        self
    }

    fn rebuild(self, edit: impl FnOnce(&mut MockState)) -> Self {
        let scripts = self
            .state
            .scripts
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        let mut state = MockState {
            scripts: Mutex::new(scripts),
            fallback: self.state.fallback.clone(),
            delay: self.state.delay,
            progress: self.state.progress.clone(),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        };
        edit(&mut state);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state
            .calls
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    pub fn calls_for(&self, feature_id: &str) -> Vec<MockCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.feature_id == feature_id)
            .collect()
    }

    /// Highest number of calls that were in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn answer(
        &self,
        feature: &Feature,
        prior_context: Option<&str>,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RunResult, String> {
        if let Ok(mut calls) = self.state.calls.lock() {
            calls.push(MockCall {
                feature_id: feature.id.clone(),
                prior_context: prior_context.map(str::to_string),
            });
        }
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        for line in &self.state.progress {
            sink.emit(line);
        }

        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.state.delay) => false,
        };
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        if cancelled {
            return Err("Cancelled".to_string());
        }

        let scripted = self
            .state
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.get_mut(&feature.id).and_then(VecDeque::pop_front));
        scripted.unwrap_or_else(|| self.state.fallback.clone())
    }
}

impl FeatureExecutor for MockExecutor {
    async fn run(
        &self,
        feature: &Feature,
        _scope: &ProjectScope,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RunResult, String> {
        self.answer(feature, None, sink, cancel).await
    }

    async fn resume(
        &self,
        feature: &Feature,
        _scope: &ProjectScope,
        sink: &ProgressSink,
        prior_context: &str,
        cancel: &CancellationToken,
    ) -> Result<RunResult, String> {
        self.answer(feature, Some(prior_context), sink, cancel).await
    }
}
