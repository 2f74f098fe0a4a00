use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::agent::FeatureExecutor;
use crate::config::SchedulerConfig;
use crate::dependency::{find_dependency_cycles, is_ready, unmet_dependency_summary};
use crate::error::FgError;
use crate::events::LifecycleNotifier;
use crate::registry::{ExecutionHandle, ExecutionRegistry};
use crate::retry::{self, RetryOutcome, DEFAULT_MAX_ATTEMPTS};
use crate::store::{ContextLog, FeatureStore};
use crate::types::{
    Feature, FeatureStatus, ProjectScope, RunMode, RunOutcome, SchedulerStatus,
};
use crate::{log_debug, log_error, log_info, log_warn};

/// Timing and retry knobs fixed for the lifetime of a `Scheduler`.
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub max_attempts: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            max_attempts: config.max_attempts,
        }
    }
}

// --- Pure selection ---

/// Pick the features to admit on one tick.
///
/// Returns up to `available` ids of ready features (backlog, nothing
/// blocking) that are not already running, in store order.
pub fn select_admissions(
    features: &[Feature],
    running_ids: &BTreeSet<String>,
    available: usize,
) -> Vec<String> {
    features
        .iter()
        .filter(|f| !running_ids.contains(&f.id))
        .filter(|f| is_ready(f, features))
        .take(available)
        .map(|f| f.id.clone())
        .collect()
}

// --- Scheduler ---

struct LoopState {
    scope: ProjectScope,
    max_concurrency: usize,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner<S, E> {
    store: S,
    executor: E,
    notifier: LifecycleNotifier,
    registry: ExecutionRegistry,
    settings: SchedulerSettings,
    loop_state: Mutex<Option<LoopState>>,
}

/// Admission loop plus the manual operations that share its registry.
///
/// Clones share one registry and one loop; separate `Scheduler`s are
/// independent.
pub struct Scheduler<S, E> {
    inner: Arc<Inner<S, E>>,
}

impl<S, E> Clone for Scheduler<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, E> Scheduler<S, E>
where
    S: FeatureStore + ContextLog + 'static,
    E: FeatureExecutor + 'static,
{
    pub fn new(store: S, executor: E, notifier: LifecycleNotifier, settings: SchedulerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                notifier,
                registry: ExecutionRegistry::new(),
                settings,
                loop_state: Mutex::new(None),
            }),
        }
    }

    pub fn notifier(&self) -> &LifecycleNotifier {
        &self.inner.notifier
    }

    pub fn registry(&self) -> &ExecutionRegistry {
        &self.inner.registry
    }

    fn loop_state(&self) -> MutexGuard<'_, Option<LoopState>> {
        self.inner
            .loop_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the periodic admission loop for `scope`.
    ///
    /// Fails with `AlreadyRunning` if a loop is active. Must be called from
    /// within a tokio runtime.
    pub fn start_loop(&self, scope: &ProjectScope, max_concurrency: usize) -> Result<(), FgError> {
        if max_concurrency == 0 {
            return Err(FgError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }

        let mut state = self.loop_state();
        if let Some(existing) = state.as_ref() {
            if !existing.task.is_finished() {
                return Err(FgError::AlreadyRunning(format!(
                    "admission loop for {}",
                    existing.scope.root().display()
                )));
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(admission_loop(
            self.clone(),
            scope.clone(),
            max_concurrency,
            cancel.clone(),
        ));
        *state = Some(LoopState {
            scope: scope.clone(),
            max_concurrency,
            cancel,
            task,
        });
        log_info!(
            "[loop] Started (max_concurrency={}, tick={}ms)",
            max_concurrency,
            self.inner.settings.tick_interval.as_millis()
        );
        Ok(())
    }

    /// Stop the loop and cancel every active execution without waiting for them.
    ///
    /// Returns whether a loop was running. Cancelled runs unwind on their own
    /// and leave their features `in_progress`.
    pub fn stop_loop(&self) -> bool {
        let previous = self.loop_state().take();
        let was_running = match previous {
            Some(state) => {
                state.cancel.cancel();
                log_info!(
                    "[loop] Stopped (max_concurrency was {})",
                    state.max_concurrency
                );
                !state.task.is_finished()
            }
            None => false,
        };
        self.inner.registry.cancel_all();
        was_running
    }

    pub fn status(&self) -> SchedulerStatus {
        let running = self
            .loop_state()
            .as_ref()
            .is_some_and(|state| !state.task.is_finished());
        let active_ids = self.inner.registry.running_ids();
        SchedulerStatus {
            running,
            count: active_ids.len(),
            active_ids,
        }
    }

    /// Start a fresh run of `feature_id` outside the loop.
    ///
    /// Returns once the feature is reserved and marked `in_progress`; the
    /// handle resolves when the run ends. While the loop is running, manual
    /// starts share its `max_concurrency` ceiling and are refused with
    /// `AlreadyRunning` when every slot is taken.
    pub async fn run_one(
        &self,
        scope: &ProjectScope,
        feature_id: &str,
    ) -> Result<JoinHandle<RunOutcome>, FgError> {
        self.start_manual(scope, feature_id, RunMode::Fresh).await
    }

    /// Resume `feature_id` from its context log.
    pub async fn resume_one(
        &self,
        scope: &ProjectScope,
        feature_id: &str,
    ) -> Result<JoinHandle<RunOutcome>, FgError> {
        self.start_manual(scope, feature_id, RunMode::Resume).await
    }

    /// Append `note` to the context log, then resume `feature_id`.
    pub async fn follow_up(
        &self,
        scope: &ProjectScope,
        feature_id: &str,
        note: &str,
    ) -> Result<JoinHandle<RunOutcome>, FgError> {
        self.start_manual(
            scope,
            feature_id,
            RunMode::FollowUp {
                note: note.to_string(),
            },
        )
        .await
    }

    /// Cancel the active execution of `feature_id`. False if none is running.
    pub fn stop_one(&self, feature_id: &str) -> bool {
        let cancelled = self.inner.registry.cancel(feature_id);
        if cancelled {
            log_info!("[{}] Stop requested", feature_id);
        }
        cancelled
    }

    /// Commit the working tree for a `verified` feature and return the commit SHA.
    ///
    /// The id is reserved for the duration of the commit, so a commit and a
    /// run of the same feature exclude each other. Status is unchanged.
    pub async fn commit_one(&self, scope: &ProjectScope, feature_id: &str) -> Result<String, FgError> {
        let is_verified = |status: FeatureStatus| status == FeatureStatus::Verified;
        let feature = self.find_feature(scope, feature_id).await?;
        if !is_verified(feature.status) {
            return Err(FgError::InvalidTransition {
                id: feature_id.to_string(),
                from: feature.status,
                action: "commit",
            });
        }

        let (handle, feature) = self
            .reserve_checked(scope, feature_id, self.capacity_limit(), "commit", is_verified)
            .await?;
        let root = scope.root().to_path_buf();
        let id = feature.id.clone();
        let title = feature.title().to_string();
        let result = tokio::task::spawn_blocking(move || {
            crate::git::commit_feature(&id, &title, &root)
        })
        .await
        .unwrap_or_else(|e| Err(format!("spawn_blocking panicked: {}", e)))
        .map_err(FgError::Git);
        handle.release();

        let sha = result?;
        log_info!("[{}] [commit] {}", feature_id, sha);
        Ok(sha)
    }

    /// The loop's ceiling while it is running; manual work is unbounded otherwise.
    fn capacity_limit(&self) -> Option<usize> {
        self.loop_state()
            .as_ref()
            .filter(|state| !state.task.is_finished())
            .map(|state| state.max_concurrency)
    }

    async fn find_feature(&self, scope: &ProjectScope, feature_id: &str) -> Result<Feature, FgError> {
        self.inner
            .store
            .load_features(scope)
            .await?
            .into_iter()
            .find(|f| f.id == feature_id)
            .ok_or_else(|| FgError::NotFound(feature_id.to_string()))
    }

    async fn start_manual(
        &self,
        scope: &ProjectScope,
        feature_id: &str,
        mode: RunMode,
    ) -> Result<JoinHandle<RunOutcome>, FgError> {
        let feature = self.find_feature(scope, feature_id).await?;
        if !feature.status.accepts_manual_start() {
            return Err(FgError::InvalidTransition {
                id: feature_id.to_string(),
                from: feature.status,
                action: mode.label(),
            });
        }

        let (handle, feature) = self
            .claim(
                scope,
                feature_id,
                self.capacity_limit(),
                mode.label(),
                |status: FeatureStatus| status.accepts_manual_start(),
            )
            .await?;
        let this = self.clone();
        Ok(tokio::spawn(async move {
            this.execute(handle, feature, mode).await
        }))
    }

    /// Reserve `feature_id`, then re-read it and check `accepts` against the
    /// status it has now.
    ///
    /// Any earlier status check ran on a snapshot; a run of the same id may
    /// have settled and released in between. Only a status read after the
    /// reservation is authoritative. The reservation is released on mismatch.
    async fn reserve_checked(
        &self,
        scope: &ProjectScope,
        feature_id: &str,
        limit: Option<usize>,
        action: &'static str,
        accepts: impl Fn(FeatureStatus) -> bool,
    ) -> Result<(ExecutionHandle, Feature), FgError> {
        let handle = self.inner.registry.reserve_within(feature_id, scope, limit)?;
        let feature = match self.find_feature(scope, feature_id).await {
            Ok(feature) => feature,
            Err(e) => {
                handle.release();
                return Err(e);
            }
        };
        if !accepts(feature.status) {
            handle.release();
            return Err(FgError::InvalidTransition {
                id: feature_id.to_string(),
                from: feature.status,
                action,
            });
        }
        Ok((handle, feature))
    }

    /// Reserve the feature and mark it `in_progress` before anything is spawned.
    ///
    /// The reservation is released again if the status write fails.
    async fn claim(
        &self,
        scope: &ProjectScope,
        feature_id: &str,
        limit: Option<usize>,
        action: &'static str,
        accepts: impl Fn(FeatureStatus) -> bool,
    ) -> Result<(ExecutionHandle, Feature), FgError> {
        let (handle, mut feature) = self
            .reserve_checked(scope, feature_id, limit, action, accepts)
            .await?;
        if let Err(e) = self
            .inner
            .store
            .set_status(scope, &feature.id, FeatureStatus::InProgress)
            .await
        {
            handle.release();
            return Err(e);
        }
        feature.status = FeatureStatus::InProgress;
        Ok((handle, feature))
    }

    /// Run the retry controller, settle the status, then release the handle.
    async fn execute(&self, handle: ExecutionHandle, feature: Feature, mode: RunMode) -> RunOutcome {
        log_info!("[{}] Starting {}: {}", feature.id, mode.label(), feature.title());
        self.inner.notifier.start(&feature);

        let outcome = retry::run_with_retries(
            &self.inner.store,
            &self.inner.executor,
            &self.inner.notifier,
            &handle,
            &feature,
            &mode,
            self.inner.settings.max_attempts,
        )
        .await;

        let settled = self.settle(&handle, &feature, &mode, outcome).await;
        handle.release();
        settled
    }

    async fn settle(
        &self,
        handle: &ExecutionHandle,
        feature: &Feature,
        mode: &RunMode,
        outcome: Result<RetryOutcome, FgError>,
    ) -> RunOutcome {
        let id = feature.id.as_str();
        let notifier = &self.inner.notifier;

        // A handle replaced or cancelled after the controller returned no
        // longer owns the feature's status.
        let outcome = if !handle.is_live() || handle.cancel_token().is_cancelled() {
            let attempts = outcome.as_ref().map(RetryOutcome::attempts).unwrap_or(0);
            Ok(RetryOutcome::Cancelled { attempts })
        } else {
            outcome
        };

        match outcome {
            Ok(RetryOutcome::Passed { result, attempts }) => {
                let status = FeatureStatus::on_success(feature.skip_tests);
                if let Err(e) = self.write_status(handle.scope(), id, status).await {
                    notifier.error(id, &e.to_string());
                    return RunOutcome::Failed(e.to_string());
                }
                log_info!("[{}] Passed after {} attempt(s) -> {}", id, attempts, status);
                notifier.complete(id, true, &result.message);
                RunOutcome::Passed(result)
            }
            Ok(RetryOutcome::Exhausted { result, attempts }) => {
                if mode.is_fresh() {
                    if let Err(e) = self
                        .write_status(handle.scope(), id, FeatureStatus::Backlog)
                        .await
                    {
                        notifier.error(id, &e.to_string());
                        return RunOutcome::Failed(e.to_string());
                    }
                    log_info!("[{}] Not passing after {} attempt(s) -> backlog", id, attempts);
                } else {
                    log_info!(
                        "[{}] Not passing after {} attempt(s), left in_progress for manual resume",
                        id,
                        attempts
                    );
                }
                notifier.complete(id, false, &result.message);
                RunOutcome::NotPassed(result)
            }
            Ok(RetryOutcome::Abandoned { result, .. }) => {
                notifier.complete(id, false, &result.message);
                RunOutcome::NotPassed(result)
            }
            Ok(RetryOutcome::Cancelled { .. }) => {
                log_info!("[{}] Stopped", id);
                notifier.error(id, "stopped");
                RunOutcome::Cancelled
            }
            Err(e) => {
                log_warn!("[{}] {} failed: {}", id, mode.label(), e);
                if mode.is_fresh() {
                    // Failure already reported below; a write error only adds a log line.
                    let _ = self
                        .write_status(handle.scope(), id, FeatureStatus::Backlog)
                        .await;
                }
                notifier.error(id, &e.to_string());
                RunOutcome::Failed(e.to_string())
            }
        }
    }

    async fn write_status(
        &self,
        scope: &ProjectScope,
        feature_id: &str,
        status: FeatureStatus,
    ) -> Result<(), FgError> {
        self.inner
            .store
            .set_status(scope, feature_id, status)
            .await
            .inspect_err(|e| log_error!("[{}] Failed to set status {}: {}", feature_id, status, e))
    }

    /// One admission pass.
    async fn tick(
        &self,
        scope: &ProjectScope,
        max_concurrency: usize,
        runs: &mut JoinSet<(String, RunOutcome)>,
    ) {
        let available = max_concurrency.saturating_sub(self.inner.registry.count());
        if available == 0 {
            log_debug!("[loop] At capacity ({}), skipping tick", max_concurrency);
            return;
        }

        let features = match self.inner.store.load_features(scope).await {
            Ok(features) => features,
            Err(e) => {
                log_warn!("[loop] Failed to load features, retrying next tick: {}", e);
                return;
            }
        };

        for feature in features.iter().filter(|f| f.status == FeatureStatus::Backlog) {
            if let Some(summary) = unmet_dependency_summary(feature, &features) {
                log_debug!("[{}] Waiting on {}", feature.id, summary);
            }
        }

        let running = self.inner.registry.running_ids();
        for feature_id in select_admissions(&features, &running, available) {
            let admitted = self
                .claim(
                    scope,
                    &feature_id,
                    Some(max_concurrency),
                    "admit",
                    |status| status == FeatureStatus::Backlog,
                )
                .await;
            match admitted {
                Ok((handle, feature)) => {
                    let this = self.clone();
                    runs.spawn(async move {
                        let id = feature.id.clone();
                        let outcome = this.execute(handle, feature, RunMode::Fresh).await;
                        (id, outcome)
                    });
                }
                Err(e) => log_warn!("[{}] Not admitted: {}", feature_id, e),
            }
        }
    }
}

async fn admission_loop<S, E>(
    scheduler: Scheduler<S, E>,
    scope: ProjectScope,
    max_concurrency: usize,
    cancel: CancellationToken,
) where
    S: FeatureStore + ContextLog + 'static,
    E: FeatureExecutor + 'static,
{
    if let Ok(features) = scheduler.inner.store.load_features(&scope).await {
        for cycle in find_dependency_cycles(&features) {
            log_warn!(
                "[loop] Dependency cycle, these features will never start: {}",
                cycle.join(" -> ")
            );
        }
    }

    let mut interval = tokio::time::interval(scheduler.inner.settings.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut runs: JoinSet<(String, RunOutcome)> = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                scheduler.tick(&scope, max_concurrency, &mut runs).await;
            }
            Some(joined) = runs.join_next(), if !runs.is_empty() => {
                match joined {
                    Ok((feature_id, outcome)) => {
                        log_debug!("[{}] Run finished: {:?}", feature_id, outcome);
                    }
                    Err(e) => log_error!("[loop] Run task failed: {}", e),
                }
            }
        }
    }

    // Cancelled runs unwind on their own tokens.
    runs.detach_all();
}
