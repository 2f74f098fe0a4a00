use crate::agent::FeatureExecutor;
use crate::context_log;
use crate::error::FgError;
use crate::events::{LifecycleNotifier, ProgressSink};
use crate::registry::ExecutionHandle;
use crate::store::{ContextLog, FeatureStore};
use crate::types::{Feature, FeatureStatus, ProjectScope, RunMode, RunResult};
use crate::{log_debug, log_info, log_warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How a retry sequence ended. Retry exhaustion is an outcome, not an error.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryOutcome {
    /// The executor reported success.
    Passed { result: RunResult, attempts: u32 },
    /// Every attempt ended without success.
    Exhausted { result: RunResult, attempts: u32 },
    /// The feature left `in_progress` (or the store) between attempts, so
    /// someone else now owns its status.
    Abandoned {
        result: RunResult,
        attempts: u32,
        status: Option<FeatureStatus>,
    },
    /// The handle was cancelled or replaced; the last result is discarded.
    Cancelled { attempts: u32 },
}

impl RetryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Passed { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Abandoned { attempts, .. }
            | RetryOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

/// Drive one top-level invocation of `feature` to an outcome.
///
/// The first call is `run` for a fresh start and `resume` otherwise; a
/// follow-up note is appended to the context log first. After each call
/// that does not pass, the feature's live status is re-read, and while it
/// is still `in_progress` and attempts remain the executor is resumed with
/// the accumulated context. The first call counts as attempt 1, so
/// `max_attempts` bounds the total number of executor calls.
///
/// Executor output is moved into the context log after every call, so the
/// next resume sees it. An executor error aborts the sequence with
/// `FgError::ExecutorFailure`.
pub async fn run_with_retries<S, E>(
    store: &S,
    executor: &E,
    notifier: &LifecycleNotifier,
    handle: &ExecutionHandle,
    feature: &Feature,
    mode: &RunMode,
    max_attempts: u32,
) -> Result<RetryOutcome, FgError>
where
    S: FeatureStore + ContextLog,
    E: FeatureExecutor,
{
    let scope = handle.scope();
    let cancel = handle.cancel_token();
    let sink = ProgressSink::new(notifier, &feature.id);
    let max_attempts = max_attempts.max(1);

    if let RunMode::FollowUp { note } = mode {
        store
            .append_context(scope, &feature.id, &context_log::follow_up_entry(note))
            .await?;
    }

    let mut attempt: u32 = 1;
    let first = if mode.is_fresh() {
        executor.run(feature, scope, &sink, cancel).await
    } else {
        let prior_context = store.read_context(scope, &feature.id).await?;
        executor
            .resume(feature, scope, &sink, &prior_context, cancel)
            .await
    };
    save_transcript(store, scope, &sink, feature, attempt).await;

    if cancel.is_cancelled() || !handle.is_live() {
        return Ok(RetryOutcome::Cancelled { attempts: attempt });
    }
    let mut result = first.map_err(FgError::ExecutorFailure)?;

    loop {
        if result.passes {
            return Ok(RetryOutcome::Passed {
                result,
                attempts: attempt,
            });
        }

        if attempt >= max_attempts {
            log_info!(
                "[{}] Not passing after {} attempt(s), giving up",
                feature.id,
                attempt
            );
            return Ok(RetryOutcome::Exhausted {
                result,
                attempts: attempt,
            });
        }

        let live_status = match store.load_features(scope).await {
            Ok(features) => features
                .into_iter()
                .find(|f| f.id == feature.id)
                .map(|f| f.status),
            Err(e) => {
                log_warn!(
                    "[{}] Cannot re-read status before retrying: {}",
                    feature.id,
                    e
                );
                return Ok(RetryOutcome::Exhausted {
                    result,
                    attempts: attempt,
                });
            }
        };
        if live_status != Some(FeatureStatus::InProgress) {
            log_info!(
                "[{}] Status is now {}, not retrying",
                feature.id,
                live_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "missing".to_string())
            );
            return Ok(RetryOutcome::Abandoned {
                result,
                attempts: attempt,
                status: live_status,
            });
        }

        attempt += 1;
        log_info!(
            "[{}] [retry] Attempt {}/{}: {}",
            feature.id,
            attempt,
            max_attempts,
            result.message
        );
        store
            .append_context(
                scope,
                &feature.id,
                &context_log::retry_marker(attempt, max_attempts),
            )
            .await?;
        notifier.progress(
            &feature.id,
            &format!("Retrying (attempt {}/{})", attempt, max_attempts),
        );

        let prior_context = store.read_context(scope, &feature.id).await?;
        let next = executor
            .resume(feature, scope, &sink, &prior_context, cancel)
            .await;
        save_transcript(store, scope, &sink, feature, attempt).await;

        if cancel.is_cancelled() || !handle.is_live() {
            return Ok(RetryOutcome::Cancelled { attempts: attempt });
        }
        result = next.map_err(FgError::ExecutorFailure)?;
    }
}

/// Append what the executor streamed during `attempt` to the context log.
///
/// A failed append is logged; losing transcript lines must not fail the run.
async fn save_transcript<S: ContextLog>(
    store: &S,
    scope: &ProjectScope,
    sink: &ProgressSink,
    feature: &Feature,
    attempt: u32,
) {
    let lines = sink.take_transcript();
    if lines.is_empty() {
        return;
    }
    let entry = format!("\n## Attempt {} output\n\n{}\n", attempt, lines.join("\n"));
    match store.append_context(scope, &feature.id, &entry).await {
        Ok(()) => log_debug!("[{}] Saved {} output line(s)", feature.id, lines.len()),
        Err(e) => log_warn!("[{}] Failed to save output to context: {}", feature.id, e),
    }
}
