use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::FgError;
use crate::log_debug;
use crate::types::ProjectScope;

struct HandleEntry {
    generation: u64,
    cancel: CancellationToken,
    scope: ProjectScope,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryState {
    handles: HashMap<String, HandleEntry>,
    next_generation: u64,
}

/// Tracks which features currently have a live execution.
///
/// Single authoritative map: at most one handle per feature id. Cloning the
/// registry shares the same map, so the admission loop and manual operations
/// on one scheduler see the same state, while separate schedulers stay
/// independent.
///
/// Uses `std::sync::Mutex` (not tokio's) because operations are fast
/// (insert/remove/iterate) with no I/O or `.await` under the lock.
#[derive(Clone, Default)]
pub struct ExecutionRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // A panic while holding the lock cannot leave the map half-updated
        // (every mutation is a single insert/remove/clear), so recover.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically claim `feature_id`. Fails with `AlreadyRunning` if a handle exists.
    pub fn reserve(&self, feature_id: &str, scope: &ProjectScope) -> Result<ExecutionHandle, FgError> {
        self.reserve_within(feature_id, scope, None)
    }

    /// Like `reserve`, but also refuses once `limit` handles are registered.
    ///
    /// The count check and the insert happen under one lock, so concurrent
    /// callers sharing a limit can never push `count()` past it.
    pub fn reserve_within(
        &self,
        feature_id: &str,
        scope: &ProjectScope,
        limit: Option<usize>,
    ) -> Result<ExecutionHandle, FgError> {
        let mut state = self.lock();
        if state.handles.contains_key(feature_id) {
            return Err(FgError::AlreadyRunning(feature_id.to_string()));
        }
        if let Some(limit) = limit {
            if state.handles.len() >= limit {
                return Err(FgError::AlreadyRunning(format!(
                    "{} (all {} slots in use)",
                    feature_id, limit
                )));
            }
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let cancel = CancellationToken::new();
        state.handles.insert(
            feature_id.to_string(),
            HandleEntry {
                generation,
                cancel: cancel.clone(),
                scope: scope.clone(),
                started_at: Utc::now(),
            },
        );

        Ok(ExecutionHandle {
            feature_id: feature_id.to_string(),
            generation,
            cancel,
            scope: scope.clone(),
            registry: self.clone(),
            released: false,
        })
    }

    /// Remove whatever handle is registered for `feature_id`. Idempotent.
    pub fn release(&self, feature_id: &str) {
        self.lock().handles.remove(feature_id);
    }

    /// Remove the entry only if it still belongs to `generation`.
    fn release_generation(&self, feature_id: &str, generation: u64) {
        let mut state = self.lock();
        let owned = state
            .handles
            .get(feature_id)
            .is_some_and(|entry| entry.generation == generation);
        if owned {
            state.handles.remove(feature_id);
        }
    }

    fn owns(&self, feature_id: &str, generation: u64) -> bool {
        self.lock()
            .handles
            .get(feature_id)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Signal the handle's cancellation token. Returns false if nothing is registered.
    ///
    /// The handle stays registered until its run unwinds and releases it.
    pub fn cancel(&self, feature_id: &str) -> bool {
        match self.lock().handles.get(feature_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Signal every handle, then clear the registry without waiting for runs to drain.
    pub fn cancel_all(&self) {
        let drained: Vec<(String, HandleEntry)> = self.lock().handles.drain().collect();
        for (feature_id, entry) in drained {
            log_debug!(
                "[{}] Cancelling run started at {} in {}",
                feature_id,
                entry.started_at.to_rfc3339(),
                entry.scope.root().display()
            );
            entry.cancel.cancel();
        }
    }

    pub fn is_running(&self, feature_id: &str) -> bool {
        self.lock().handles.contains_key(feature_id)
    }

    pub fn running_ids(&self) -> BTreeSet<String> {
        self.lock().handles.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.lock().handles.len()
    }
}

/// Live record of one feature's execution.
///
/// Dropping the handle releases its registry entry, so every exit path of a
/// run (success, error, cancellation, panic) frees the slot. Release only
/// removes the entry this handle created: after `cancel_all` a new handle for
/// the same id is never removed by an old one.
pub struct ExecutionHandle {
    feature_id: String,
    generation: u64,
    cancel: CancellationToken,
    scope: ProjectScope,
    registry: ExecutionRegistry,
    released: bool,
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("feature_id", &self.feature_id)
            .field("generation", &self.generation)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ExecutionHandle {
    pub fn feature_id(&self) -> &str {
        &self.feature_id
    }

    pub fn scope(&self) -> &ProjectScope {
        &self.scope
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True while this handle is still the registered execution for its id.
    pub fn is_live(&self) -> bool {
        !self.released && self.registry.owns(&self.feature_id, self.generation)
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.registry
                .release_generation(&self.feature_id, self.generation);
        }
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}
