use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::FgError;
use crate::types::{Feature, FeatureStatus, ProjectScope};

/// Source of truth for features. Read fresh before every scheduling decision.
pub trait FeatureStore: Send + Sync {
    fn load_features(
        &self,
        scope: &ProjectScope,
    ) -> impl Future<Output = Result<Vec<Feature>, FgError>> + Send;

    /// Fails with `FgError::NotFound` if no feature has `feature_id`.
    fn set_status(
        &self,
        scope: &ProjectScope,
        feature_id: &str,
        status: FeatureStatus,
    ) -> impl Future<Output = Result<(), FgError>> + Send;
}

/// Append-only per-feature text accumulated across runs and fed back on resume.
pub trait ContextLog: Send + Sync {
    fn read_context(
        &self,
        scope: &ProjectScope,
        feature_id: &str,
    ) -> impl Future<Output = Result<String, FgError>> + Send;

    fn append_context(
        &self,
        scope: &ProjectScope,
        feature_id: &str,
        text: &str,
    ) -> impl Future<Output = Result<(), FgError>> + Send;
}

#[derive(Default)]
struct InMemoryState {
    features: Vec<Feature>,
    contexts: HashMap<String, String>,
    status_writes: Vec<(String, FeatureStatus)>,
    fail_loads: bool,
    load_delay: Duration,
}

/// Feature store and context log held in memory. Ignores the scope.
///
/// Records every status write so callers can assert on the transition
/// sequence, not just the final state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryStore {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState {
                features,
                ..Default::default()
            })),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut InMemoryState) -> T) -> T {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    pub fn features(&self) -> Vec<Feature> {
        self.with_state(|s| s.features.clone())
    }

    pub fn status_of(&self, feature_id: &str) -> Option<FeatureStatus> {
        self.with_state(|s| {
            s.features
                .iter()
                .find(|f| f.id == feature_id)
                .map(|f| f.status)
        })
    }

    /// Overwrite a status without recording it, simulating an outside edit.
    pub fn force_status(&self, feature_id: &str, status: FeatureStatus) {
        self.with_state(|s| {
            if let Some(f) = s.features.iter_mut().find(|f| f.id == feature_id) {
                f.status = status;
            }
        })
    }

    pub fn push_feature(&self, feature: Feature) {
        self.with_state(|s| s.features.push(feature))
    }

    pub fn context_of(&self, feature_id: &str) -> String {
        self.with_state(|s| s.contexts.get(feature_id).cloned().unwrap_or_default())
    }

    /// Every `set_status` call in order, as `(id, status)`.
    pub fn status_writes(&self) -> Vec<(String, FeatureStatus)> {
        self.with_state(|s| s.status_writes.clone())
    }

    /// Make subsequent `load_features` calls fail until reset.
    pub fn set_fail_loads(&self, fail: bool) {
        self.with_state(|s| s.fail_loads = fail)
    }

    /// Hold each `load_features` result for `delay` after taking its snapshot,
    /// so callers act on data that may have gone stale.
    pub fn set_load_delay(&self, delay: Duration) {
        self.with_state(|s| s.load_delay = delay)
    }
}

impl FeatureStore for InMemoryStore {
    async fn load_features(&self, _scope: &ProjectScope) -> Result<Vec<Feature>, FgError> {
        let (snapshot, delay) = self.with_state(|s| {
            let snapshot = if s.fail_loads {
                Err(FgError::Storage("simulated load failure".to_string()))
            } else {
                Ok(s.features.clone())
            };
            (snapshot, s.load_delay)
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        snapshot
    }

    async fn set_status(
        &self,
        _scope: &ProjectScope,
        feature_id: &str,
        status: FeatureStatus,
    ) -> Result<(), FgError> {
        self.with_state(|s| {
            let feature = s
                .features
                .iter_mut()
                .find(|f| f.id == feature_id)
                .ok_or_else(|| FgError::NotFound(feature_id.to_string()))?;
            feature.status = status;
            s.status_writes.push((feature_id.to_string(), status));
            Ok(())
        })
    }
}

impl ContextLog for InMemoryStore {
    async fn read_context(&self, _scope: &ProjectScope, feature_id: &str) -> Result<String, FgError> {
        Ok(self.context_of(feature_id))
    }

    async fn append_context(
        &self,
        _scope: &ProjectScope,
        feature_id: &str,
        text: &str,
    ) -> Result<(), FgError> {
        self.with_state(|s| {
            let entry = s.contexts.entry(feature_id.to_string()).or_default();
            entry.push_str(text);
            if !text.ends_with('\n') {
                entry.push('\n');
            }
        });
        Ok(())
    }
}
