use tokio::sync::{mpsc, oneshot};

use crate::context_log;
use crate::error::FgError;
use crate::feature_list;
use crate::log_debug;
use crate::store::{ContextLog, FeatureStore};
use crate::types::{Feature, FeatureStatus, ProjectScope};

const CHANNEL_CAPACITY: usize = 32;

// --- Command enum ---

pub enum CoordinatorCommand {
    LoadFeatures {
        scope: ProjectScope,
        reply: oneshot::Sender<Result<Vec<Feature>, FgError>>,
    },
    SetStatus {
        scope: ProjectScope,
        feature_id: String,
        status: FeatureStatus,
        reply: oneshot::Sender<Result<(), FgError>>,
    },
    ReadContext {
        scope: ProjectScope,
        feature_id: String,
        reply: oneshot::Sender<Result<String, FgError>>,
    },
    AppendContext {
        scope: ProjectScope,
        feature_id: String,
        text: String,
        reply: oneshot::Sender<Result<(), FgError>>,
    },
}

// --- CoordinatorHandle ---

/// Cheap, cloneable sender side of the coordinator.
///
/// Every file mutation goes through the single coordinator task, so status
/// writes from concurrently finishing runs never interleave their
/// read-modify-write of the feature list.
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    async fn send_command<T>(
        &self,
        command: CoordinatorCommand,
        rx: oneshot::Receiver<Result<T, FgError>>,
    ) -> Result<T, FgError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| FgError::CoordinatorUnavailable("coordinator shut down".to_string()))?;
        rx.await
            .map_err(|_| FgError::CoordinatorUnavailable("coordinator dropped reply".to_string()))?
    }
}

impl FeatureStore for CoordinatorHandle {
    async fn load_features(&self, scope: &ProjectScope) -> Result<Vec<Feature>, FgError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::LoadFeatures {
                scope: scope.clone(),
                reply,
            },
            rx,
        )
        .await
    }

    async fn set_status(
        &self,
        scope: &ProjectScope,
        feature_id: &str,
        status: FeatureStatus,
    ) -> Result<(), FgError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::SetStatus {
                scope: scope.clone(),
                feature_id: feature_id.to_string(),
                status,
                reply,
            },
            rx,
        )
        .await
    }
}

impl ContextLog for CoordinatorHandle {
    async fn read_context(&self, scope: &ProjectScope, feature_id: &str) -> Result<String, FgError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::ReadContext {
                scope: scope.clone(),
                feature_id: feature_id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    async fn append_context(
        &self,
        scope: &ProjectScope,
        feature_id: &str,
        text: &str,
    ) -> Result<(), FgError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            CoordinatorCommand::AppendContext {
                scope: scope.clone(),
                feature_id: feature_id.to_string(),
                text: text.to_string(),
                reply,
            },
            rx,
        )
        .await
    }
}

// --- Handlers ---

// The feature list is re-read on every command: the file is the source of
// truth and may be edited between commands (`set-status`, a text editor).

fn handle_load_features(scope: &ProjectScope) -> Result<Vec<Feature>, FgError> {
    Ok(feature_list::load(scope.features_path())?.features)
}

fn handle_set_status(
    scope: &ProjectScope,
    feature_id: &str,
    status: FeatureStatus,
) -> Result<(), FgError> {
    feature_list::update(scope.features_path(), |file| {
        feature_list::set_status(file, feature_id, status)
    })?;
    log_debug!("[{}] Status -> {}", feature_id, status);
    Ok(())
}

async fn run_coordinator(mut rx: mpsc::Receiver<CoordinatorCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            CoordinatorCommand::LoadFeatures { scope, reply } => {
                let _ = reply.send(handle_load_features(&scope));
            }
            CoordinatorCommand::SetStatus {
                scope,
                feature_id,
                status,
                reply,
            } => {
                let _ = reply.send(handle_set_status(&scope, &feature_id, status));
            }
            CoordinatorCommand::ReadContext {
                scope,
                feature_id,
                reply,
            } => {
                let _ = reply.send(context_log::read(&scope.context_path(&feature_id)));
            }
            CoordinatorCommand::AppendContext {
                scope,
                feature_id,
                text,
                reply,
            } => {
                let _ = reply.send(context_log::append(&scope.context_path(&feature_id), &text));
            }
        }
    }
}

/// Spawn the coordinator task. It exits once every handle is dropped.
pub fn spawn_coordinator() -> (CoordinatorHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let task_handle = tokio::spawn(run_coordinator(rx));
    (CoordinatorHandle { sender: tx }, task_handle)
}
