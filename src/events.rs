//! Lifecycle notifications for feature runs.
//!
//! The scheduler publishes `start`, `progress`, `complete` and `error`
//! events through a `LifecycleNotifier`. Publishing never blocks and never
//! fails: with no subscribers the event is dropped. The `run` command
//! subscribes an NDJSON writer that appends every event, one JSON object per
//! line, to `.feature-golem/events.ndjson`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::FgError;
use crate::log_warn;
use crate::types::Feature;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Start {
        feature_id: String,
        feature: Feature,
    },
    Progress {
        feature_id: String,
        content: String,
    },
    Complete {
        feature_id: String,
        passes: bool,
        message: String,
    },
    Error {
        feature_id: String,
        message: String,
    },
}

impl LifecycleEvent {
    pub fn feature_id(&self) -> &str {
        match self {
            LifecycleEvent::Start { feature_id, .. }
            | LifecycleEvent::Progress { feature_id, .. }
            | LifecycleEvent::Complete { feature_id, .. }
            | LifecycleEvent::Error { feature_id, .. } => feature_id,
        }
    }
}

/// Broadcast side channel for lifecycle events. Clones share one channel.
#[derive(Clone)]
pub struct LifecycleNotifier {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for LifecycleNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: LifecycleEvent) {
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }

    pub fn start(&self, feature: &Feature) {
        self.publish(LifecycleEvent::Start {
            feature_id: feature.id.clone(),
            feature: feature.clone(),
        });
    }

    pub fn progress(&self, feature_id: &str, content: &str) {
        self.publish(LifecycleEvent::Progress {
            feature_id: feature_id.to_string(),
            content: content.to_string(),
        });
    }

    pub fn complete(&self, feature_id: &str, passes: bool, message: &str) {
        self.publish(LifecycleEvent::Complete {
            feature_id: feature_id.to_string(),
            passes,
            message: message.to_string(),
        });
    }

    pub fn error(&self, feature_id: &str, message: &str) {
        self.publish(LifecycleEvent::Error {
            feature_id: feature_id.to_string(),
            message: message.to_string(),
        });
    }
}

/// Where an executor streams output for one feature.
///
/// Each line is published as a `progress` event right away and kept in a
/// transcript the retry controller moves into the context log after the
/// attempt.
pub struct ProgressSink {
    notifier: LifecycleNotifier,
    feature_id: String,
    transcript: Mutex<Vec<String>>,
}

impl ProgressSink {
    pub fn new(notifier: &LifecycleNotifier, feature_id: &str) -> Self {
        Self {
            notifier: notifier.clone(),
            feature_id: feature_id.to_string(),
            transcript: Mutex::new(Vec::new()),
        }
    }

    pub fn feature_id(&self) -> &str {
        &self.feature_id
    }

    pub fn emit(&self, content: &str) {
        self.notifier.progress(&self.feature_id, content);
        if let Ok(mut transcript) = self.transcript.lock() {
            transcript.push(content.to_string());
        }
    }

    /// Lines emitted since the last call, in order.
    pub fn take_transcript(&self) -> Vec<String> {
        self.transcript
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default()
    }
}

/// One line of the event log: the event plus the time it was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LifecycleEvent,
}

impl EventRecord {
    pub fn now(event: LifecycleEvent) -> Self {
        Self {
            ts: Utc::now(),
            event,
        }
    }

    pub fn to_ndjson_line(&self) -> Result<String, FgError> {
        serde_json::to_string(self)
            .map_err(|e| FgError::Storage(format!("Failed to serialize event to JSON: {}", e)))
    }
}

/// Append one record to the NDJSON log at `path`, creating it if missing.
pub fn append_event(path: &Path, record: &EventRecord) -> Result<(), FgError> {
    let line = record.to_ndjson_line()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            FgError::Storage(format!(
                "Failed to create events directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            FgError::Storage(format!("Failed to open events file {}: {}", path.display(), e))
        })?;

    writeln!(file, "{}", line).map_err(|e| {
        FgError::Storage(format!("Failed to write event to {}: {}", path.display(), e))
    })?;

    Ok(())
}

/// Read every record in the log. Blank lines are skipped.
pub fn read_events(path: &Path) -> Result<Vec<EventRecord>, FgError> {
    let contents = fs::read_to_string(path).map_err(|e| {
        FgError::Storage(format!("Failed to read events file {}: {}", path.display(), e))
    })?;

    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| {
                FgError::Storage(format!("Malformed event line in {}: {}", path.display(), e))
            })
        })
        .collect()
}

/// Subscribe to `notifier` and append every event to `path` until the channel closes.
///
/// Write failures and lagged receives are logged and skipped; the writer
/// never stops the runs it observes.
pub fn spawn_event_writer(
    notifier: &LifecycleNotifier,
    path: PathBuf,
) -> tokio::task::JoinHandle<()> {
    let mut rx = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let record = EventRecord::now(event);
                    if let Err(e) = append_event(&path, &record) {
                        log_warn!("[events] {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log_warn!("[events] Event log fell behind, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
