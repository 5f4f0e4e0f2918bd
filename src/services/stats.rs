//! Runtime statistics with file persistence
//!
//! `StatsTracker` collects named values from registered sources and writes a
//! JSON snapshot to disk at a fixed interval, so operators can inspect a
//! running agent (or its last state after a crash) without touching the
//! broker. Sources are plain closures; anything the application wants
//! surfaced registers one.

use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::StatsSection;

/// Errors from stats persistence
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("Failed to read stats file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write stats file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Stats serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A named value provider. Returning `None` omits the entry from the
/// snapshot.
pub type StatSource = Arc<dyn Fn() -> Option<Value> + Send + Sync>;

/// Collects snapshots from registered sources and persists them.
pub struct StatsTracker {
    file: PathBuf,
    save_interval: Duration,
    started: Instant,
    sources: Mutex<Vec<(String, StatSource)>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatsTracker {
    pub fn new(config: &StatsSection) -> Self {
        Self {
            file: config.file.clone(),
            save_interval: Duration::from_secs(config.save_interval_secs),
            started: Instant::now(),
            sources: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        }
    }

    /// Register a source under a name. Registering the same name again
    /// replaces the previous source.
    pub fn register_source<F>(&self, name: impl Into<String>, source: F)
    where
        F: Fn() -> Option<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        let source: StatSource = Arc::new(source);
        let mut sources = self.lock_sources();
        if let Some(slot) = sources.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = source;
        } else {
            sources.push((name, source));
        }
    }

    /// Remove a source by name. Returns whether one was registered.
    pub fn unregister_source(&self, name: &str) -> bool {
        let mut sources = self.lock_sources();
        let before = sources.len();
        sources.retain(|(n, _)| n != name);
        before != sources.len()
    }

    /// Snapshot all sources right now, in registration order.
    pub fn collect_now(&self) -> Value {
        let mut snapshot = serde_json::Map::new();
        snapshot.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        snapshot.insert(
            "uptime_secs".to_string(),
            Value::from(self.started.elapsed().as_secs()),
        );
        for (name, source) in self.lock_sources().iter() {
            if let Some(value) = source() {
                snapshot.insert(name.clone(), value);
            }
        }
        Value::Object(snapshot)
    }

    /// Read the snapshot left by a previous run, if any.
    pub async fn load_previous(&self) -> Result<Option<Value>, StatsError> {
        let bytes = match tokio::fs::read(&self.file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StatsError::FileRead {
                    path: self.file.clone(),
                    source: e,
                })
            }
        };
        let value = serde_json::from_slice(&bytes)?;
        Ok(Some(value))
    }

    /// Write the current snapshot to the stats file.
    pub async fn save(&self) -> Result<(), StatsError> {
        let snapshot = self.collect_now();
        let body = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(&self.file, body)
            .await
            .map_err(|e| StatsError::FileWrite {
                path: self.file.clone(),
                source: e,
            })?;
        debug!("Stats snapshot written to {}", self.file.display());
        Ok(())
    }

    /// Spawn the periodic save loop. Save failures are logged and the loop
    /// keeps going.
    pub fn start(self: Arc<Self>) {
        let mut task = self.lock_task();
        if task.is_some() {
            return;
        }

        let tracker = Arc::clone(&self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tracker.save_interval);
            ticker.tick().await; // First tick completes immediately, skip it
            loop {
                ticker.tick().await;
                if let Err(e) = tracker.save().await {
                    warn!("Periodic stats save failed: {e}");
                }
            }
        }));

        info!(
            file = %self.file.display(),
            interval_secs = self.save_interval.as_secs(),
            "Stats tracker started"
        );
    }

    /// Stop the save loop and write a final snapshot.
    pub async fn stop(&self) {
        let handle = self.lock_task().take();
        if let Some(handle) = handle {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Stats task shutdown error: {e}");
                }
            }
        }
        if let Err(e) = self.save().await {
            warn!("Final stats save failed: {e}");
        }
    }

    fn lock_sources(&self) -> std::sync::MutexGuard<'_, Vec<(String, StatSource)>> {
        self.sources.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}
