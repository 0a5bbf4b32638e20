//! Stage checkpoints keyed by `(run_id, stage)`.
//!
//! A stage's output is serialized to JSON and stored before the next stage
//! starts. Re-invoking a run with the same id returns stored outputs instead
//! of executing the stage again. A failing stage is retried with
//! exponential backoff before its error is returned.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::WorkflowConfig;
use crate::errors::WorkflowError;
use crate::store::DbHandle;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, run_id: &str, stage: &str) -> Result<Option<String>>;

    async fn save(&self, run_id: &str, stage: &str, output: String) -> Result<()>;
}

/// Checkpoints in the application database.
pub struct SqliteCheckpointStore {
    db: DbHandle,
}

impl SqliteCheckpointStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, run_id: &str, stage: &str) -> Result<Option<String>> {
        let (run_id, stage) = (run_id.to_string(), stage.to_string());
        self.db
            .call(move |db| db.get_checkpoint(&run_id, &stage))
            .await
    }

    async fn save(&self, run_id: &str, stage: &str, output: String) -> Result<()> {
        let (run_id, stage) = (run_id.to_string(), stage.to_string());
        self.db
            .call(move |db| db.put_checkpoint(&run_id, &stage, &output))
            .await
    }
}

/// Process-local checkpoints, for tests and dry runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stages(&self, run_id: &str) -> Vec<String> {
        let mut stages: Vec<String> = self
            .entries
            .lock()
            .map(|e| {
                e.keys()
                    .filter(|(run, _)| run == run_id)
                    .map(|(_, stage)| stage.clone())
                    .collect()
            })
            .unwrap_or_default();
        stages.sort();
        stages
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, run_id: &str, stage: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Checkpoint lock poisoned: {}", e))?;
        Ok(entries
            .get(&(run_id.to_string(), stage.to_string()))
            .cloned())
    }

    async fn save(&self, run_id: &str, stage: &str, output: String) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Checkpoint lock poisoned: {}", e))?;
        entries
            .entry((run_id.to_string(), stage.to_string()))
            .or_insert(output);
        Ok(())
    }
}

/// Exponential backoff: `base`, `2*base`, `4*base`, ...
pub(crate) fn retry_delay(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16)))
}

/// Runs named stages of one run, at most once each.
pub struct StepRunner<'a> {
    store: &'a dyn CheckpointStore,
    run_id: &'a str,
    max_attempts: u32,
    backoff_ms: u64,
}

impl<'a> StepRunner<'a> {
    /// A runner that executes each stage once, without retries.
    pub fn new(store: &'a dyn CheckpointStore, run_id: &'a str) -> Self {
        Self {
            store,
            run_id,
            max_attempts: 1,
            backoff_ms: 0,
        }
    }

    /// Retry failing stages under `policy`.
    pub fn with_retry(mut self, policy: &WorkflowConfig) -> Self {
        self.max_attempts = policy.max_attempts.max(1);
        self.backoff_ms = policy.retry_backoff_ms;
        self
    }

    pub fn run_id(&self) -> &str {
        self.run_id
    }

    /// Return the stored output of `stage`, or execute `f` and store its output.
    ///
    /// `f` is called again after a failure until the attempts run out; only
    /// the last error is returned. Nothing is stored for a failed stage.
    pub async fn run_once<T, F, Fut>(&self, stage: &str, f: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(raw) = self.store.load(self.run_id, stage).await? {
            debug!(run_id = %self.run_id, stage, "Replaying checkpointed stage");
            return serde_json::from_str(&raw).map_err(|source| WorkflowError::CorruptCheckpoint {
                stage: stage.to_string(),
                source,
            });
        }

        let mut attempt = 1;
        let output = loop {
            debug!(run_id = %self.run_id, stage, attempt, "Executing stage");
            match f().await {
                Ok(output) => break output,
                Err(e) if attempt < self.max_attempts => {
                    let delay = retry_delay(self.backoff_ms, attempt);
                    warn!(
                        run_id = %self.run_id,
                        stage,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Stage failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(WorkflowError::Stage {
                        stage: stage.to_string(),
                        source,
                    });
                }
            }
        };

        let raw = serde_json::to_string(&output).map_err(|source| {
            WorkflowError::CorruptCheckpoint {
                stage: stage.to_string(),
                source,
            }
        })?;
        self.store.save(self.run_id, stage, raw).await?;
        Ok(output)
    }
}
