//! Durable-ish event dispatch for `code-agent/run`.
//!
//! Events are queued on an mpsc channel and each one is executed on its own
//! tokio task. Stages retry on their own; a run that still returns `Err`
//! (its result could not be recorded) is retried with the same run id, so
//! stages that already completed replay from their checkpoints.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::WorkflowConfig;

use super::checkpoint::retry_delay;
use super::orchestrator::{CodeAgentWorkflow, RunEvent, RunOutput};

pub const EVENT_NAME: &str = "code-agent/run";

/// A named event as accepted on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub data: Value,
}

type Reply = oneshot::Sender<Result<RunOutput, String>>;

struct Envelope {
    run_id: String,
    event: RunEvent,
    reply: Option<Reply>,
}

/// Handle for enqueueing runs. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Envelope>,
}

impl Dispatcher {
    /// Spawn the dispatch loop. The loop ends when every `Dispatcher` clone is dropped.
    pub fn start(workflow: Arc<CodeAgentWorkflow>, policy: WorkflowConfig) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(64);
        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let workflow = Arc::clone(&workflow);
                let policy = policy.clone();
                tokio::spawn(async move {
                    let result = run_with_retry(&workflow, &policy, &envelope.run_id, &envelope.event).await;
                    if let Some(reply) = envelope.reply {
                        let _ = reply.send(result.map_err(|e| format!("{:#}", e)));
                    }
                });
            }
            info!("Dispatcher stopped");
        });
        (Self { tx }, handle)
    }

    /// Enqueue a run and return its id without waiting for it.
    pub async fn send(&self, event: RunEvent) -> Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.enqueue(run_id.clone(), event, None).await?;
        Ok(run_id)
    }

    /// Enqueue a named event. Only `code-agent/run` is recognized.
    pub async fn send_event(&self, event: Event) -> Result<String> {
        if event.name != EVENT_NAME {
            anyhow::bail!("Unknown event '{}'", event.name);
        }
        let payload: RunEvent = serde_json::from_value(event.data)
            .with_context(|| format!("Invalid payload for {}", EVENT_NAME))?;
        self.send(payload).await
    }

    /// Enqueue a run under `run_id` and wait for its output.
    pub async fn send_and_wait(&self, run_id: &str, event: RunEvent) -> Result<RunOutput> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(run_id.to_string(), event, Some(reply_tx)).await?;
        reply_rx
            .await
            .context("Run task dropped its reply")?
            .map_err(|e| anyhow::anyhow!(e))
    }

    async fn enqueue(&self, run_id: String, event: RunEvent, reply: Option<Reply>) -> Result<()> {
        info!(%run_id, project_id = %event.project_id, event = EVENT_NAME, "Enqueued run");
        self.tx
            .send(Envelope {
                run_id,
                event,
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Dispatcher is not running"))
    }
}

async fn run_with_retry(
    workflow: &CodeAgentWorkflow,
    policy: &WorkflowConfig,
    run_id: &str,
    event: &RunEvent,
) -> Result<RunOutput> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match workflow.run(run_id, event).await {
            Ok(output) => {
                info!(run_id, attempt, "Run finished");
                return Ok(output);
            }
            Err(e) if attempt < max_attempts => {
                let delay = retry_delay(policy.retry_backoff_ms, attempt);
                warn!(run_id, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Run failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(run_id, attempt, error = %e, "Run failed, giving up");
                return Err(e.into());
            }
        }
    }
}
