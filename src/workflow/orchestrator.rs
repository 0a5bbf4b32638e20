//! The code agent workflow: provision a sandbox, run the agent against it,
//! persist exactly one result record, then try a GitHub push.
//!
//! | Stage                   | Output                     |
//! |-------------------------|----------------------------|
//! | `get-sandbox-id`        | `SandboxRef`               |
//! | `get-previous-messages` | history, oldest first      |
//! | `run-network`           | final `AgentState`         |
//! | `generate-summaries`    | title and response, if any |
//! | `get-sandbox-url`       | `https://<host>`           |
//! | `save-result`           | id and kind of the record  |
//! | `auto-push-to-github`   | push result, if any        |
//!
//! Classification between `generate-summaries` and `get-sandbox-url` is pure
//! and not checkpointed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::generators::FALLBACK_TEXT;
use crate::agent::{
    AgentState, ChatMessage, ChatModel, CodeAgent, GeneratedText, NetworkOutcome,
    PostRunGenerators, RunNetwork, ToolContext,
};
use crate::config::VibeConfig;
use crate::errors::{GENERIC_FAILURE_MESSAGE, WorkflowError};
use crate::github::{GitHubClient, PushResult};
use crate::sandbox::{SandboxProvider, SandboxRef};
use crate::store::{DbHandle, Message, MessageRole, MessageType, NewFragment};

use super::checkpoint::{CheckpointStore, StepRunner};

pub mod stage {
    pub const GET_SANDBOX_ID: &str = "get-sandbox-id";
    pub const GET_PREVIOUS_MESSAGES: &str = "get-previous-messages";
    pub const RUN_NETWORK: &str = "run-network";
    pub const GENERATE_SUMMARIES: &str = "generate-summaries";
    pub const GET_SANDBOX_URL: &str = "get-sandbox-url";
    pub const SAVE_RESULT: &str = "save-result";
    pub const AUTO_PUSH_TO_GITHUB: &str = "auto-push-to-github";
}

/// Payload of a `code-agent/run` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub project_id: String,
    pub value: String,
}

/// Output payload returned to the caller of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    pub url: String,
    pub title: String,
    pub files: BTreeMap<String, String>,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NetworkStageOutput {
    state: AgentState,
    outcome: NetworkOutcome,
}

/// Identity of the single result record written for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedResult {
    pub message_id: String,
    pub kind: MessageType,
}

/// RESULT iff the agent produced both a summary and at least one file.
pub fn classify(state: &AgentState) -> MessageType {
    if state.summary.is_empty() || state.files.is_empty() {
        MessageType::Error
    } else {
        MessageType::Result
    }
}

/// Stable id of the result record of `run_id`.
pub fn result_message_id(run_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, run_id.as_bytes()).to_string()
}

/// Map a stored message to the turn format the agent expects.
fn to_chat_message(message: Message) -> ChatMessage {
    match message.role {
        MessageRole::Assistant => ChatMessage::assistant(message.content),
        MessageRole::User => ChatMessage::user(message.content),
    }
}

/// What the fallible stages produced.
struct Execution {
    state: AgentState,
    generated: Option<GeneratedText>,
    url: String,
}

/// Everything a run needs, shared by all runs of the process.
#[derive(Clone)]
pub struct CodeAgentWorkflow {
    db: DbHandle,
    sandboxes: Arc<dyn SandboxProvider>,
    model: Arc<dyn ChatModel>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: Arc<VibeConfig>,
}

impl CodeAgentWorkflow {
    pub fn new(
        db: DbHandle,
        sandboxes: Arc<dyn SandboxProvider>,
        model: Arc<dyn ChatModel>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: Arc<VibeConfig>,
    ) -> Self {
        Self {
            db,
            sandboxes,
            model,
            checkpoints,
            config,
        }
    }

    /// Execute (or resume) run `run_id`.
    ///
    /// Each stage is retried under `config.workflow`. A stage before
    /// `save-result` that fails every attempt becomes an ERROR record and is
    /// not returned. An `Err` means the record itself could not be written.
    pub async fn run(&self, run_id: &str, event: &RunEvent) -> Result<RunOutput, WorkflowError> {
        let steps =
            StepRunner::new(self.checkpoints.as_ref(), run_id).with_retry(&self.config.workflow);
        info!(run_id, project_id = %event.project_id, "Starting code agent run");

        let execution = match self.execute(&steps, event).await {
            Ok(execution) => Some(execution),
            Err(e) => {
                error!(run_id, project_id = %event.project_id, error = %e, "Run failed, recording error result");
                None
            }
        };

        let saved: SavedResult = steps
            .run_once(stage::SAVE_RESULT, || {
                self.save_result(run_id, &event.project_id, execution.as_ref())
            })
            .await?;
        info!(run_id, message_id = %saved.message_id, kind = saved.kind.as_str(), "Saved run result");

        if saved.kind == MessageType::Result
            && let Some(execution) = &execution
        {
            let pushed: Result<Option<PushResult>, WorkflowError> = steps
                .run_once(stage::AUTO_PUSH_TO_GITHUB, || {
                    self.auto_push(&event.project_id, &execution.state.files)
                })
                .await;
            if let Err(e) = pushed {
                warn!(run_id, error = %e, "Auto-push stage failed");
            }
        }

        Ok(match execution {
            Some(execution) => RunOutput {
                url: execution.url,
                title: execution
                    .generated
                    .map(|g| g.title)
                    .unwrap_or_else(|| FALLBACK_TEXT.to_string()),
                files: execution.state.files,
                summary: execution.state.summary,
            },
            None => RunOutput {
                url: String::new(),
                title: FALLBACK_TEXT.to_string(),
                files: BTreeMap::new(),
                summary: String::new(),
            },
        })
    }

    async fn execute(
        &self,
        steps: &StepRunner<'_>,
        event: &RunEvent,
    ) -> Result<Execution, WorkflowError> {
        let sandbox_ref: SandboxRef = steps
            .run_once(stage::GET_SANDBOX_ID, || async {
                let template = &self.config.sandbox.template;
                let sandbox = self.sandboxes.create(template).await?;
                sandbox
                    .set_timeout(Duration::from_secs(self.config.sandbox.timeout_secs))
                    .await?;
                anyhow::Ok(SandboxRef {
                    id: sandbox.id().to_string(),
                    template: template.clone(),
                })
            })
            .await?;

        let history: Vec<ChatMessage> = steps
            .run_once(stage::GET_PREVIOUS_MESSAGES, || async {
                let project_id = event.project_id.clone();
                let limit = self.config.agent.history_limit;
                let mut messages = self
                    .db
                    .call(move |db| db.recent_messages(&project_id, limit))
                    .await?;
                messages.reverse();
                anyhow::Ok(messages.into_iter().map(to_chat_message).collect())
            })
            .await?;
        debug!(turns = history.len(), "Loaded conversation history");

        let network: NetworkStageOutput = steps
            .run_once(stage::RUN_NETWORK, || async {
                let sandbox = self.sandboxes.connect(&sandbox_ref.id).await?;
                let agent = CodeAgent::new(self.model.clone(), &self.config.agent);
                let mut state = AgentState::default();
                let outcome = {
                    let mut ctx = ToolContext::new(sandbox, &mut state);
                    RunNetwork::new(self.config.agent.max_iter)
                        .run(&agent, &event.value, history.clone(), &mut ctx)
                        .await?
                };
                anyhow::Ok(NetworkStageOutput { state, outcome })
            })
            .await?;
        info!(
            iterations = network.outcome.iterations,
            stop_reason = ?network.outcome.stop_reason,
            files = network.state.files.len(),
            "Agent network finished"
        );
        let state = network.state;

        let generated: Option<GeneratedText> = steps
            .run_once(stage::GENERATE_SUMMARIES, || async {
                if state.summary.is_empty() {
                    return anyhow::Ok(None);
                }
                let generators = PostRunGenerators::new(self.model.clone(), &self.config.agent);
                anyhow::Ok(Some(generators.run(&state.summary).await?))
            })
            .await?;

        let url: String = steps
            .run_once(stage::GET_SANDBOX_URL, || async {
                let sandbox = self.sandboxes.connect(&sandbox_ref.id).await?;
                anyhow::Ok(format!(
                    "https://{}",
                    sandbox.get_host(self.config.sandbox.preview_port)
                ))
            })
            .await?;

        Ok(Execution {
            state,
            generated,
            url,
        })
    }

    /// Write the run's single result record. The message id is derived from
    /// the run id, so re-executing this after a lost checkpoint is a no-op.
    async fn save_result(
        &self,
        run_id: &str,
        project_id: &str,
        execution: Option<&Execution>,
    ) -> anyhow::Result<SavedResult> {
        let fragment = execution
            .filter(|e| classify(&e.state) == MessageType::Result)
            .map(|e| {
                let title = e
                    .generated
                    .as_ref()
                    .map(|g| g.title.clone())
                    .unwrap_or_else(|| FALLBACK_TEXT.to_string());
                let content = e
                    .generated
                    .as_ref()
                    .map(|g| g.response.clone())
                    .unwrap_or_else(|| FALLBACK_TEXT.to_string());
                (
                    content,
                    NewFragment {
                        sandbox_url: e.url.clone(),
                        title,
                        files: e.state.files.clone(),
                    },
                )
            });

        let message_id = result_message_id(run_id);
        let project_id = project_id.to_string();
        let message = self
            .db
            .call(move |db| match fragment {
                Some((content, fragment)) => db.create_result_message(
                    &message_id,
                    &project_id,
                    &content,
                    MessageType::Result,
                    Some(&fragment),
                ),
                None => db.create_result_message(
                    &message_id,
                    &project_id,
                    GENERIC_FAILURE_MESSAGE,
                    MessageType::Error,
                    None,
                ),
            })
            .await?;

        Ok(SavedResult {
            message_id: message.id,
            kind: message.message_type,
        })
    }

    /// Best-effort push of the run's files. Never fails the run.
    async fn auto_push(
        &self,
        project_id: &str,
        files: &BTreeMap<String, String>,
    ) -> anyhow::Result<Option<PushResult>> {
        let id = project_id.to_string();
        let project = self.db.call(move |db| db.get_project(&id)).await?;
        let Some(project) = project.filter(|p| p.github_enabled) else {
            debug!(project_id, "GitHub sync not enabled, skipping push");
            return Ok(None);
        };
        let Some(repo) = project.github_repo_name.as_deref() else {
            debug!(project_id, "No GitHub repository configured, skipping push");
            return Ok(None);
        };
        let Some(token) = self.config.github.token.as_deref() else {
            info!(project_id, repo, "Auto-push skipped: no GitHub token configured");
            return Ok(None);
        };

        let github = &self.config.github;
        let pushed = match GitHubClient::new(&github.api_base, token) {
            Ok(client) => client.push_files(repo, files, &github.commit_message).await,
            Err(e) => Err(e),
        };
        match pushed {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                warn!(project_id, repo, error = %e, diagnostic = %e.diagnostic(), "Auto-push to GitHub failed");
                Ok(None)
            }
        }
    }
}
