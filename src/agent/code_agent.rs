use std::sync::Arc;

use tracing::{debug, info};

use super::llm::{ChatMessage, ChatModel, ChatRequest, Role};
use super::prompts::PROMPT;
use super::state::ToolContext;
use super::tools::ToolRegistry;
use crate::config::AgentConfig;
use crate::errors::LlmError;

/// Literal marker the agent emits when it considers the task finished.
pub const TASK_SUMMARY_MARKER: &str = "<task_summary>";

/// Result of one agent turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Continuing,
    /// The turn's assistant text carried the completion marker.
    Completed { summary: String },
}

/// Whether an assistant text carries the completion marker.
pub fn contains_task_summary(text: &str) -> bool {
    text.contains(TASK_SUMMARY_MARKER)
}

/// Text of the most recent assistant message that has any.
pub fn last_assistant_text(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .find_map(|m| m.content.as_deref().filter(|c| !c.is_empty()))
}

/// The single LLM-backed actor of a run.
pub struct CodeAgent {
    model: Arc<dyn ChatModel>,
    model_id: String,
    temperature: f32,
    system_prompt: String,
    tools: ToolRegistry,
}

impl CodeAgent {
    pub fn new(model: Arc<dyn ChatModel>, config: &AgentConfig) -> Self {
        Self {
            model,
            model_id: config.model.clone(),
            temperature: config.temperature,
            system_prompt: PROMPT.to_string(),
            tools: ToolRegistry::standard(),
        }
    }

    /// Run one turn: ask the model, execute its tool calls in order, then
    /// check the turn's last assistant text for the completion marker.
    ///
    /// The assistant reply and every tool result are appended to `history`.
    /// Tool failures come back as tool output; only model errors are returned.
    pub async fn turn(
        &self,
        history: &mut Vec<ChatMessage>,
        ctx: &mut ToolContext<'_>,
    ) -> Result<TurnOutcome, LlmError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend(history.iter().cloned());

        let request = ChatRequest {
            model: self.model_id.clone(),
            messages,
            temperature: Some(self.temperature),
            tools: self.tools.definitions(),
            ..Default::default()
        };
        let response = self.model.complete(&request).await?;
        let calls = response.tool_calls.clone();
        let turn_start = history.len();
        history.push(response.into_message());

        for call in &calls {
            let output = self.tools.execute(call, ctx).await;
            debug!(tool = %call.name, bytes = output.len(), "Tool call finished");
            history.push(ChatMessage::tool_result(call.id.clone(), output));
        }

        match last_assistant_text(&history[turn_start..]) {
            Some(text) if contains_task_summary(text) => {
                info!("Agent reported task completion");
                let summary = text.to_string();
                ctx.state.summary = summary.clone();
                Ok(TurnOutcome::Completed { summary })
            }
            _ => Ok(TurnOutcome::Continuing),
        }
    }
}
