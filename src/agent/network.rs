use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::code_agent::{CodeAgent, TurnOutcome};
use super::llm::ChatMessage;
use super::state::{AgentState, ToolContext};
use crate::errors::LlmError;

/// Where the network sends control before each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Agent,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    IterationLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkOutcome {
    pub iterations: u32,
    pub stop_reason: StopReason,
}

/// Single-agent router loop with a hard iteration ceiling.
pub struct RunNetwork {
    max_iter: u32,
}

impl RunNetwork {
    pub fn new(max_iter: u32) -> Self {
        Self { max_iter }
    }

    /// Done once a summary exists, otherwise hand control back to the agent.
    pub fn route(state: &AgentState) -> Route {
        if state.is_complete() {
            Route::Done
        } else {
            Route::Agent
        }
    }

    /// Drive the agent until it reports completion or the ceiling is reached.
    ///
    /// `history` is the prior conversation, oldest first; `prompt` is appended
    /// as the newest user turn.
    pub async fn run(
        &self,
        agent: &CodeAgent,
        prompt: &str,
        mut history: Vec<ChatMessage>,
        ctx: &mut ToolContext<'_>,
    ) -> Result<NetworkOutcome, LlmError> {
        history.push(ChatMessage::user(prompt));

        let mut iterations = 0;
        loop {
            if Self::route(ctx.state) == Route::Done {
                info!(iterations, "Run network finished");
                return Ok(NetworkOutcome {
                    iterations,
                    stop_reason: StopReason::Completed,
                });
            }
            if iterations >= self.max_iter {
                warn!(iterations, "Run network hit the iteration ceiling");
                return Ok(NetworkOutcome {
                    iterations,
                    stop_reason: StopReason::IterationLimit,
                });
            }

            iterations += 1;
            if let TurnOutcome::Completed { summary } = agent.turn(&mut history, ctx).await? {
                debug!(iterations, chars = summary.len(), "Agent completed");
            }
        }
    }
}
