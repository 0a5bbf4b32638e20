use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::llm::{ChatMessage, ChatModel, ChatRequest};
use super::prompts::{FRAGMENT_TITLE_PROMPT, RESPONSE_PROMPT};
use crate::config::AgentConfig;
use crate::errors::LlmError;

/// Placeholder used when a generator produced no text.
pub const FALLBACK_TEXT: &str = "Fragment";

/// Reduce a generator's raw output to the stored text.
pub fn parse_agent_output(output: Option<&str>) -> String {
    match output.map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => FALLBACK_TEXT.to_string(),
    }
}

/// Single-shot, tool-less agent fed the final summary.
pub struct Generator {
    model: Arc<dyn ChatModel>,
    model_id: String,
    system_prompt: &'static str,
}

impl Generator {
    pub fn new(model: Arc<dyn ChatModel>, model_id: &str, system_prompt: &'static str) -> Self {
        Self {
            model,
            model_id: model_id.to_string(),
            system_prompt,
        }
    }

    pub async fn generate(&self, summary: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: self.model_id.clone(),
            messages: vec![
                ChatMessage::system(self.system_prompt),
                ChatMessage::user(summary),
            ],
            ..Default::default()
        };
        let response = self.model.complete(&request).await?;
        Ok(parse_agent_output(response.content.as_deref()))
    }
}

/// Title and user-facing response for a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedText {
    pub title: String,
    pub response: String,
}

pub struct PostRunGenerators {
    title: Generator,
    response: Generator,
}

impl PostRunGenerators {
    pub fn new(model: Arc<dyn ChatModel>, config: &AgentConfig) -> Self {
        Self {
            title: Generator::new(model.clone(), &config.summary_model, FRAGMENT_TITLE_PROMPT),
            response: Generator::new(model, &config.summary_model, RESPONSE_PROMPT),
        }
    }

    pub async fn run(&self, summary: &str) -> Result<GeneratedText, LlmError> {
        let title = self.title.generate(summary).await?;
        let response = self.response.generate(summary).await?;
        debug!(%title, "Generated fragment title");
        Ok(GeneratedText { title, response })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::llm::{ChatResponse, ScriptedChatModel};

    #[test]
    fn test_parse_agent_output() {
        assert_eq!(parse_agent_output(Some("  Todo App \n")), "Todo App");
        assert_eq!(parse_agent_output(Some("   ")), "Fragment");
        assert_eq!(parse_agent_output(None), "Fragment");
    }

    #[tokio::test]
    async fn test_generators_use_summary_model_and_prompts() {
        let model = Arc::new(ScriptedChatModel::new(vec![
            ChatResponse::text("Todo App"),
            ChatResponse::text("I built you a todo app."),
        ]));
        let generators = PostRunGenerators::new(model.clone(), &AgentConfig::default());

        let text = generators
            .run("<task_summary>Built a todo app</task_summary>")
            .await
            .unwrap();
        assert_eq!(text.title, "Todo App");
        assert_eq!(text.response, "I built you a todo app.");

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.model == "gpt-4o" && r.tools.is_empty()));
        assert_eq!(
            requests[0].messages[0].content.as_deref(),
            Some(FRAGMENT_TITLE_PROMPT)
        );
        assert_eq!(requests[1].messages[0].content.as_deref(), Some(RESPONSE_PROMPT));
    }
}
