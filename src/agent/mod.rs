//! The code agent and everything it needs for one run: the LLM boundary,
//! the tool registry, per-run state, the router loop and the post-run
//! generators.

pub mod code_agent;
pub mod generators;
pub mod llm;
pub mod network;
pub mod prompts;
pub mod state;
pub mod tools;

pub use code_agent::{CodeAgent, TurnOutcome};
pub use generators::{GeneratedText, PostRunGenerators};
pub use llm::{ChatMessage, ChatModel, OpenAiChatModel, ScriptedChatModel};
pub use network::{NetworkOutcome, Route, RunNetwork, StopReason};
pub use state::{AgentState, ToolContext};
pub use tools::ToolRegistry;
