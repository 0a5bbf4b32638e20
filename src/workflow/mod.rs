//! Checkpointed execution of code agent runs.

pub mod checkpoint;
pub mod dispatch;
pub mod orchestrator;

pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore, StepRunner};
pub use dispatch::{Dispatcher, EVENT_NAME, Event};
pub use orchestrator::{CodeAgentWorkflow, RunEvent, RunOutput, SavedResult, classify, result_message_id};
