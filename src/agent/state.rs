use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::sandbox::Sandbox;

/// Mutable state of one agent run. Owned by the run, threaded through each
/// turn and tool call by `&mut`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    /// Full text of the assistant turn that carried the completion marker.
    /// Empty until the agent finishes.
    pub summary: String,
    /// Every file written through `createOrUpdateFile`, last write wins.
    pub files: BTreeMap<String, String>,
}

impl AgentState {
    pub fn is_complete(&self) -> bool {
        !self.summary.is_empty()
    }

    pub fn record_files<I>(&mut self, files: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.files.extend(files);
    }
}

/// What a tool handler may touch: the run's sandbox and its state.
pub struct ToolContext<'a> {
    pub sandbox: Arc<dyn Sandbox>,
    pub state: &'a mut AgentState,
}

impl<'a> ToolContext<'a> {
    pub fn new(sandbox: Arc<dyn Sandbox>, state: &'a mut AgentState) -> Self {
        Self { sandbox, state }
    }
}
