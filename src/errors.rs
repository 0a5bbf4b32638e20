//! Typed error hierarchy for the Vibe service.
//!
//! One enum per subsystem:
//! - `SandboxError`: sandbox provider failures (provisioning, exec, file I/O)
//! - `ToolError`: tool-call rejection before the sandbox is touched
//! - `LlmError`: chat-completion transport and decoding failures
//! - `WorkflowError`: run-fatal failures caught at the orchestrator boundary
//! - `GitHubError`: best-effort repository sync failures
//! - `ReviewError`: code review generation failures

use thiserror::Error;

/// Generic text shown to the end user whenever a run fails, whatever the cause.
pub const GENERIC_FAILURE_MESSAGE: &str = "Something went wrong. Please try again.";

/// Errors from a sandbox provider.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox {id} not found")]
    NotFound { id: String },

    #[error("Failed to create sandbox from template '{template}': {message}")]
    CreateFailed { template: String, message: String },

    #[error("Command exited with code {exit_code}")]
    CommandFailed {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },

    #[error("No such file: {path}")]
    FileNotFound { path: String },

    #[error("File operation failed for {path}: {message}")]
    FileOperation { path: String, message: String },

    #[error("Path '{0}' escapes the sandbox root")]
    PathEscape(String),

    #[error("Sandbox provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while validating or dispatching a tool call.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },
}

/// Errors from the LLM provider boundary.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key for the model provider")]
    MissingApiKey,

    #[error("Model provider returned {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Model provider returned no choices")]
    EmptyResponse,

    #[error("Failed to decode model response: {0}")]
    Decode(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Run-fatal errors. Any of these turns into an ERROR result record.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Checkpoint for stage '{stage}' is unreadable: {source}")]
    CorruptCheckpoint {
        stage: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the GitHub sync collaborator.
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("Invalid GitHub token")]
    InvalidToken,

    #[error("Repository not found: {owner}/{repo}")]
    RepoNotFound { owner: String, repo: String },

    #[error("Failed to push to GitHub: {0}")]
    PushFailed(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl GitHubError {
    /// Human-readable diagnostic for logs and API responses.
    pub fn diagnostic(&self) -> String {
        match self {
            GitHubError::RepoNotFound { owner, repo } => format!(
                "Could not find repository '{owner}/{repo}'. Please verify:\n\
                 1. The repository name doesn't contain invalid characters like @ or spaces\n\
                 2. The repository exists in your GitHub account\n\
                 3. Your token has access to this repository\n\n\
                 If you just created the repo, wait 5-10 seconds and try again."
            ),
            other => other.to_string(),
        }
    }
}

/// Errors from generating a code review.
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("No code files found in project")]
    NoFiles,

    /// The review record exists and has been marked FAILED.
    #[error("Review {review_id} failed: {reason}")]
    Failed { review_id: String, reason: String },

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}
