//! Tools the code agent can call.
//!
//! Each tool validates its arguments by hand before touching the sandbox and
//! always answers with a string: failures are reported back to the model as
//! tool output so it can correct itself, never raised to the workflow.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::llm::{ToolCall, ToolDefinition};
use super::state::ToolContext;
use crate::errors::{SandboxError, ToolError};

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema advertised to the model.
    fn parameters(&self) -> Value;

    /// Structural check run before any sandbox interaction.
    fn validate(&self, args: &Value) -> Result<(), ToolError>;

    /// Execute a validated call.
    async fn handle(&self, args: &Value, ctx: &mut ToolContext<'_>) -> String;
}

// ── argument helpers ─────────────────────────────────────────────────

fn invalid(tool: &str, reason: impl Into<String>) -> ToolError {
    ToolError::InvalidArguments {
        tool: tool.to_string(),
        reason: reason.into(),
    }
}

fn object<'a>(tool: &str, args: &'a Value) -> Result<&'a serde_json::Map<String, Value>, ToolError> {
    args.as_object()
        .ok_or_else(|| invalid(tool, "arguments must be a JSON object"))
}

fn string_field<'a>(tool: &str, args: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    match object(tool, args)?.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(invalid(tool, format!("'{}' must be a string", field))),
        None => Err(invalid(tool, format!("missing field '{}'", field))),
    }
}

fn array_field<'a>(tool: &str, args: &'a Value, field: &str) -> Result<&'a Vec<Value>, ToolError> {
    match object(tool, args)?.get(field) {
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(invalid(tool, format!("'{}' must be an array", field))),
        None => Err(invalid(tool, format!("missing field '{}'", field))),
    }
}

// ── terminal ─────────────────────────────────────────────────────────

pub struct TerminalTool;

impl TerminalTool {
    const NAME: &'static str = "terminal";
}

#[async_trait]
impl Tool for TerminalTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Use the terminal to run commands"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "command": { "type": "string" } },
            "required": ["command"],
            "additionalProperties": false,
        })
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        string_field(Self::NAME, args, "command").map(|_| ())
    }

    async fn handle(&self, args: &Value, ctx: &mut ToolContext<'_>) -> String {
        let command = match string_field(Self::NAME, args, "command") {
            Ok(c) => c,
            Err(e) => return e.to_string(),
        };

        match ctx.sandbox.run_command(command).await {
            Ok(output) => output.stdout,
            Err(e) => {
                let (stdout, stderr) = match &e {
                    SandboxError::CommandFailed { stdout, stderr, .. } => {
                        (stdout.as_str(), stderr.as_str())
                    }
                    _ => ("", ""),
                };
                let message = format!("Command failed: {e}\nstdout:{stdout}\nstderr: {stderr}");
                warn!(command, error = %e, "Terminal command failed");
                message
            }
        }
    }
}

// ── createOrUpdateFile ───────────────────────────────────────────────

pub struct CreateOrUpdateFileTool;

struct FileWrite<'a> {
    path: &'a str,
    content: &'a str,
}

impl CreateOrUpdateFileTool {
    const NAME: &'static str = "createOrUpdateFile";

    fn parse(args: &Value) -> Result<Vec<FileWrite<'_>>, ToolError> {
        let items = array_field(Self::NAME, args, "files")?;
        let mut files = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            let field = |name: &str| match item.get(name) {
                Some(Value::String(s)) => Ok(s.as_str()),
                Some(_) => Err(invalid(
                    Self::NAME,
                    format!("'files[{}].{}' must be a string", i, name),
                )),
                None => Err(invalid(
                    Self::NAME,
                    format!("missing field 'files[{}].{}'", i, name),
                )),
            };
            if !item.is_object() {
                return Err(invalid(Self::NAME, format!("'files[{}]' must be an object", i)));
            }
            files.push(FileWrite {
                path: field("path")?,
                content: field("content")?,
            });
        }
        Ok(files)
    }
}

/// Restore what a partially applied call wrote, newest first.
async fn roll_back(ctx: &ToolContext<'_>, written: Vec<(&str, Option<String>)>) {
    for (path, prior) in written.into_iter().rev() {
        let result = match prior {
            Some(content) => ctx.sandbox.write_file(path, &content).await,
            None => ctx.sandbox.remove_file(path).await,
        };
        if let Err(e) = result {
            warn!(path, error = %e, "Failed to roll back file write");
        }
    }
}

#[async_trait]
impl Tool for CreateOrUpdateFileTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Create or update a file in the sandbox"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "files": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "path": { "type": "string" },
                            "content": { "type": "string" },
                        },
                        "required": ["path", "content"],
                        "additionalProperties": false,
                    }
                }
            },
            "required": ["files"],
            "additionalProperties": false,
        })
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        Self::parse(args).map(|_| ())
    }

    async fn handle(&self, args: &Value, ctx: &mut ToolContext<'_>) -> String {
        let files = match Self::parse(args) {
            Ok(f) => f,
            Err(e) => return e.to_string(),
        };

        // The call is all-or-nothing: state is only updated once every write landed.
        let mut written: Vec<(&str, Option<String>)> = Vec::with_capacity(files.len());
        for file in &files {
            let prior = match ctx.sandbox.read_file(file.path).await {
                Ok(content) => Some(content),
                Err(SandboxError::FileNotFound { .. }) => None,
                Err(e) => {
                    // Without a snapshot the file could not be restored.
                    warn!(path = file.path, error = %e, "Cannot read file before overwriting, rolling back call");
                    roll_back(ctx, written).await;
                    return format!("Error: {}", e);
                }
            };
            if let Err(e) = ctx.sandbox.write_file(file.path, file.content).await {
                warn!(path = file.path, error = %e, "File write failed, rolling back call");
                roll_back(ctx, written).await;
                return format!("Error: {}", e);
            }
            written.push((file.path, prior));
        }

        ctx.state.record_files(
            files
                .iter()
                .map(|f| (f.path.to_string(), f.content.to_string())),
        );
        let paths: Vec<&str> = files.iter().map(|f| f.path).collect();
        info!(count = paths.len(), "Wrote files");
        format!("Updated files: {}", paths.join(", "))
    }
}

// ── readFiles ────────────────────────────────────────────────────────

pub struct ReadFilesTool;

#[derive(Serialize)]
struct FileContent<'a> {
    path: &'a str,
    content: String,
}

impl ReadFilesTool {
    const NAME: &'static str = "readFiles";

    fn parse(args: &Value) -> Result<Vec<&str>, ToolError> {
        array_field(Self::NAME, args, "files")?
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_str()
                    .ok_or_else(|| invalid(Self::NAME, format!("'files[{}]' must be a string", i)))
            })
            .collect()
    }
}

#[async_trait]
impl Tool for ReadFilesTool {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn description(&self) -> &'static str {
        "Read files from the sandbox"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "files": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["files"],
            "additionalProperties": false,
        })
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        Self::parse(args).map(|_| ())
    }

    async fn handle(&self, args: &Value, ctx: &mut ToolContext<'_>) -> String {
        let paths = match Self::parse(args) {
            Ok(p) => p,
            Err(e) => return e.to_string(),
        };

        let mut contents = Vec::with_capacity(paths.len());
        for path in paths {
            match ctx.sandbox.read_file(path).await {
                Ok(content) => contents.push(FileContent { path, content }),
                Err(e) => return format!("Error reading files: {}", e),
            }
        }
        serde_json::to_string(&contents)
            .unwrap_or_else(|e| format!("Error reading files: {}", e))
    }
}

// ── registry ─────────────────────────────────────────────────────────

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl ToolRegistry {
    /// `terminal`, `createOrUpdateFile` and `readFiles`.
    pub fn standard() -> Self {
        Self {
            tools: vec![
                Box::new(TerminalTool),
                Box::new(CreateOrUpdateFileTool),
                Box::new(ReadFilesTool),
            ],
        }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    fn find(&self, name: &str) -> Result<&dyn Tool, ToolError> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    /// Run one tool call and return the text fed back to the model.
    pub async fn execute(&self, call: &ToolCall, ctx: &mut ToolContext<'_>) -> String {
        debug!(tool = %call.name, call_id = %call.id, "Executing tool call");
        let tool = match self.find(&call.name) {
            Ok(tool) => tool,
            Err(e) => return e.to_string(),
        };

        let args: Value = match serde_json::from_str(&call.arguments) {
            Ok(args) => args,
            Err(e) => {
                return invalid(tool.name(), format!("arguments are not valid JSON: {}", e))
                    .to_string();
            }
        };
        if let Err(e) = tool.validate(&args) {
            warn!(tool = %call.name, error = %e, "Rejected tool call");
            return e.to_string();
        }
        tool.handle(&args, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::AgentState;
    use crate::sandbox::SandboxProvider;
    use crate::sandbox::memory::{MemorySandboxProvider, ScriptedCommand};
    use std::sync::Arc;

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            name: name.into(),
            arguments: args.to_string(),
        }
    }

    async fn sandbox(provider: &MemorySandboxProvider) -> Arc<dyn crate::sandbox::Sandbox> {
        provider.create("test").await.unwrap()
    }

    #[tokio::test]
    async fn test_terminal_returns_stdout() {
        let provider = MemorySandboxProvider::new();
        provider.script_command("ls", ScriptedCommand::Succeed("app\npackage.json\n".into()));
        let mut state = AgentState::default();
        let mut ctx = ToolContext::new(sandbox(&provider).await, &mut state);

        let out = ToolRegistry::standard()
            .execute(&call("terminal", json!({"command": "ls"})), &mut ctx)
            .await;
        assert_eq!(out, "app\npackage.json\n");
    }

    #[tokio::test]
    async fn test_terminal_failure_embeds_both_buffers() {
        let provider = MemorySandboxProvider::new();
        provider.script_command(
            "npm run build",
            ScriptedCommand::Fail {
                exit_code: 1,
                stdout: "> build\n".into(),
                stderr: "Type error: x is not assignable".into(),
            },
        );
        let mut state = AgentState::default();
        let mut ctx = ToolContext::new(sandbox(&provider).await, &mut state);

        let out = ToolRegistry::standard()
            .execute(&call("terminal", json!({"command": "npm run build"})), &mut ctx)
            .await;
        assert!(out.starts_with("Command failed: "));
        assert!(out.contains("stdout:> build"));
        assert!(out.contains("stderr: Type error: x is not assignable"));
    }

    #[tokio::test]
    async fn test_create_files_updates_state_and_sandbox() {
        let provider = MemorySandboxProvider::new();
        let sbx = sandbox(&provider).await;
        let id = sbx.id().to_string();
        let mut state = AgentState::default();
        let mut ctx = ToolContext::new(sbx, &mut state);

        let args = json!({"files": [
            {"path": "app/page.tsx", "content": "v1"},
            {"path": "app/page.tsx", "content": "v2"},
            {"path": "lib/util.ts", "content": "u"},
        ]});
        let out = ToolRegistry::standard()
            .execute(&call("createOrUpdateFile", args), &mut ctx)
            .await;
        assert!(out.starts_with("Updated files"));
        assert_eq!(state.files.len(), 2);
        assert_eq!(state.files["app/page.tsx"], "v2");
        assert_eq!(provider.files(&id)["app/page.tsx"], "v2");
    }

    #[tokio::test]
    async fn test_create_files_twice_is_idempotent() {
        let provider = MemorySandboxProvider::new();
        let mut state = AgentState::default();
        let mut ctx = ToolContext::new(sandbox(&provider).await, &mut state);
        let registry = ToolRegistry::standard();
        let args = json!({"files": [{"path": "a.ts", "content": "x"}]});

        registry.execute(&call("createOrUpdateFile", args.clone()), &mut ctx).await;
        let once = ctx.state.files.clone();
        registry.execute(&call("createOrUpdateFile", args), &mut ctx).await;
        assert_eq!(ctx.state.files, once);
    }

    #[tokio::test]
    async fn test_create_files_is_all_or_nothing() {
        let provider = MemorySandboxProvider::new();
        provider.fail_writes_to("b.ts");
        let sbx = sandbox(&provider).await;
        let id = sbx.id().to_string();
        sbx.write_file("a.ts", "original").await.unwrap();

        let mut state = AgentState::default();
        let mut ctx = ToolContext::new(sbx, &mut state);
        let args = json!({"files": [
            {"path": "a.ts", "content": "changed"},
            {"path": "new.ts", "content": "n"},
            {"path": "b.ts", "content": "b"},
        ]});
        let out = ToolRegistry::standard()
            .execute(&call("createOrUpdateFile", args), &mut ctx)
            .await;

        assert!(out.starts_with("Error: "));
        assert!(state.files.is_empty());
        let files = provider.files(&id);
        assert_eq!(files["a.ts"], "original");
        assert!(!files.contains_key("new.ts"));
        assert!(!files.contains_key("b.ts"));
    }

    #[tokio::test]
    async fn test_unreadable_file_is_never_removed_by_rollback() {
        let provider = MemorySandboxProvider::new();
        provider.fail_writes_to("b.ts");
        let sbx = sandbox(&provider).await;
        let id = sbx.id().to_string();
        sbx.write_file("a.ts", "first").await.unwrap();
        sbx.write_file("logo.bin", "binary").await.unwrap();
        provider.fail_reads_from("logo.bin");

        let mut state = AgentState::default();
        let mut ctx = ToolContext::new(sbx, &mut state);
        let args = json!({"files": [
            {"path": "a.ts", "content": "changed"},
            {"path": "logo.bin", "content": "text"},
            {"path": "b.ts", "content": "b"},
        ]});
        let out = ToolRegistry::standard()
            .execute(&call("createOrUpdateFile", args), &mut ctx)
            .await;

        assert!(out.starts_with("Error: "));
        assert!(state.files.is_empty());
        let files = provider.files(&id);
        assert_eq!(files["a.ts"], "first");
        assert_eq!(files["logo.bin"], "binary");
        assert!(!files.contains_key("b.ts"));
    }

    #[tokio::test]
    async fn test_read_files_returns_json_array() {
        let provider = MemorySandboxProvider::new();
        let sbx = sandbox(&provider).await;
        sbx.write_file("a.ts", "A").await.unwrap();
        let mut state = AgentState::default();
        let mut ctx = ToolContext::new(sbx, &mut state);

        let out = ToolRegistry::standard()
            .execute(&call("readFiles", json!({"files": ["a.ts"]})), &mut ctx)
            .await;
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed, json!([{"path": "a.ts", "content": "A"}]));
    }

    #[tokio::test]
    async fn test_read_missing_file_is_error_string() {
        let provider = MemorySandboxProvider::new();
        let mut state = AgentState::default();
        let mut ctx = ToolContext::new(sandbox(&provider).await, &mut state);

        let out = ToolRegistry::standard()
            .execute(&call("readFiles", json!({"files": ["nope.ts"]})), &mut ctx)
            .await;
        assert!(out.starts_with("Error reading files: "));
    }

    #[tokio::test]
    async fn test_invalid_arguments_never_touch_sandbox() {
        let provider = MemorySandboxProvider::new();
        let mut state = AgentState::default();
        let mut ctx = ToolContext::new(sandbox(&provider).await, &mut state);
        let registry = ToolRegistry::standard();

        let out = registry
            .execute(&call("terminal", json!({"cmd": "ls"})), &mut ctx)
            .await;
        assert_eq!(out, "Invalid arguments for terminal: missing field 'command'");

        let out = registry
            .execute(
                &call("createOrUpdateFile", json!({"files": [{"path": "a.ts"}]})),
                &mut ctx,
            )
            .await;
        assert_eq!(
            out,
            "Invalid arguments for createOrUpdateFile: missing field 'files[0].content'"
        );
        assert!(provider.command_log().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_json() {
        let provider = MemorySandboxProvider::new();
        let mut state = AgentState::default();
        let mut ctx = ToolContext::new(sandbox(&provider).await, &mut state);
        let registry = ToolRegistry::standard();

        let out = registry.execute(&call("deploy", json!({})), &mut ctx).await;
        assert_eq!(out, "Unknown tool 'deploy'");

        let bad = ToolCall {
            id: "c".into(),
            name: "readFiles".into(),
            arguments: "{not json".into(),
        };
        let out = registry.execute(&bad, &mut ctx).await;
        assert!(out.starts_with("Invalid arguments for readFiles: arguments are not valid JSON"));
    }

    #[test]
    fn test_definitions_cover_all_tools() {
        let names: Vec<String> = ToolRegistry::standard()
            .definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["terminal", "createOrUpdateFile", "readFiles"]);
    }
}
