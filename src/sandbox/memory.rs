use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{CommandOutput, Sandbox, SandboxProvider, normalize_path, preview_host};
use crate::errors::SandboxError;

/// Scripted response for a command run in a memory sandbox.
#[derive(Debug, Clone)]
pub enum ScriptedCommand {
    Succeed(String),
    Fail {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },
}

#[derive(Default)]
struct MemoryState {
    sandboxes: HashMap<String, SandboxFiles>,
    commands: HashMap<String, ScriptedCommand>,
    failing_paths: HashSet<String>,
    unreadable_paths: HashSet<String>,
    create_error: Option<String>,
    /// Remaining failing creates; `None` fails every create while `create_error` is set.
    create_failures_left: Option<usize>,
    create_attempts: usize,
    creates: usize,
    command_log: Vec<String>,
}

#[derive(Default)]
struct SandboxFiles {
    files: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

/// In-process sandbox provider. Files live in a map, commands are scripted.
/// Used by tests and by `vibe run --dry-run`.
#[derive(Clone, Default)]
pub struct MemorySandboxProvider {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means another test thread panicked; the map is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent `create` fail with the given message.
    pub fn fail_create(&self, message: &str) {
        let mut state = self.lock();
        state.create_error = Some(message.to_string());
        state.create_failures_left = None;
    }

    /// Make only the next `times` creates fail.
    pub fn fail_next_creates(&self, message: &str, times: usize) {
        let mut state = self.lock();
        state.create_error = Some(message.to_string());
        state.create_failures_left = Some(times);
    }

    /// Script the result of an exact command string. Unscripted commands succeed with empty output.
    pub fn script_command(&self, command: &str, response: ScriptedCommand) {
        self.lock()
            .commands
            .insert(command.to_string(), response);
    }

    /// Make writes to `path` fail in every sandbox.
    pub fn fail_writes_to(&self, path: &str) {
        self.lock().failing_paths.insert(path.to_string());
    }

    /// Make reads of `path` fail as if the file existed but could not be
    /// decoded as text.
    pub fn fail_reads_from(&self, path: &str) {
        self.lock().unreadable_paths.insert(path.to_string());
    }

    /// Sandboxes actually created.
    pub fn create_count(&self) -> usize {
        self.lock().creates
    }

    /// Calls to `create`, failed ones included.
    pub fn create_attempts(&self) -> usize {
        self.lock().create_attempts
    }

    pub fn command_log(&self) -> Vec<String> {
        self.lock().command_log.clone()
    }

    /// Snapshot of a sandbox's files keyed by normalized path.
    pub fn files(&self, id: &str) -> BTreeMap<String, String> {
        self.lock()
            .sandboxes
            .get(id)
            .map(|s| s.files.clone())
            .unwrap_or_default()
    }

    pub fn timeout(&self, id: &str) -> Option<Duration> {
        self.lock().sandboxes.get(id).and_then(|s| s.timeout)
    }

    fn handle(&self, id: &str) -> Arc<dyn Sandbox> {
        Arc::new(MemorySandbox {
            id: id.to_string(),
            provider: self.clone(),
        })
    }
}

#[async_trait]
impl SandboxProvider for MemorySandboxProvider {
    async fn create(&self, template: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let id = {
            let mut state = self.lock();
            state.create_attempts += 1;
            let has_error = state.create_error.is_some();
            let fail = match state.create_failures_left.as_mut() {
                None => has_error,
                Some(0) => false,
                Some(left) => {
                    *left -= 1;
                    true
                }
            };
            if fail && let Some(message) = &state.create_error {
                return Err(SandboxError::CreateFailed {
                    template: template.to_string(),
                    message: message.clone(),
                });
            }
            state.creates += 1;
            let id = format!("mem-{}", state.creates);
            state.sandboxes.insert(id.clone(), SandboxFiles::default());
            id
        };
        Ok(self.handle(&id))
    }

    async fn connect(&self, id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        if !self.lock().sandboxes.contains_key(id) {
            return Err(SandboxError::NotFound { id: id.to_string() });
        }
        Ok(self.handle(id))
    }
}

pub struct MemorySandbox {
    id: String,
    provider: MemorySandboxProvider,
}

impl MemorySandbox {
    fn key(path: &str) -> Result<String, SandboxError> {
        Ok(normalize_path(path)?.to_string_lossy().to_string())
    }
}

#[async_trait]
impl Sandbox for MemorySandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_timeout(&self, timeout: Duration) -> Result<(), SandboxError> {
        let mut state = self.provider.lock();
        let sandbox = state
            .sandboxes
            .get_mut(&self.id)
            .ok_or_else(|| SandboxError::NotFound {
                id: self.id.clone(),
            })?;
        sandbox.timeout = Some(timeout);
        Ok(())
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput, SandboxError> {
        let mut state = self.provider.lock();
        state.command_log.push(command.to_string());
        match state.commands.get(command).cloned() {
            Some(ScriptedCommand::Fail {
                exit_code,
                stdout,
                stderr,
            }) => Err(SandboxError::CommandFailed {
                exit_code,
                stdout,
                stderr,
            }),
            Some(ScriptedCommand::Succeed(stdout)) => Ok(CommandOutput {
                stdout,
                ..Default::default()
            }),
            None => Ok(CommandOutput::default()),
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let key = Self::key(path)?;
        let mut state = self.provider.lock();
        if state.failing_paths.contains(path) || state.failing_paths.contains(&key) {
            return Err(SandboxError::FileOperation {
                path: path.to_string(),
                message: "write rejected".to_string(),
            });
        }
        let sandbox = state
            .sandboxes
            .get_mut(&self.id)
            .ok_or_else(|| SandboxError::NotFound {
                id: self.id.clone(),
            })?;
        sandbox.files.insert(key, content.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        let key = Self::key(path)?;
        let state = self.provider.lock();
        let content = state
            .sandboxes
            .get(&self.id)
            .and_then(|s| s.files.get(&key).cloned())
            .ok_or_else(|| SandboxError::FileNotFound {
                path: path.to_string(),
            })?;
        if state.unreadable_paths.contains(path) || state.unreadable_paths.contains(&key) {
            return Err(SandboxError::FileOperation {
                path: path.to_string(),
                message: "stream did not contain valid UTF-8".to_string(),
            });
        }
        Ok(content)
    }

    async fn remove_file(&self, path: &str) -> Result<(), SandboxError> {
        let key = Self::key(path)?;
        let mut state = self.provider.lock();
        if let Some(sandbox) = state.sandboxes.get_mut(&self.id) {
            sandbox.files.remove(&key);
        }
        Ok(())
    }

    fn get_host(&self, port: u16) -> String {
        preview_host(port, &self.id, "sandbox.local")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_failure_is_command_failed() {
        let provider = MemorySandboxProvider::new();
        provider.script_command(
            "npm run build",
            ScriptedCommand::Fail {
                exit_code: 1,
                stdout: String::new(),
                stderr: "Type error".into(),
            },
        );
        let sandbox = provider.create("t").await.unwrap();
        assert!(matches!(
            sandbox.run_command("npm run build").await,
            Err(SandboxError::CommandFailed { exit_code: 1, .. })
        ));
        assert_eq!(provider.command_log(), vec!["npm run build".to_string()]);
    }

    #[tokio::test]
    async fn test_files_are_visible_through_reconnect() {
        let provider = MemorySandboxProvider::new();
        let id = provider.create("t").await.unwrap().id().to_string();
        provider
            .connect(&id)
            .await
            .unwrap()
            .write_file("/home/user/a.txt", "A")
            .await
            .unwrap();
        assert_eq!(provider.files(&id).get("a.txt").map(String::as_str), Some("A"));
    }

    #[tokio::test]
    async fn test_fail_create() {
        let provider = MemorySandboxProvider::new();
        provider.fail_create("quota exceeded");
        assert!(matches!(
            provider.create("t").await,
            Err(SandboxError::CreateFailed { .. })
        ));
        assert_eq!(provider.create_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_next_creates_recovers() {
        let provider = MemorySandboxProvider::new();
        provider.fail_next_creates("transient 503", 1);
        assert!(provider.create("t").await.is_err());
        let sandbox = provider.create("t").await.unwrap();
        assert_eq!(sandbox.id(), "mem-1");
        assert_eq!(provider.create_attempts(), 2);
        assert_eq!(provider.create_count(), 1);
    }
}
