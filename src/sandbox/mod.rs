//! Ephemeral execution environments the code agent works in.
//!
//! A `SandboxProvider` creates sandboxes and re-opens them by id; a `Sandbox`
//! exposes the command and filesystem surface the tools need. Every stage of
//! a run that touches the sandbox reconnects by id instead of holding a handle
//! across stage boundaries.
//!
//! | Backend  | Module   | Isolation                               |
//! |----------|----------|-----------------------------------------|
//! | `local`  | `local`  | directory per sandbox, `sh -c` processes |
//! | `docker` | `docker` | container per sandbox via bollard        |
//! | memory   | `memory` | in-process map, for tests and dry runs   |

pub mod docker;
pub mod local;
pub mod memory;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{SandboxBackend, SandboxConfig};
use crate::errors::SandboxError;

/// Home directory the agent's relative paths resolve against.
pub const SANDBOX_HOME: &str = "/home/user";

/// Serializable reference to a provisioned sandbox. This is what crosses
/// stage boundaries, never the live handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRef {
    pub id: String,
    pub template: String,
}

/// Exit code reported for a command stopped at its time limit, as `timeout(1)` does.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// The `CommandFailed` error for a command stopped after `limit`, keeping
/// whatever output it produced before that.
pub fn command_timed_out(limit: Duration, stdout: String, mut stderr: String) -> SandboxError {
    if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
    }
    stderr.push_str(&format!("Command timed out after {}s", limit.as_secs_f64()));
    SandboxError::CommandFailed {
        exit_code: TIMEOUT_EXIT_CODE,
        stdout,
        stderr,
    }
}

/// Captured output of a successful command. Failures surface as
/// `SandboxError::CommandFailed` carrying the same buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Reset the idle timeout, measured from now.
    async fn set_timeout(&self, timeout: Duration) -> Result<(), SandboxError>;

    /// Run a shell command in the sandbox home directory.
    async fn run_command(&self, command: &str) -> Result<CommandOutput, SandboxError>;

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;

    async fn read_file(&self, path: &str) -> Result<String, SandboxError>;

    async fn remove_file(&self, path: &str) -> Result<(), SandboxError>;

    /// Externally reachable host name for a port inside the sandbox.
    fn get_host(&self, port: u16) -> String;
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, template: &str) -> Result<Arc<dyn Sandbox>, SandboxError>;

    /// Re-open an existing sandbox. Expired sandboxes are reported as `NotFound`.
    async fn connect(&self, id: &str) -> Result<Arc<dyn Sandbox>, SandboxError>;
}

/// Build the provider selected by configuration.
pub fn provider_from_config(config: &SandboxConfig) -> Result<Arc<dyn SandboxProvider>, SandboxError> {
    match config.backend {
        SandboxBackend::Local => Ok(Arc::new(local::LocalSandboxProvider::new(config.clone()))),
        SandboxBackend::Docker => Ok(Arc::new(docker::DockerSandboxProvider::new(config.clone())?)),
    }
}

/// Host name scheme shared by all backends: `<port>-<id>.<domain>`.
pub fn preview_host(port: u16, id: &str, domain: &str) -> String {
    format!("{}-{}.{}", port, id, domain)
}

/// Idle deadlines per sandbox id, shared between a provider and its handles.
#[derive(Clone, Default)]
pub struct Deadlines {
    inner: Arc<Mutex<HashMap<String, Instant>>>,
}

impl Deadlines {
    pub fn set(&self, id: &str, timeout: Duration) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(id.to_string(), Instant::now() + timeout);
        }
    }

    /// Time left before `id` expires, `None` when no deadline is set.
    pub fn remaining(&self, id: &str) -> Option<Duration> {
        let map = self.inner.lock().ok()?;
        map.get(id)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// How long a command started now may run: `limit`, cut short by the deadline.
    pub fn command_budget(&self, id: &str, limit: Duration) -> Duration {
        self.remaining(id).map_or(limit, |left| left.min(limit))
    }

    pub fn is_expired(&self, id: &str) -> bool {
        self.inner
            .lock()
            .map(|map| map.get(id).is_some_and(|deadline| Instant::now() >= *deadline))
            .unwrap_or(false)
    }

    /// Remove and return every expired id.
    pub fn take_expired(&self) -> Vec<String> {
        let Ok(mut map) = self.inner.lock() else {
            return Vec::new();
        };
        let now = Instant::now();
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            map.remove(id);
        }
        expired
    }

    pub fn remove(&self, id: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(id);
        }
    }
}

/// Normalize an agent-supplied path to a path relative to the sandbox home.
///
/// Accepts `app/page.tsx`, `./app/page.tsx` and `/home/user/app/page.tsx`.
/// Rejects anything that would climb out of the home directory.
pub fn normalize_path(path: &str) -> Result<PathBuf, SandboxError> {
    let trimmed = if path == SANDBOX_HOME {
        ""
    } else {
        path.strip_prefix(SANDBOX_HOME)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or_else(|| path.trim_start_matches('/'))
    };

    let mut normalized = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::PathEscape(path.to_string()));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(SandboxError::FileOperation {
            path: path.to_string(),
            message: "empty path".to_string(),
        });
    }
    Ok(normalized)
}
