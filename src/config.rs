//! Layered configuration for Vibe.
//!
//! Values come from `.vibe/vibe.toml` (optional), then environment variables,
//! then CLI flags applied by the caller.
//!
//! ```toml
//! [server]
//! port = 8080
//! db_path = ".vibe/vibe.db"
//!
//! [agent]
//! model = "gpt-4.1"
//! temperature = 0.1
//! max_iter = 15
//! history_limit = 10
//! summary_model = "gpt-4o"
//!
//! [sandbox]
//! backend = "docker"
//! template = "vibe-nextjs"
//! timeout_secs = 1200
//! command_timeout_secs = 60
//!
//! [github]
//! commit_message = "Update from Vibe"
//!
//! [logging]
//! format = "json"
//! dir = ".vibe/logs"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VibeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Bind on all interfaces and allow any CORS origin.
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
        }
    }
}

/// Model and loop settings for the code agent and the post-run generators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Kept low so code generation is reproducible across runs.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_iter")]
    pub max_iter: u32,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_summary_model")]
    pub summary_model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_iter: default_max_iter(),
            history_limit: default_history_limit(),
            summary_model: default_summary_model(),
            base_url: default_base_url(),
            api_key: None,
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    /// Directory-backed sandbox running commands as local processes.
    #[default]
    Local,
    /// One Docker container per sandbox.
    Docker,
}

impl std::str::FromStr for SandboxBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(SandboxBackend::Local),
            "docker" => Ok(SandboxBackend::Docker),
            _ => anyhow::bail!("Invalid sandbox backend '{}'. Valid values: local, docker", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub backend: SandboxBackend,
    /// Template id for the local backend, image name for Docker.
    #[serde(default = "default_template")]
    pub template: String,
    /// Idle timeout after which the sandbox is reclaimed.
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,
    /// Longest a single command may run. The sandbox deadline caps it further.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Where the local backend creates sandbox directories.
    #[serde(default = "default_sandbox_root")]
    pub root_dir: PathBuf,
    /// Port the generated app listens on inside the sandbox.
    #[serde(default = "default_preview_port")]
    pub preview_port: u16,
    /// Domain suffix used to build the externally reachable host.
    #[serde(default = "default_preview_domain")]
    pub preview_domain: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::default(),
            template: default_template(),
            timeout_secs: default_sandbox_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            root_dir: default_sandbox_root(),
            preview_port: default_preview_port(),
            preview_domain: default_preview_domain(),
            memory: default_memory(),
            cpus: default_cpus(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_github_api_base")]
    pub api_base: String,
    /// Token used for automatic pushes after a successful run.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    #[serde(default = "default_commit_message")]
    pub commit_message: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: default_github_api_base(),
            token: None,
            commit_message: default_commit_message(),
        }
    }
}

/// Retry policy applied by the dispatcher when a workflow invocation fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// When set, logs are also written to a daily rolling file in this directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Overrides `RUST_LOG` when present.
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_port() -> u16 {
    8080
}
fn default_db_path() -> PathBuf {
    PathBuf::from(".vibe/vibe.db")
}
fn default_model() -> String {
    "gpt-4.1".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_iter() -> u32 {
    15
}
fn default_history_limit() -> usize {
    10
}
fn default_summary_model() -> String {
    "gpt-4o".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_template() -> String {
    "vibe-nextjs".to_string()
}
fn default_sandbox_timeout_secs() -> u64 {
    20 * 60
}
fn default_command_timeout_secs() -> u64 {
    60
}
fn default_sandbox_root() -> PathBuf {
    PathBuf::from(".vibe/sandboxes")
}
fn default_preview_port() -> u16 {
    3000
}
fn default_preview_domain() -> String {
    "localhost".to_string()
}
fn default_memory() -> String {
    "4g".to_string()
}
fn default_cpus() -> f64 {
    2.0
}
fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}
fn default_commit_message() -> String {
    "Update from Vibe".to_string()
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1000
}

impl VibeConfig {
    /// Load `.vibe/vibe.toml` from `project_dir` and apply environment overrides.
    /// Missing file means defaults.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut config = Self::load_file(project_dir)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load only the TOML file, without environment overrides.
    pub fn load_file(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(".vibe").join("vibe.toml");
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Anchor relative paths (database, sandbox root, log dir) at `project_dir`.
    pub fn resolve_paths(&mut self, project_dir: &Path) {
        let anchor = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = project_dir.join(&*path);
            }
        };
        anchor(&mut self.server.db_path);
        anchor(&mut self.sandbox.root_dir);
        if let Some(dir) = self.logging.dir.as_mut() {
            anchor(dir);
        }
    }

    /// Apply overrides from an environment lookup. Takes a closure so tests
    /// don't have to mutate the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.agent.api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.agent.base_url = url;
        }
        if let Some(model) = lookup("VIBE_MODEL") {
            self.agent.model = model;
        }
        if let Some(path) = lookup("VIBE_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(port) = lookup("VIBE_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid VIBE_PORT '{}'", port))?;
        }
        if let Some(backend) = lookup("VIBE_SANDBOX_BACKEND") {
            self.sandbox.backend = backend.parse()?;
        }
        if let Some(token) = lookup("GITHUB_TOKEN") {
            self.github.token = Some(token);
        }
        Ok(())
    }
}
