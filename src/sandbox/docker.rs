use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{
    CommandOutput, Deadlines, SANDBOX_HOME, Sandbox, SandboxProvider, command_timed_out,
    normalize_path, preview_host,
};
use crate::config::SandboxConfig;
use crate::errors::SandboxError;

const LABEL_MANAGED: &str = "vibe.sandbox.managed";
const LABEL_TEMPLATE: &str = "vibe.sandbox.template";

/// One long-lived container per sandbox; the template is the image name.
pub struct DockerSandboxProvider {
    client: Docker,
    config: SandboxConfig,
    deadlines: Deadlines,
}

impl DockerSandboxProvider {
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Provider(format!("Failed to connect to Docker: {}", e)))?;
        Ok(Self {
            client,
            config,
            deadlines: Deadlines::default(),
        })
    }

    fn container_config(&self, template: &str) -> Config<String> {
        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_TEMPLATE.to_string(), template.to_string()),
        ]);
        let host_config = bollard::models::HostConfig {
            memory: parse_memory(&self.config.memory),
            nano_cpus: Some((self.config.cpus * 1_000_000_000.0) as i64),
            ..Default::default()
        };

        Config {
            image: Some(template.to_string()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(SANDBOX_HOME.to_string()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn reap_expired(&self) {
        for id in self.deadlines.take_expired() {
            info!(sandbox_id = %id, "Removing expired sandbox container");
            let options = RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            };
            if let Err(e) = self.client.remove_container(&id, Some(options)).await {
                warn!(sandbox_id = %id, error = %e, "Failed to remove expired container");
            }
        }
    }

    fn handle(&self, id: &str) -> Arc<dyn Sandbox> {
        Arc::new(DockerSandbox {
            id: id.to_string(),
            client: self.client.clone(),
            command_timeout: Duration::from_secs(self.config.command_timeout_secs),
            preview_domain: self.config.preview_domain.clone(),
            deadlines: self.deadlines.clone(),
        })
    }
}

#[async_trait]
impl SandboxProvider for DockerSandboxProvider {
    async fn create(&self, template: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        self.reap_expired().await;

        let name = format!("vibe-sbx-{}", uuid::Uuid::new_v4().simple());
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), self.container_config(template))
            .await
            .map_err(|e| SandboxError::CreateFailed {
                template: template.to_string(),
                message: e.to_string(),
            })?;

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::CreateFailed {
                template: template.to_string(),
                message: e.to_string(),
            })?;

        self.deadlines
            .set(&container.id, Duration::from_secs(self.config.timeout_secs));
        info!(sandbox_id = %container.id, %name, template, "Started sandbox container");
        Ok(self.handle(&container.id))
    }

    async fn connect(&self, id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        self.reap_expired().await;
        match self.client.inspect_container(id, None).await {
            Ok(_) => Ok(self.handle(id)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(SandboxError::NotFound { id: id.to_string() }),
            Err(e) => Err(SandboxError::Provider(e.to_string())),
        }
    }
}

pub struct DockerSandbox {
    id: String,
    client: Docker,
    command_timeout: Duration,
    preview_domain: String,
    deadlines: Deadlines,
}

impl DockerSandbox {
    fn ensure_alive(&self) -> Result<(), SandboxError> {
        if self.deadlines.is_expired(&self.id) {
            return Err(SandboxError::NotFound {
                id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Run an argv inside the container and collect both streams as text.
    async fn exec(&self, argv: Vec<String>) -> Result<CommandOutput, SandboxError> {
        let (stdout, stderr, exit_code) = self.exec_raw(argv).await?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code,
        })
    }

    /// Run an argv inside the container. A non-zero exit or a timeout is an
    /// error; on success the raw stdout and stderr bytes are returned.
    async fn exec_raw(&self, argv: Vec<String>) -> Result<(Vec<u8>, Vec<u8>, i64), SandboxError> {
        let exec_config = CreateExecOptions {
            cmd: Some(argv),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(SANDBOX_HOME.to_string()),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(&self.id, exec_config)
            .await
            .map_err(|e| SandboxError::Provider(e.to_string()))?;

        let budget = self.deadlines.command_budget(&self.id, self.command_timeout);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::Provider(e.to_string()))?
        {
            StartExecResults::Attached { mut output, .. } => {
                let collect = async {
                    while let Some(msg) = output.next().await {
                        match msg {
                            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                                stdout.extend_from_slice(&message)
                            }
                            Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                            Ok(_) => {}
                            Err(e) => return Err(SandboxError::Provider(e.to_string())),
                        }
                    }
                    Ok(())
                };
                let collected = tokio::time::timeout(budget, collect).await;
                match collected {
                    Ok(collected) => collected?,
                    Err(_) => {
                        warn!(sandbox_id = %self.id, exec_id = %exec.id, "Command timed out");
                        self.kill_exec(&exec.id).await;
                        return Err(command_timed_out(
                            budget,
                            String::from_utf8_lossy(&stdout).to_string(),
                            String::from_utf8_lossy(&stderr).to_string(),
                        ));
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(SandboxError::Provider(
                    "Exec was detached unexpectedly".to_string(),
                ));
            }
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::Provider(e.to_string()))?;
        let exit_code = reported_exit_code(&exec.id, inspect.exit_code)?;
        if exit_code != 0 {
            return Err(SandboxError::CommandFailed {
                exit_code,
                stdout: String::from_utf8_lossy(&stdout).to_string(),
                stderr: String::from_utf8_lossy(&stderr).to_string(),
            });
        }
        Ok((stdout, stderr, exit_code))
    }

    /// Best-effort kill of a still-running exec and its process group.
    async fn kill_exec(&self, exec_id: &str) {
        let pid = match self.client.inspect_exec(exec_id).await {
            Ok(inspect) => inspect.pid,
            Err(e) => {
                warn!(sandbox_id = %self.id, error = %e, "Failed to inspect timed out exec");
                return;
            }
        };
        let Some(pid) = pid else {
            return;
        };
        let kill = CreateExecOptions {
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("kill -KILL -- -{pid} 2>/dev/null || kill -KILL {pid}"),
            ]),
            ..Default::default()
        };
        let result = match self.client.create_exec(&self.id, kill).await {
            Ok(exec) => self.client.start_exec(&exec.id, None).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(sandbox_id = %self.id, pid, error = %e, "Failed to kill timed out command");
        }
    }

    fn absolute(path: &str) -> Result<String, SandboxError> {
        let relative = normalize_path(path)?;
        Ok(format!("{}/{}", SANDBOX_HOME, relative.to_string_lossy()))
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_timeout(&self, timeout: Duration) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        self.deadlines.set(&self.id, timeout);
        Ok(())
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput, SandboxError> {
        self.ensure_alive()?;
        debug!(sandbox_id = %self.id, command, "Running command in container");
        self.exec(vec!["sh".to_string(), "-c".to_string(), command.to_string()])
            .await
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        let relative = normalize_path(path)?;
        // Archive paths are relative to the upload root, so anchor at `/`.
        let archive_path = format!("{}/{}", SANDBOX_HOME.trim_start_matches('/'), relative.to_string_lossy());
        let archive = single_file_tar(&archive_path, content.as_bytes()).map_err(|e| {
            SandboxError::FileOperation {
                path: path.to_string(),
                message: e.to_string(),
            }
        })?;

        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(&self.id, Some(options), archive.into())
            .await
            .map_err(|e| SandboxError::FileOperation {
                path: path.to_string(),
                message: e.to_string(),
            })
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.ensure_alive()?;
        let absolute = Self::absolute(path)?;
        match self
            .exec_raw(vec!["cat".to_string(), "--".to_string(), absolute])
            .await
        {
            Ok((bytes, _, _)) => String::from_utf8(bytes).map_err(|e| SandboxError::FileOperation {
                path: path.to_string(),
                message: e.to_string(),
            }),
            Err(SandboxError::CommandFailed { stderr, .. }) if stderr.contains("No such file") => {
                Err(SandboxError::FileNotFound {
                    path: path.to_string(),
                })
            }
            Err(SandboxError::CommandFailed { stderr, .. }) => Err(SandboxError::FileOperation {
                path: path.to_string(),
                message: stderr.trim().to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn remove_file(&self, path: &str) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        let absolute = Self::absolute(path)?;
        self.exec(vec!["rm".to_string(), "-f".to_string(), "--".to_string(), absolute])
            .await
            .map(|_| ())
    }

    fn get_host(&self, port: u16) -> String {
        preview_host(port, &self.id, &self.preview_domain)
    }
}

/// An exec that ended without reporting an exit code is a provider fault,
/// never a success.
fn reported_exit_code(exec_id: &str, exit_code: Option<i64>) -> Result<i64, SandboxError> {
    exit_code.ok_or_else(|| {
        SandboxError::Provider(format!("Exec {} finished without an exit code", exec_id))
    })
}

/// Build an in-memory tar archive holding one regular file.
fn single_file_tar(path: &str, data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data)?;
    builder.into_inner()
}

/// Parse sizes like `512m` or `4g` into bytes.
fn parse_memory(value: &str) -> Option<i64> {
    let value = value.trim().to_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value.as_str(), 1),
    };
    digits.parse::<i64>().ok().map(|n| n * multiplier)
}
