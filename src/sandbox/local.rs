use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    CommandOutput, Deadlines, Sandbox, SandboxProvider, command_timed_out, normalize_path,
    preview_host,
};
use crate::config::SandboxConfig;
use crate::errors::SandboxError;

/// Directory-backed sandboxes under `root_dir/<id>`, commands run through `sh -c`.
///
/// The template is resolved as a directory under `root_dir/templates/<template>`;
/// when it exists its contents seed the new sandbox, otherwise the sandbox
/// starts empty.
pub struct LocalSandboxProvider {
    config: SandboxConfig,
    deadlines: Deadlines,
}

impl LocalSandboxProvider {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            deadlines: Deadlines::default(),
        }
    }

    fn sandbox_dir(&self, id: &str) -> PathBuf {
        self.config.root_dir.join(id)
    }

    async fn reap_expired(&self) {
        for id in self.deadlines.take_expired() {
            let dir = self.sandbox_dir(&id);
            info!(sandbox_id = %id, "Reclaiming expired local sandbox");
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(sandbox_id = %id, error = %e, "Failed to remove expired sandbox directory");
            }
        }
    }

    fn handle(&self, id: &str) -> Arc<dyn Sandbox> {
        Arc::new(LocalSandbox {
            id: id.to_string(),
            dir: self.sandbox_dir(id),
            command_timeout: Duration::from_secs(self.config.command_timeout_secs),
            preview_domain: self.config.preview_domain.clone(),
            deadlines: self.deadlines.clone(),
        })
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn create(&self, template: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        self.reap_expired().await;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let dir = self.sandbox_dir(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SandboxError::CreateFailed {
                template: template.to_string(),
                message: e.to_string(),
            })?;

        let template_dir = self.config.root_dir.join("templates").join(template);
        if template_dir.is_dir() {
            let (src, dst) = (template_dir.clone(), dir.clone());
            tokio::task::spawn_blocking(move || copy_dir(&src, &dst))
                .await
                .map_err(|e| SandboxError::Provider(e.to_string()))?
                .map_err(|e| SandboxError::CreateFailed {
                    template: template.to_string(),
                    message: e.to_string(),
                })?;
        } else {
            debug!(template, "No local template directory, starting empty");
        }

        self.deadlines
            .set(&id, Duration::from_secs(self.config.timeout_secs));
        info!(sandbox_id = %id, template, "Created local sandbox");
        Ok(self.handle(&id))
    }

    async fn connect(&self, id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        self.reap_expired().await;
        if !self.sandbox_dir(id).is_dir() {
            return Err(SandboxError::NotFound { id: id.to_string() });
        }
        Ok(self.handle(id))
    }
}

pub struct LocalSandbox {
    id: String,
    dir: PathBuf,
    command_timeout: Duration,
    preview_domain: String,
    deadlines: Deadlines,
}

impl LocalSandbox {
    fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        Ok(self.dir.join(normalize_path(path)?))
    }

    fn ensure_alive(&self) -> Result<(), SandboxError> {
        if self.deadlines.is_expired(&self.id) {
            return Err(SandboxError::NotFound {
                id: self.id.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
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
        let budget = self.deadlines.command_budget(&self.id, self.command_timeout);
        debug!(sandbox_id = %self.id, command, budget_secs = budget.as_secs(), "Running command");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can stop everything the shell started.
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        let mut child = cmd.spawn()?;

        let stdout = Captured::default();
        let stderr = Captured::default();
        let readers = [
            child.stdout.take().map(|pipe| stdout.drain(pipe)),
            child.stderr.take().map(|pipe| stderr.drain(pipe)),
        ];

        let status = match tokio::time::timeout(budget, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(sandbox_id = %self.id, command, budget_secs = budget.as_secs(), "Command timed out");
                kill_process_group(&mut child).await;
                for reader in readers.into_iter().flatten() {
                    reader.abort();
                }
                return Err(command_timed_out(budget, stdout.text(), stderr.text()));
            }
        };

        // Background children may keep the pipes open; do not wait on them.
        for mut reader in readers.into_iter().flatten() {
            if tokio::time::timeout(Duration::from_secs(1), &mut reader).await.is_err() {
                debug!(sandbox_id = %self.id, "Output pipe still open after exit");
                reader.abort();
            }
        }

        let (stdout, stderr) = (stdout.text(), stderr.text());
        let exit_code = status.code().map(i64::from).unwrap_or(-1);
        if !status.success() {
            return Err(SandboxError::CommandFailed {
                exit_code,
                stdout,
                stderr,
            });
        }
        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| SandboxError::FileOperation {
                path: path.to_string(),
                message: e.to_string(),
            })
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.ensure_alive()?;
        let full = self.resolve(path)?;
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SandboxError::FileNotFound {
                    path: path.to_string(),
                },
                _ => SandboxError::FileOperation {
                    path: path.to_string(),
                    message: e.to_string(),
                },
            })
    }

    async fn remove_file(&self, path: &str) -> Result<(), SandboxError> {
        self.ensure_alive()?;
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::FileOperation {
                path: path.to_string(),
                message: e.to_string(),
            }),
        }
    }

    fn get_host(&self, port: u16) -> String {
        preview_host(port, &self.id, &self.preview_domain)
    }
}

/// Output collected from a pipe as it arrives, readable at any point.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn drain<R>(&self, mut pipe: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = self.clone();
        tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if let Ok(mut data) = buf.0.lock() {
                            data.extend_from_slice(&chunk[..n]);
                        }
                    }
                }
            }
        })
    }

    fn text(&self) -> String {
        self.0
            .lock()
            .map(|data| String::from_utf8_lossy(&data).to_string())
            .unwrap_or_default()
    }
}

/// Kill the shell and everything in its process group.
async fn kill_process_group(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let group = format!("-{}", pid);
            let result = Command::new("kill")
                .args(["-KILL", "--", group.as_str()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = result {
                warn!(pid, error = %e, "Failed to kill command process group");
            }
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Command already exited");
    }
}

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
