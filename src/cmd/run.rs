//! One-shot agent run: `vibe run <prompt>`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use vibe::agent::{ChatModel, OpenAiChatModel};
use vibe::config::VibeConfig;
use vibe::sandbox::memory::MemorySandboxProvider;
use vibe::sandbox::{SandboxProvider, provider_from_config};
use vibe::store::{DbHandle, MessageRole, MessageType};
use vibe::workflow::{
    CheckpointStore, CodeAgentWorkflow, MemoryCheckpointStore, RunEvent, SqliteCheckpointStore,
};

const CLI_USER: &str = "cli";

pub async fn cmd_run(
    config: VibeConfig,
    prompt: String,
    project_id: Option<String>,
    run_id: Option<String>,
    dry_run: bool,
) -> Result<()> {
    let model: Arc<dyn ChatModel> = Arc::new(
        OpenAiChatModel::new(&config.agent).context("OPENAI_API_KEY is not set")?,
    );

    let (db, sandboxes, checkpoints): (DbHandle, Arc<dyn SandboxProvider>, Arc<dyn CheckpointStore>) =
        if dry_run {
            (
                DbHandle::in_memory()?,
                Arc::new(MemorySandboxProvider::new()),
                Arc::new(MemoryCheckpointStore::new()),
            )
        } else {
            let db = DbHandle::open(&config.server.db_path)?;
            (
                db.clone(),
                provider_from_config(&config.sandbox)?,
                Arc::new(SqliteCheckpointStore::new(db)),
            )
        };

    let project_id = match project_id {
        Some(id) => {
            let lookup = id.clone();
            db.call(move |db| db.get_project(&lookup))
                .await?
                .with_context(|| format!("Project {} not found", id))?
                .id
        }
        None => {
            let name: String = prompt.chars().take(40).collect();
            db.call(move |db| db.create_project(CLI_USER, &name)).await?.id
        }
    };

    // A resumed run already stored its prompt.
    let run_id = match run_id {
        Some(run_id) => run_id,
        None => {
            let pid = project_id.clone();
            let content = prompt.clone();
            db.call(move |db| db.create_message(&pid, &content, MessageRole::User, MessageType::Result))
                .await?;
            uuid::Uuid::new_v4().to_string()
        }
    };
    info!(%run_id, %project_id, dry_run, "Starting one-shot run");

    let workflow = CodeAgentWorkflow::new(db, sandboxes, model, checkpoints, Arc::new(config));
    let output = workflow
        .run(
            &run_id,
            &RunEvent {
                project_id,
                value: prompt,
            },
        )
        .await?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
