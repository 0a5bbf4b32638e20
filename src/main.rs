use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "vibe")]
#[command(version, about = "AI app builder back-end: run a code agent in a sandbox and keep what it builds")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding `.vibe/` (config, database, sandboxes). Defaults to the current directory.
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API and the run dispatcher
    Serve {
        /// Port to serve on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (bind all interfaces, permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Run the code agent once and print the run output as JSON
    Run {
        /// Prompt for the agent
        prompt: String,

        /// Existing project to run against (a new one is created otherwise)
        #[arg(long)]
        project_id: Option<String>,

        /// Reuse a run id to resume from its checkpoints
        #[arg(long)]
        run_id: Option<String>,

        /// In-memory sandbox, database and checkpoints; only the model is real
        #[arg(long)]
        dry_run: bool,
    },
    /// Create the database schema and exit
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let mut config = vibe::config::VibeConfig::load(&project_dir)?;
    config.resolve_paths(&project_dir);
    let _log_guard = vibe::logging::init(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Serve { port, dev } => cmd::cmd_serve(config, port, dev).await,
        Commands::Run {
            prompt,
            project_id,
            run_id,
            dry_run,
        } => cmd::cmd_run(config, prompt, project_id, run_id, dry_run).await,
        Commands::InitDb => cmd::cmd_init_db(&config),
    }
}
