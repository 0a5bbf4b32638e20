//! HTTP server command: `vibe serve`.

use anyhow::Result;
use vibe::config::VibeConfig;

pub async fn cmd_serve(mut config: VibeConfig, port: Option<u16>, dev: bool) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    config.server.dev_mode |= dev;
    vibe::server::start_server(config).await
}
