use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use flowrelay_server::AppConfig;

/// Backend for the flow editor: flow storage plus live update relay.
#[derive(Debug, Parser)]
#[command(name = "flowrelay", version)]
struct Cli {
    /// JSON config file, deep-merged over defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Allowed CORS origin. Repeat for several; "*" allows any.
    #[arg(long = "allowed-origin")]
    allowed_origins: Vec<String>,

    /// Do not relay a flowUpdate back to the client that sent it.
    #[arg(long)]
    exclude_sender: bool,

    /// Answer unknown flow ids with 404 instead of 200.
    #[arg(long)]
    strict_not_found: bool,

    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(self, config: &mut AppConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if !self.allowed_origins.is_empty() {
            config.server.allowed_origins = self.allowed_origins;
        }
        if self.exclude_sender {
            config.server.echo_to_sender = false;
        }
        if self.strict_not_found {
            config.server.strict_not_found = true;
        }
        if let Some(level) = self.log_level {
            config.telemetry.log_level = level;
        }
        if self.json_logs {
            config.telemetry.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = flowrelay_server::load_config(cli.config.as_deref())
        .context("Failed to load configuration")?;
    cli.apply(&mut config);

    flowrelay_telemetry::init_telemetry(&config.telemetry)
        .context("Failed to initialize logging")?;

    tracing::info!(
        echo_to_sender = config.server.echo_to_sender,
        strict_not_found = config.server.strict_not_found,
        "Starting flowrelay"
    );

    let handle = flowrelay_server::start(config.server)
        .await
        .context("Failed to start server")?;

    tracing::info!(addr = %handle.local_addr(), "flowrelay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    handle.shutdown().await;
    tracing::info!("Shut down");
    Ok(())
}
