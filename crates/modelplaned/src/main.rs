//! modelplaned: the model-serving control plane daemon.
//!
//! # Usage
//!
//! ```text
//! modelplaned run --config /etc/modelplane/modelplane.toml
//! modelplaned run --in-memory --drain-port 9007
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use modelplaned::DaemonConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,modelplaned=debug,modelplane=debug";

#[derive(Parser)]
#[command(name = "modelplaned", about = "Model-serving control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until Ctrl-C.
    Run {
        /// TOML configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Port for the drain endpoint.
        #[arg(long)]
        drain_port: Option<u16>,

        /// Keep cluster state in memory only.
        #[arg(long)]
        in_memory: bool,

        /// Emit logs as JSON lines.
        #[arg(long)]
        json_logs: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            drain_port,
            in_memory,
            json_logs,
        } => {
            let mut daemon = match &config {
                Some(path) => DaemonConfig::from_file(path)?,
                None => DaemonConfig::default(),
            };
            if let Some(dir) = data_dir {
                daemon.store.data_dir = dir;
            }
            if let Some(port) = drain_port {
                daemon.drain.port = port;
            }
            daemon.store.in_memory |= in_memory;
            daemon.logging.json |= json_logs;

            init_tracing(daemon.logging.json);
            if let Some(path) = &config {
                info!(path = ?path, "configuration loaded");
            }
            modelplaned::run(daemon).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
