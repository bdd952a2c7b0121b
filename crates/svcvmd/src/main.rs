//! svcvmd: the svcvm daemon.
//!
//! Runs the hosting-device background loops (dead-agent sweep, agent
//! re-scan, scheduling backlog) over the redb binding store, and offers a
//! few inspection commands against the same store.
//!
//! # Usage
//!
//! ```text
//! svcvmd run --config /etc/svcvm/svcvm.toml --data-dir /var/lib/svcvm
//! svcvmd agents --data-dir /var/lib/svcvm
//! svcvmd register-agent --agent-id cfg-1 --host net-node-1
//! ```

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,svcvmd=debug,svcvm=debug";

#[derive(Parser)]
#[command(name = "svcvmd", about = "svcvm hosting-device scheduling daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the background loops until Ctrl-C.
    Run {
        /// Configuration file (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the binding store.
        #[arg(long, default_value = "/var/lib/svcvm")]
        data_dir: PathBuf,
    },

    /// Print config agents and their liveness as JSON.
    Agents {
        #[arg(long, default_value = "/var/lib/svcvm")]
        data_dir: PathBuf,
    },

    /// Print resource and hosting-device bindings as JSON.
    Bindings {
        #[arg(long, default_value = "/var/lib/svcvm")]
        data_dir: PathBuf,
    },

    /// Record a config agent heartbeat and hand it agent-less devices.
    RegisterAgent {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "/var/lib/svcvm")]
        data_dir: PathBuf,

        #[arg(long)]
        agent_id: String,

        /// Host the agent runs on.
        #[arg(long)]
        host: String,
    },
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run { config, data_dir } => {
            let config = commands::load_config(config.as_deref())?;
            commands::run(config, &data_dir).await
        }
        Command::Agents { data_dir } => {
            let report = commands::agents_report(&data_dir)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Bindings { data_dir } => {
            let report = commands::bindings_report(&data_dir)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::RegisterAgent {
            config,
            data_dir,
            agent_id,
            host,
        } => {
            let config = commands::load_config(config.as_deref())?;
            let report = commands::register_agent(config, &data_dir, &agent_id, &host).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
