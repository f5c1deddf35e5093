//! `numbox`: watch virtual-number, SMS and payment operations from a terminal.
//!
//! Mounts the operation tracker against the remote API: a countdown to the
//! operation's deadline, status polling, and a bell when a code arrives.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use numbox_core::{OperationKind, TrackerConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// numbox CLI.
#[derive(Parser, Debug)]
#[command(name = "numbox", about = "Track numbox operations from the terminal")]
struct Cli {
    /// Path to config file (default: ~/.numbox/config.toml).
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// API base URL (overrides the config file).
    #[arg(long = "api", global = true)]
    api: Option<String>,

    /// Bearer token (overrides the config file).
    #[arg(long = "token", global = true)]
    token: Option<String>,

    /// Data directory holding state.redb.
    #[arg(long = "data-dir", global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Track one operation until it resolves, expires or Ctrl-C.
    Watch {
        /// sms-wait, number-assignment, payment-confirmation or purchase-sms.
        kind: String,
        /// Operation id as issued by the server.
        id: String,
        /// Operation start in milliseconds since the epoch (default: now).
        #[arg(long)]
        created_at: Option<i64>,
    },

    /// List persisted countdowns.
    Timers,

    /// Delete long-expired countdown records now.
    Sweep,

    /// Forget the countdown of an operation.
    Stop { id: String },

    /// Delivery sound preference.
    Sound {
        #[command(subcommand)]
        action: SoundAction,
    },

    /// Config file management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show version.
    Version,
}

#[derive(Subcommand, Debug)]
enum SoundAction {
    On,
    Off,
    Toggle,
    Status,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write the effective config to the config path.
    Init,
    /// Print the effective config.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(TrackerConfig::default_path);

    let mut config = TrackerConfig::load(&config_path)?;
    let overrides: Vec<String> = [
        cli.api.map(|v| format!("--api={v}")),
        cli.token.map(|v| format!("--token={v}")),
        cli.data_dir.map(|v| format!("--data-dir={v}")),
    ]
    .into_iter()
    .flatten()
    .collect();
    config.apply_args(&overrides);

    match cli.command {
        Commands::Watch {
            kind,
            id,
            created_at,
        } => {
            let kind = OperationKind::from_str(&kind).ok_or_else(|| {
                anyhow::anyhow!(
                    "unknown operation kind {kind:?} (expected one of: {})",
                    OperationKind::ALL.map(|k| k.as_str()).join(", ")
                )
            })?;
            commands::watch::run(&config, kind, &id, created_at).await?;
        }

        Commands::Timers => commands::timers::list(&config)?,

        Commands::Sweep => commands::timers::sweep(&config)?,

        Commands::Stop { id } => commands::timers::stop(&config, &id)?,

        Commands::Sound { action } => match action {
            SoundAction::On => commands::sound::set(&config, true)?,
            SoundAction::Off => commands::sound::set(&config, false)?,
            SoundAction::Toggle => commands::sound::toggle(&config)?,
            SoundAction::Status => commands::sound::status(&config)?,
        },

        Commands::Config { action } => match action {
            ConfigAction::Init => {
                config.save(&config_path)?;
                println!("Wrote {}", config_path.display());
            }
            ConfigAction::Show => {
                print!("{}", config.to_toml()?);
            }
        },

        Commands::Version => {
            println!("numbox {}", VERSION);
        }
    }

    Ok(())
}
