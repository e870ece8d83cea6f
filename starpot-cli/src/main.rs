mod commands;
mod config;

use clap::{Parser, Subcommand};
use config::CliConfig;
use starpot_core::{AnonymousIdentity, IdentityProvider, SqliteStore, StarpotError, StaticIdentity};
use starpot_lottery::{LotteryConfig, LotteryError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "starpot")]
#[command(about = "Starpot - a shared lottery round any number of clients can join")]
#[command(version)]
struct Cli {
    /// Data directory for the round store and identity
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Act as this identity instead of the device's anonymous one
    #[arg(short, long, global = true)]
    identity: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Round commands
    #[command(subcommand)]
    Round(commands::RoundCommands),

    /// Follow the round live
    Watch {
        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },

    /// Run a full round with concurrent in-memory clients
    Simulate {
        /// Number of clients
        #[arg(short, long, default_value_t = 5)]
        clients: usize,
        /// Entry fee, e.g. 0.005
        #[arg(short, long)]
        fee: Option<starpot_core::Amount>,
        /// Seed for the draw
        #[arg(short, long)]
        seed: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "starpot={},starpot_core={},starpot_lottery={}",
            log_level, log_level, log_level
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(config::default_data_dir);
    tokio::fs::create_dir_all(&data_dir).await?;

    let cli_config = CliConfig::load(&data_dir)?;
    let lottery_config = cli_config.lottery();

    let result = match cli.command {
        Commands::Round(cmd) => {
            let session = open_session(&data_dir, cli.identity, lottery_config).await?;
            commands::handle_round_command(cmd, &session).await
        }
        Commands::Watch { seconds } => {
            let session = open_session(&data_dir, cli.identity, lottery_config).await?;
            commands::handle_watch_command(seconds, &session).await
        }
        Commands::Simulate {
            clients,
            fee,
            seed,
        } => commands::handle_simulate_command(clients, fee, seed, lottery_config).await,
    };

    if let Err(e) = result {
        match e {
            LotteryError::FeeMismatch { expected, offered } => {
                eprintln!("Error: Wrong entry fee");
                eprintln!("Round charges {}, you offered {}", expected, offered);
            }
            LotteryError::AuthFailure(reason) => {
                eprintln!("Error: No usable identity: {}", reason);
                eprintln!("Pass --identity or set STARPOT_IDENTITY");
            }
            e if e.is_transient() => {
                eprintln!("Error: {}", e);
                eprintln!("The store is busy or unreachable, try again");
            }
            _ => {
                eprintln!("Error: {}", e);
            }
        }
        std::process::exit(1);
    }

    Ok(())
}

async fn open_session(
    data_dir: &Path,
    identity: Option<String>,
    lottery: LotteryConfig,
) -> Result<commands::Session, StarpotError> {
    let store = Arc::new(SqliteStore::open(&data_dir.join(config::DATABASE_FILE)).await?);
    let identity: Arc<dyn IdentityProvider> = match identity {
        Some(id) => Arc::new(StaticIdentity::new(id)),
        None => Arc::new(AnonymousIdentity::new(data_dir)),
    };
    Ok(commands::Session::new(store, identity, lottery))
}
