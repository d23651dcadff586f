use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Courier CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the bot: poll Telegram for commands, deliver replies, serve the status endpoint.
    Run {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Status server port (default from config or 15152)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Print queue, cursor and counters from a running bot.
    Status {
        /// Config file path (default: COURIER_CONFIG_PATH or ~/.courier/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("courier {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run { config, port }) => {
            if let Err(e) = run_bot(config, port).await {
                log::error!("courier failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Status { config }) => {
            if let Err(e) = run_status(config).await {
                log::error!("status failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_bot(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!(
        "starting courier (status on {}:{})",
        config.gateway.bind,
        config.gateway.port
    );
    lib::gateway::run_gateway(config, path).await
}

async fn run_status(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    use anyhow::Context;

    let (config, _) = lib::config::load_config(config_path)?;
    let url = format!(
        "http://{}:{}/status",
        config.gateway.bind, config.gateway.port
    );
    let body: serde_json::Value = reqwest::get(&url)
        .await
        .with_context(|| format!("is courier running? GET {}", url))?
        .error_for_status()?
        .json()
        .await
        .context("parsing status response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
