use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use make_best::{chat, constants, credentials, web_server, Pipeline};

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Env file holding the API key (read before the process environment).
    #[arg(long, global = true, env = "MAKE_BEST_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Name of the variable holding the API key.
    #[arg(long, global = true, env = "MAKE_BEST_KEY_NAME", default_value = constants::DEFAULT_KEY_NAME)]
    key_name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the web UI.
    Start {
        #[arg(long, default_value_t = 9900, help = "Port for the web server.")]
        port: u16,
    },
    /// Chat in the terminal. Type 'quit' to leave.
    Chat,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for environment variables like API keys)
    dotenvy::dotenv().ok();

    // Reads log level from RUST_LOG environment variable (e.g., RUST_LOG=info,make_best=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    info!("make-best starting with command: {:?}", cli.command);

    let api_key = credentials::load_api_key(cli.env_file.as_deref(), &cli.key_name);
    let pipeline = Pipeline::from_api_key(api_key);

    match cli.command {
        Commands::Start { port } => {
            info!("Starting web UI on port {}...", port);
            let server = web_server::start_web_server(port, pipeline);
            tokio::select! {
                res = server => {
                    if let Err(e) = &res {
                        error!("Web server failed: {:?}", e);
                    }
                    res?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl-C received, shutting down...");
                }
            }
            info!("Shutdown complete.");
        }
        Commands::Chat => {
            chat::run_chat(pipeline)
                .await
                .context("Chat session failed")?;
        }
    }

    Ok(())
}
