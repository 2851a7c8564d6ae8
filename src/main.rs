//! Entry point: parse the command line, load config, and run the server.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use taskgate::{Config, Server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "taskgate", version, about = "Expose configured tasks as an HTTP gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway.
    Serve {
        /// Configuration file (json or yaml).
        #[arg(short, long, env = "TASKGATE_CONFIG")]
        config: PathBuf,
    },
    /// Load and validate a configuration file, then exit.
    Validate {
        #[arg(short, long, env = "TASKGATE_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => {
            let config = Config::from_file(&config)
                .map_err(|e| anyhow::anyhow!("config error: {}", e))?;

            // tasks resolve relative paths against the config directory
            std::env::set_current_dir(&config.directory)
                .map_err(|e| anyhow::anyhow!("config error: {}", e))?;

            let server = Server::new(config).map_err(|e| anyhow::anyhow!("server error: {}", e))?;
            server
                .run()
                .await
                .map_err(|e| anyhow::anyhow!("server run error: {}", e))?;
        }
        Command::Validate { config } => {
            let config = Config::from_file(&config)
                .map_err(|e| anyhow::anyhow!("config error: {}", e))?;
            let server = Server::new(config).map_err(|e| anyhow::anyhow!("config error: {}", e))?;
            println!("configuration ok: {} route(s)", server.routes().len());
        }
    }

    Ok(())
}
