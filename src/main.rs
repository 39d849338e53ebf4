use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app;
mod cli;
mod config;
mod llm;
mod session;
mod utils;

use cli::Cli;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.debug) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = dotenv {
        tracing::debug!("No .env file found or error loading it: {}", e);
    }

    // Exit explicitly: a stdin reader blocked in the background must not
    // keep the runtime alive after the session has been saved
    let code = match cli.execute().await {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

fn init_logging(debug: bool) -> Result<()> {
    let default_level = if debug { "chatkeep=debug" } else { "chatkeep=info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;

    Ok(())
}
