//! cysploit entry point
//!
//! Parses the command line, loads configuration, starts logging and hands over to the
//! selected surface.
//!
//! Licensed under the MIT License (https://opensource.org/licenses/MIT)

use anyhow::Result;
use clap::Parser;
use cysploit::{cli::Cli, config::AppConfig, core::Application, logging};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(message) = cli.validate() {
        eprintln!("error: {}", message);
        std::process::exit(2);
    }

    let mut config = AppConfig::load(&cli.config_path).await?;
    cli.apply_overrides(&mut config);

    // Held until exit so buffered file output is flushed
    let _guard = logging::init_logging_with_config(&config.logging)?;
    info!("Starting cysploit {}", env!("CARGO_PKG_VERSION"));

    let mut app = Application::new(config).await?;
    app.run(cli).await?;

    info!("Application completed successfully");
    Ok(())
}
