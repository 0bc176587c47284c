//! Event consumer entry point: `metaroot-consumer <role-key>`.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use metaroot::config::{ConfigFile, RoleKey};
use metaroot::transport::Consumer;
use metaroot::{logging, Registry};

#[derive(Parser)]
#[command(name = "metaroot-consumer", about = "Consume administration events for one role")]
struct Cli {
    /// Configuration section naming this consumer's queue and handler.
    role_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };

    let role = RoleKey::try_new(cli.role_key)?;
    let config = ConfigFile::discover()?.section(&role)?;
    logging::init(&config)?;
    info!(role = %role, "starting consumer");

    let registry = Registry::with_defaults();
    let handler = registry.handler(&config.handler_class()?, &config).await?;
    let mut consumer = Consumer::new(&config, handler)?;
    consumer.run().await?;

    info!("consumer stopped");
    Ok(())
}
