//! RPC server entry point: `metaroot-server <role-key>`.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use metaroot::config::{ConfigFile, RoleKey};
use metaroot::transport::RpcServer;
use metaroot::{logging, Registry};

#[derive(Parser)]
#[command(name = "metaroot-server", about = "Serve administration requests for one role")]
struct Cli {
    /// Configuration section naming this server's queue and handler.
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
    info!(role = %role, "starting rpc server");

    let registry = Registry::with_defaults();
    let handler = registry.handler(&config.handler_class()?, &config).await?;
    let mut server = RpcServer::new(&config, handler)?;
    server.run().await?;

    info!("server stopped");
    Ok(())
}
