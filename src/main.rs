use std::sync::Arc;

use sharevault::config::Config;
use sharevault::{app, db, logging, ShareVault};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("sharevault: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    logging::init(&config.logging);
    config.validate()?;

    let conn = db::establish_connection(&config.database.path)?;
    let vault = ShareVault::from_config(&config, conn)?;
    tracing::info!(
        upload_root = %vault.storage().root().display(),
        database = %config.database.path,
        "application startup"
    );

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr.as_str()).await?;
    tracing::info!(addr = %config.server.bind_addr, "server listening");
    axum::serve(listener, app(Arc::new(vault))).await?;
    Ok(())
}
