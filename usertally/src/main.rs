use std::error::Error;

use tracing::{error, info};

mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = usertally_core::Settings::load()
        .map_err(|e| format!("Loading settings from the environment: {e:?}"))?;

    info!(?settings, "Starting usertally");
    usertally_core::run(settings)
        .await
        .map_err(|e| format!("Error running the engine: {e:?}"))?;

    Ok(())
}
