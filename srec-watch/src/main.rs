use std::sync::Arc;

use srec_watch::app::AppState;
use srec_watch::capture::FfmpegCommandBuilder;
use srec_watch::config::AppSettings;
use srec_watch::handler::HttpResolverFactory;
use srec_watch::recorder::{JsonFileStore, Recorder};
use srec_watch::{logging, panic_hook};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let settings = AppSettings::load_from_env()?;

    let (logging_config, _guard) = logging::init_logging(&settings.log_dir)?;
    panic_hook::install(&settings.log_dir);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        output_dir = %settings.output_dir.display(),
        "srec-watch starting"
    );

    let resolvers = Arc::new(HttpResolverFactory::from_settings(&settings)?);
    let builder = Arc::new(FfmpegCommandBuilder::from_settings(&settings));
    let store = Arc::new(JsonFileStore::new(settings.entries_path()));

    let state = AppState::new(settings, resolvers)?;
    logging_config.start_retention_cleanup(state.settings.log_retention_days, state.cancel.child_token());
    state.start();

    let recorder = Recorder::new(state.clone(), builder, store);
    recorder.load().await?;

    let scheduler = {
        let recorder = recorder.clone();
        let cancel = state.cancel.child_token();
        tokio::spawn(async move { recorder.run(cancel).await })
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    recorder.shutdown().await;
    if let Err(e) = scheduler.await {
        error!(error = %e, "Scheduler task failed");
    }

    info!("srec-watch stopped");
    Ok(())
}
