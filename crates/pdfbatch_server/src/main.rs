use anyhow::Context;
use engine_logging::{engine_info, engine_warn};
use pdfbatch_engine::ensure_output_dir;
use pdfbatch_server::{serve, AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::load().context("loading configuration")?;
    if !engine_logging::initialize(
        config.log_destination,
        config.level_filter()?,
        &config.log_file,
    ) {
        eprintln!("Logging is disabled: no log sink could be installed");
    }

    ensure_output_dir(&config.temp_root)
        .with_context(|| format!("creating temp root {:?}", config.temp_root))?;
    let state = AppState::from_config(&config).context("starting engine")?;

    // Leftovers from a previous run.
    match state.orchestrator.cleanup(state.cleanup_max_age) {
        Ok(report) if report.temp_entries > 0 || report.progress_records > 0 => engine_info!(
            "Startup cleanup removed {} temp entries and {} progress records",
            report.temp_entries,
            report.progress_records
        ),
        Ok(_) => {}
        Err(err) => engine_warn!("Startup cleanup failed: {}", err),
    }

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    engine_info!("Listening on http://{}", addr);
    serve(listener, state).await?;
    Ok(())
}
