//! HTTP front end for the pdfbatch engine.
mod config;
mod error;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use pdfbatch_engine::{
    ArtifactRegistry, BatchDownloadEngine, EngineSettings, FetchSettings, OrchestratorConfig,
    PersistError, ProgressStore, ReqwestPdfFetcher, SessionOrchestrator,
};

pub use config::{ConfigError, ServerConfig, CONFIG_ENV, TEMP_ENV};
pub use error::ApiError;
pub use routes::router;

/// Directory under the temp root that mirrors progress records.
pub const PROGRESS_DIR: &str = ".progress";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub progress_interval: Duration,
    pub cleanup_max_age: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("http client: {0}")]
    Client(#[from] pdfbatch_engine::FetchError),
    #[error("progress store: {0}")]
    Progress(#[from] PersistError),
}

impl AppState {
    /// Wires the engine, stores and orchestrator for `config`. Must run inside
    /// a tokio runtime.
    pub fn from_config(config: &ServerConfig) -> Result<Self, StartupError> {
        let fetcher = Arc::new(ReqwestPdfFetcher::new(FetchSettings::default())?);
        let engine = BatchDownloadEngine::new(
            fetcher,
            EngineSettings {
                worker_count: config.worker_count,
                sub_batch_size: config.sub_batch_size,
            },
        );
        let progress = ProgressStore::persistent(config.temp_root.join(PROGRESS_DIR))?;
        let orchestrator = SessionOrchestrator::new(
            OrchestratorConfig {
                temp_root: config.temp_root.clone(),
                default_batch_size: config.session_batch_size,
            },
            engine,
            Arc::new(progress),
            Arc::new(ArtifactRegistry::new()),
        );
        Ok(Self {
            orchestrator,
            progress_interval: config.progress_interval(),
            cleanup_max_age: config.cleanup_max_age(),
        })
    }
}

/// Serves the API on `listener` until the process ends.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}
