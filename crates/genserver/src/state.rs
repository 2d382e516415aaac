use std::sync::Arc;

use anyhow::Context;

use crate::{
    batch::BatchOrchestrator,
    config::Config,
    history::{HistoryBackend, HistoryStore, SqliteHistory},
    tasks::TaskTracker,
    upstream::{http_client, GeminiClient, ImageGenerator, SeedanceClient, VideoUpstream},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub tracker: TaskTracker,
    pub history: Arc<HistoryStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        generator: Arc<dyn ImageGenerator>,
        video: Arc<dyn VideoUpstream>,
        history: Arc<dyn HistoryBackend>,
    ) -> Self {
        let orchestrator =
            BatchOrchestrator::new(generator, config.batch_concurrency, config.max_batch_size);
        let history = HistoryStore::new(history, config.history_max_evictions);
        Self {
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
            tracker: TaskTracker::new(video),
            history: Arc::new(history),
        }
    }

    /// Wire the real upstream clients and the SQLite history under `data_dir`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create DATA_DIR at {}", config.data_dir.display())
        })?;

        let db_path = config.data_dir.join("genserver.sqlite3");
        let history = SqliteHistory::open(&db_path, config.history_quota_bytes)?;
        tracing::info!(db_path = %db_path.display(), quota_bytes = config.history_quota_bytes, "history store ready");

        let client = http_client(config.upstream_timeout)?;
        let gemini = GeminiClient::new(
            client.clone(),
            config.gemini_base_url.clone(),
            config.gemini_model.clone(),
        );
        let seedance = SeedanceClient::new(client, config.seedance_base_url.clone());

        Ok(Self::new(
            config,
            Arc::new(gemini),
            Arc::new(seedance),
            Arc::new(history),
        ))
    }
}
