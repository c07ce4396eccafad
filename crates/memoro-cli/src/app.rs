// CLI assembly: config, local store, event bus, remote client, sync engine,
// and AI router, built once per invocation. A quick health call primes the
// online flag so the first command already knows whether to queue.

use memoro_core::ai::AiRouter;
use memoro_core::bus::EventBus;
use memoro_core::config::Config;
use memoro_core::error::Result;
use memoro_core::remote::RemoteMemoryClient;
use memoro_core::rpc::OnlineState;
use memoro_core::store::TaskStore;
use memoro_core::sync::SyncEngine;
use memoro_core::Ctx;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub struct App {
    pub config: Config,
    pub repository: String,
    pub store: Arc<TaskStore>,
    pub bus: Arc<EventBus>,
    pub engine: Arc<SyncEngine>,
    pub router: Arc<AiRouter>,
    pub online: Arc<OnlineState>,
    pub remote: Arc<RemoteMemoryClient>,
}

impl App {
    pub async fn build(config_path: Option<&Path>, repository: Option<String>) -> Result<App> {
        let default_path = dirs::config_dir().map(|d| d.join("memoro").join("config.toml"));
        let config = Config::load(config_path.or(default_path.as_deref()))?;

        let repository = repository.unwrap_or_else(current_dir_repository);

        let store = Arc::new(TaskStore::open(&config.db_path()?)?);
        let bus = Arc::new(EventBus::new(Some(Arc::clone(&store)), config.bus.clone()));
        let online = Arc::new(OnlineState::new());

        let endpoint = format!("{}/mcp", config.server_url.trim_end_matches('/'));
        let remote = Arc::new(RemoteMemoryClient::new(
            endpoint,
            config.retry.clone(),
            config.breaker.clone(),
            config.pool.clone(),
            Arc::clone(&online),
        ));

        // Prime the online flag; a short failed probe just leaves us queuing
        let probe = Ctx::with_timeout(Duration::from_secs(2));
        let _ = remote.health(&probe).await;

        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            Arc::clone(&bus),
            config.sync.clone(),
        ));

        let router = Arc::new(AiRouter::from_configs(
            config.providers.clone(),
            config.retry.clone(),
            config.breaker.clone(),
            Arc::clone(&store),
            Arc::clone(&bus),
            &config.ai,
        ));

        Ok(App { config, repository, store, bus, engine, router, online, remote })
    }
}

/// Repository name from the working directory; the git-detection layer is
/// out of scope and plugs in here.
fn current_dir_repository() -> String {
    std::env::current_dir()
        .ok()
        .and_then(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "default".into())
}
