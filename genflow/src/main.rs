use std::sync::Arc;

use genflow::accounts::{
    AccountPool, CommandCredentialProvider, CredentialProvider, UnconfiguredCredentialProvider,
};
use genflow::api::{ApiServer, AppState};
use genflow::artifacts::{ArtifactService, DefaultArtifactFetcher};
use genflow::config::{AppConfig, SettingsService};
use genflow::database::{
    self,
    repositories::{SqlxAccountRepository, SqlxSettingsRepository, SqlxTaskRepository},
};
use genflow::executor::ExecutorRegistry;
use genflow::logging::init_logging;
use genflow::manager::TaskManager;
use genflow::queue::TaskQueue;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;

    // Keep the guard alive until exit so buffered log lines are flushed
    let (logging_config, _log_guard) =
        init_logging(&config.log_dir, config.log_retention_days)?;

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let credentials: Arc<dyn CredentialProvider> = {
        let provider = CommandCredentialProvider::new(config.credential_commands.clone());
        if provider.is_empty() {
            warn!("No credential commands configured; login and cookie refresh are disabled");
            Arc::new(UnconfiguredCredentialProvider)
        } else {
            Arc::new(provider)
        }
    };

    let executors = ExecutorRegistry::from_commands(
        &config.executors,
        config.manager.workers.task_timeout_secs,
    );
    if executors.kinds().is_empty() {
        warn!("No pipeline executors configured; claimed tasks will fail");
    }

    let queue = Arc::new(TaskQueue::new(Arc::new(SqlxTaskRepository::new(pool.clone()))));
    let accounts = Arc::new(AccountPool::new(
        Arc::new(SqlxAccountRepository::new(pool.clone())),
        credentials,
        config.accounts.clone(),
    ));
    let settings = Arc::new(SettingsService::new(Arc::new(SqlxSettingsRepository::new(
        pool.clone(),
    ))));
    let manager = Arc::new(TaskManager::new(
        config.manager.clone(),
        queue.clone(),
        accounts,
        executors,
        settings.clone(),
    ));
    let artifacts = Arc::new(ArtifactService::new(
        queue,
        Arc::new(DefaultArtifactFetcher::new(config.output_dir.clone())?),
    ));

    // Return tasks and accounts left in flight by a previous process
    manager.recover().await?;

    logging_config.apply_persisted_filter(&settings).await;
    let background = CancellationToken::new();
    logging_config.start_retention_cleanup(background.child_token());

    let state = AppState::new(manager.clone(), artifacts).with_logging_config(logging_config);
    let server = Arc::new(ApiServer::new(config.api.clone(), state));

    let shutdown_server = server.clone();
    let shutdown_manager = manager.clone();
    let shutdown_background = background.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        if let Err(e) = shutdown_manager.stop().await {
            error!("Failed to stop task manager: {}", e);
        }
        shutdown_background.cancel();
        shutdown_server.shutdown();
    });

    server.run().await?;

    // The server can also exit on its own; make sure workers are down
    if let Err(e) = manager.stop().await {
        error!("Failed to stop task manager: {}", e);
    }
    background.cancel();
    pool.close().await;

    info!("genflow shut down");
    Ok(())
}
