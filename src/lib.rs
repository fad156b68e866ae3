pub mod appdb;
pub mod audit;
pub mod commands;
pub mod config;
pub mod db;
pub mod models;
pub mod repository;
pub mod security;

use anyhow::Context;
use std::sync::Arc;

use crate::appdb::AppDatabase;
use crate::audit::AuditService;
use crate::commands::ConnectionService;
use crate::config::AppConfig;
use crate::db::registry::ConnectionRegistry;
use crate::security::AesGcmEncryptionService;

/// Install the `env_logger` backend. `RUST_LOG` wins over `level`.
/// Safe to call more than once.
pub fn init_logging(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .try_init();
}

/// Long-lived services an HTTP layer holds on to.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<AppDatabase>,
    pub registry: Arc<ConnectionRegistry>,
    pub audits: AuditService<ConnectionRegistry>,
    pub connections: ConnectionService<ConnectionRegistry>,
}

impl AppState {
    pub fn bootstrap(config: AppConfig) -> anyhow::Result<Self> {
        init_logging(&config.log_level);
        log::debug!("Configuration: {:?}", config);

        let store = Arc::new(AppDatabase::init(config.db_path.clone())?);
        let cipher = Arc::new(
            AesGcmEncryptionService::new(&config.encryption_key)
                .context("Failed to initialise secret codec")?,
        );
        let registry = Arc::new(ConnectionRegistry::new(config.pool.clone()));

        let audits = AuditService::new(
            store.clone(),
            registry.clone(),
            store.clone(),
            store.clone(),
            cipher.clone(),
        );
        let connections = ConnectionService::new(store.clone(), registry.clone(), cipher)
            .with_default_port(config.default_port);

        let pool = registry.settings();
        log::info!(
            "Audit engine ready (store={:?}, max_open={}, max_idle={})",
            config.db_path,
            pool.max_open,
            pool.max_idle
        );

        Ok(Self {
            config,
            store,
            registry,
            audits,
            connections,
        })
    }

    /// Close every pooled SQL Server connection.
    pub async fn shutdown(&self) {
        for stats in self.registry.stats().await {
            if stats.in_use > 0 {
                log::warn!(
                    "pool {} closing with {} checkout(s) in flight",
                    stats.fingerprint,
                    stats.in_use
                );
            }
        }
        self.registry.close_all().await;
        log::info!("All SQL Server pools closed");
    }
}
