use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use super::connectors::{
    sqlserver::build_tiberius_config, ConnectionError, QueryError, SqlServerConfig,
    SqlServerService,
};
use super::pool::{PoolSettings, PoolStats, SqlServerPool};

pub type PoolHandle = Arc<SqlServerPool>;

/// Holds one live pool per canonical connection string.
///
/// Lookups take the read lock; the write lock is only taken to publish or
/// retire a pool, never across network I/O.
pub struct ConnectionRegistry {
    settings: PoolSettings,
    pools: RwLock<HashMap<String, PoolHandle>>,
}

impl ConnectionRegistry {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }

    /// Checkout counters of every published pool.
    pub async fn stats(&self) -> Vec<PoolStats> {
        self.pools.read().await.values().map(|p| p.stats()).collect()
    }

    /// Close and forget every pool.
    pub async fn close_all(&self) {
        let drained: Vec<PoolHandle> = self.pools.write().await.drain().map(|(_, p)| p).collect();
        for pool in drained {
            pool.close();
        }
    }

    async fn lookup(&self, key: &str) -> Option<PoolHandle> {
        self.pools.read().await.get(key).cloned()
    }

    /// Drop `stale` from the table unless another task already replaced it.
    ///
    /// The pool itself stays open for whoever still holds it and winds down
    /// when the last handle is dropped.
    async fn retire(&self, key: &str, stale: &PoolHandle) {
        let mut pools = self.pools.write().await;
        if pools.get(key).is_some_and(|current| Arc::ptr_eq(current, stale)) {
            pools.remove(key);
        }
        drop(pools);
        log::debug!(
            "pool {} retired with {} checkout(s) in flight",
            stale.fingerprint(),
            stale.in_use()
        );
    }

    /// Publish `fresh` unless a concurrent connect got there first, in which
    /// case the earlier pool wins and `fresh` is closed.
    async fn publish(&self, key: String, fresh: PoolHandle) -> PoolHandle {
        let mut pools = self.pools.write().await;
        if let Some(existing) = pools.get(&key) {
            let existing = existing.clone();
            drop(pools);
            fresh.close();
            return existing;
        }
        pools.insert(key, fresh.clone());
        fresh
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(PoolSettings::default())
    }
}

/// Non-secret short identifier for a connection string.
pub fn fingerprint(connection_string: &str) -> String {
    let digest = Sha256::digest(connection_string.as_bytes());
    hex::encode(&digest[..6])
}

#[async_trait]
impl SqlServerService for ConnectionRegistry {
    type Handle = PoolHandle;

    async fn connect(&self, config: &SqlServerConfig) -> Result<PoolHandle, ConnectionError> {
        let key = config.connection_string();
        let fp = fingerprint(&key);

        if let Some(pool) = self.lookup(&key).await {
            match pool.ping(self.settings.ping_timeout).await {
                Ok(()) => return Ok(pool),
                Err(e) => {
                    log::warn!("pool {} failed validation, recreating: {}", fp, e);
                    self.retire(&key, &pool).await;
                }
            }
        }

        let pool = Arc::new(SqlServerPool::new(
            build_tiberius_config(config),
            fp.clone(),
            self.settings.clone(),
        ));

        if let Err(e) = pool.ping(self.settings.connect_ping_timeout).await {
            pool.close();
            log::warn!(
                "could not connect to {}:{} (pool {}): {}",
                config.server,
                config.port,
                fp,
                e
            );
            return Err(ConnectionError {
                message: "failed to ping server".to_string(),
                cause: Some(Box::new(e)),
            });
        }

        log::info!(
            "opened pool {} for {}:{} database '{}'",
            fp,
            config.server,
            config.port,
            config.database
        );
        Ok(self.publish(key, pool).await)
    }

    async fn execute_query(&self, handle: &PoolHandle, sql: &str) -> Result<bool, QueryError> {
        handle.query_scalar(sql).await?.to_bool()
    }

    async fn validate_connection(&self, handle: &PoolHandle) -> Result<(), ConnectionError> {
        handle.ping(self.settings.ping_timeout).await
    }

    async fn close(&self, handle: &PoolHandle) -> Result<(), ConnectionError> {
        let mut pools = self.pools.write().await;
        let key = pools
            .iter()
            .find(|(_, pool)| Arc::ptr_eq(pool, handle))
            .map(|(key, _)| key.clone());
        if let Some(key) = key {
            pools.remove(&key);
        }
        drop(pools);

        // Other holders (a concurrent audit, say) keep the pool alive; it
        // closes when the last of them lets go.
        if Arc::strong_count(handle) > 1 {
            log::debug!(
                "pool {} unpublished, still held by {} other handle(s)",
                handle.fingerprint(),
                Arc::strong_count(handle) - 1
            );
        } else {
            handle.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick_settings() -> PoolSettings {
        PoolSettings {
            ping_timeout: Duration::from_secs(2),
            connect_ping_timeout: Duration::from_secs(2),
            query_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn unreachable() -> SqlServerConfig {
        SqlServerConfig {
            server: "127.0.0.1".into(),
            port: 1,
            user: "sa".into(),
            password: "secret".into(),
            database: "master".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fingerprint_is_stable_and_hides_secret() {
        let dsn = unreachable().connection_string();
        let fp = fingerprint(&dsn);
        assert_eq!(fp.len(), 12);
        assert_eq!(fp, fingerprint(&dsn));
        assert!(!fp.contains("secret"));
        assert_ne!(fp, fingerprint("sqlserver://other:1433"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_published() {
        let registry = ConnectionRegistry::new(quick_settings());
        let err = registry.connect(&unreachable()).await.err().unwrap();
        assert_eq!(err.message, "failed to ping server");
        assert!(err.cause.is_some());
        assert_eq!(registry.pool_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_unknown_handle_is_ok() {
        let registry = ConnectionRegistry::new(quick_settings());
        let cfg = unreachable();
        let handle: PoolHandle = Arc::new(SqlServerPool::new(
            build_tiberius_config(&cfg),
            "orphan".into(),
            quick_settings(),
        ));
        registry.close(&handle).await.unwrap();
        assert!(handle.is_closed());
        // second close on an already-removed handle
        registry.close(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_removes_published_pool() {
        let registry = ConnectionRegistry::new(quick_settings());
        let cfg = unreachable();
        let handle: PoolHandle = Arc::new(SqlServerPool::new(
            build_tiberius_config(&cfg),
            "published".into(),
            quick_settings(),
        ));
        let published = registry
            .publish(cfg.connection_string(), handle.clone())
            .await;
        assert!(Arc::ptr_eq(&published, &handle));
        assert_eq!(registry.pool_count().await, 1);

        registry.close(&handle).await.unwrap();
        assert_eq!(registry.pool_count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_keeps_first_pool() {
        let registry = ConnectionRegistry::new(quick_settings());
        let cfg = unreachable();
        let first: PoolHandle = Arc::new(SqlServerPool::new(
            build_tiberius_config(&cfg),
            "first".into(),
            quick_settings(),
        ));
        let second: PoolHandle = Arc::new(SqlServerPool::new(
            build_tiberius_config(&cfg),
            "second".into(),
            quick_settings(),
        ));
        let key = cfg.connection_string();
        registry.publish(key.clone(), first.clone()).await;
        let winner = registry.publish(key, second.clone()).await;
        assert!(Arc::ptr_eq(&winner, &first));
        assert!(second.is_closed());
        assert_eq!(registry.pool_count().await, 1);
    }

    #[tokio::test]
    async fn test_stale_pool_is_replaced_then_fails() {
        let registry = ConnectionRegistry::new(quick_settings());
        let cfg = unreachable();
        let stale: PoolHandle = Arc::new(SqlServerPool::new(
            build_tiberius_config(&cfg),
            "stale".into(),
            quick_settings(),
        ));
        registry.publish(cfg.connection_string(), stale.clone()).await;

        // the stale pool fails validation, is retired, and the reconnect fails too
        assert!(registry.connect(&cfg).await.is_err());
        assert_eq!(registry.pool_count().await, 0);
        // retiring only unpublishes; the holder still owns an open pool
        assert!(!stale.is_closed());
    }

    #[tokio::test]
    async fn test_close_keeps_pool_open_for_other_holders() {
        let registry = ConnectionRegistry::new(quick_settings());
        let cfg = unreachable();
        let handle: PoolHandle = Arc::new(SqlServerPool::new(
            build_tiberius_config(&cfg),
            "shared".into(),
            quick_settings(),
        ));
        registry.publish(cfg.connection_string(), handle.clone()).await;
        let in_audit = handle.clone();

        registry.close(&handle).await.unwrap();
        assert_eq!(registry.pool_count().await, 0);
        assert!(!in_audit.is_closed());

        drop(handle);
        registry.close(&in_audit).await.unwrap();
        assert!(in_audit.is_closed());
    }

    #[tokio::test]
    async fn test_busy_pool_survives_failed_revalidation() {
        // Accepts TCP connections and never answers, so a checkout stalls in
        // the TDS handshake while holding its slot.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let settings = PoolSettings {
            max_open: 1,
            ping_timeout: Duration::from_millis(200),
            connect_ping_timeout: Duration::from_millis(200),
            query_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let registry = ConnectionRegistry::new(settings.clone());
        let cfg = SqlServerConfig {
            port,
            ..unreachable()
        };
        let busy: PoolHandle = Arc::new(SqlServerPool::new(
            build_tiberius_config(&cfg),
            "busy".into(),
            settings,
        ));
        registry.publish(cfg.connection_string(), busy.clone()).await;

        let holder = {
            let busy = busy.clone();
            tokio::spawn(async move {
                let _checkout = busy.acquire().await;
            })
        };
        for _ in 0..200 {
            if busy.in_use() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(busy.in_use(), 1);

        // Saturated pool times out its ping and gets retired; the replacement
        // cannot finish a handshake either.
        assert!(registry.connect(&cfg).await.is_err());
        assert_eq!(registry.pool_count().await, 0);
        assert!(!busy.is_closed());

        holder.abort();
        let _ = holder.await;

        // The first holder's pool still hands out checkouts.
        let err = busy.ping(Duration::from_millis(200)).await.unwrap_err();
        assert_ne!(err.message, "connection pool is closed");
        assert!(!busy.is_closed());

        server.abort();
    }

    #[tokio::test]
    async fn test_stats_cover_published_pools() {
        let registry = ConnectionRegistry::new(quick_settings());
        let cfg = unreachable();
        let pool: PoolHandle = Arc::new(SqlServerPool::new(
            build_tiberius_config(&cfg),
            "stats".into(),
            quick_settings(),
        ));
        registry.publish(cfg.connection_string(), pool).await;
        let stats = registry.stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].fingerprint, "stats");
        assert_eq!((stats[0].in_use, stats[0].idle), (0, 0));
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = ConnectionRegistry::new(quick_settings());
        let cfg = unreachable();
        let pool: PoolHandle = Arc::new(SqlServerPool::new(
            build_tiberius_config(&cfg),
            "a".into(),
            quick_settings(),
        ));
        registry.publish(cfg.connection_string(), pool.clone()).await;
        registry.close_all().await;
        assert_eq!(registry.pool_count().await, 0);
        assert!(pool.is_closed());
    }
}
