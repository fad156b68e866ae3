use super::connectors::sqlserver::{self, SqlClient};
use super::connectors::{ConnectionError, QueryError};
use super::scalar::ScalarValue;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};

/// Limits applied to every physical pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub max_open: usize,
    pub max_idle: usize,
    pub max_lifetime: Duration,
    /// Timeout for liveness checks on an existing pool.
    pub ping_timeout: Duration,
    /// Timeout for the first check of a freshly opened pool.
    pub connect_ping_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_open: 10,
            max_idle: 5,
            max_lifetime: Duration::from_secs(60 * 60),
            ping_timeout: Duration::from_secs(5),
            connect_ping_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time checkout counters of one pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub fingerprint: String,
    pub idle: usize,
    pub in_use: usize,
}

struct IdleClient {
    client: SqlClient,
    opened_at: Instant,
}

/// A bounded set of TDS clients for one target.
pub struct SqlServerPool {
    config: tiberius::Config,
    fingerprint: String,
    settings: PoolSettings,
    idle: Mutex<Vec<IdleClient>>,
    permits: Semaphore,
    closed: AtomicBool,
}

impl SqlServerPool {
    pub fn new(config: tiberius::Config, fingerprint: String, settings: PoolSettings) -> Self {
        let permits = Semaphore::new(settings.max_open.max(1));
        Self {
            config,
            fingerprint,
            settings,
            idle: Mutex::new(Vec::new()),
            permits,
            closed: AtomicBool::new(false),
        }
    }

    /// Short, non-secret identifier used in log lines.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn in_use(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.settings.max_open.max(1) - self.permits.available_permits()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            fingerprint: self.fingerprint.clone(),
            idle: self.idle_count(),
            in_use: self.in_use(),
        }
    }

    /// Check out a client, reusing an idle one when it has not outlived
    /// `max_lifetime`. Waits when `max_open` clients are already checked out.
    pub async fn acquire(&self) -> Result<PooledClient<'_>, ConnectionError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ConnectionError::new("connection pool is closed"))?;

        let (client, opened_at) = match self.take_idle() {
            Some(idle) => (idle.client, idle.opened_at),
            None => {
                let client = sqlserver::open_client(&self.config)
                    .await
                    .map_err(|e| ConnectionError::with_cause("failed to open connection", e))?;
                log::debug!("pool {}: opened new client", self.fingerprint);
                (client, Instant::now())
            }
        };

        Ok(PooledClient {
            pool: self,
            client: Some(client),
            opened_at,
            broken: false,
            _permit: permit,
        })
    }

    /// Liveness check bounded by `timeout`, including any connect it triggers.
    pub async fn ping(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let check = async {
            let mut client = self.acquire().await?;
            client.ping().await
        };
        match tokio::time::timeout(timeout, check).await {
            Ok(result) => result,
            Err(elapsed) => Err(ConnectionError::with_cause("ping timed out", elapsed)),
        }
    }

    /// Run a probe and return its single value, bounded by the query timeout.
    pub async fn query_scalar(&self, sql: &str) -> Result<ScalarValue, QueryError> {
        let timeout = self.settings.query_timeout;
        let run = async {
            let mut client = self.acquire().await?;
            client.query_scalar(sql).await
        };
        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout(timeout)),
        }
    }

    /// Stop handing out clients and drop the idle ones. Clients still checked
    /// out are dropped when returned.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        log::info!("pool {}: closed", self.fingerprint);
    }

    fn take_idle(&self) -> Option<IdleClient> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(candidate) = idle.pop() {
            if candidate.opened_at.elapsed() < self.settings.max_lifetime {
                return Some(candidate);
            }
        }
        None
    }

    fn release(&self, client: SqlClient, opened_at: Instant) {
        if self.is_closed() || opened_at.elapsed() >= self.settings.max_lifetime {
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.settings.max_idle {
            idle.push(IdleClient { client, opened_at });
        }
    }
}

impl Drop for SqlServerPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// A checked-out client. Returned to the idle set on drop unless the last
/// operation left it in an unknown state.
pub struct PooledClient<'a> {
    pool: &'a SqlServerPool,
    client: Option<SqlClient>,
    opened_at: Instant,
    broken: bool,
    _permit: SemaphorePermit<'a>,
}

impl PooledClient<'_> {
    pub async fn ping(&mut self) -> Result<(), ConnectionError> {
        let Some(client) = self.client.as_mut() else {
            return Err(ConnectionError::new("client already released"));
        };
        // Stays set if the future is dropped mid-flight.
        self.broken = true;
        match sqlserver::ping(client).await {
            Ok(()) => {
                self.broken = false;
                Ok(())
            }
            Err(e) => {
                self.broken = sqlserver::is_fatal(&e);
                Err(ConnectionError::with_cause("failed to ping server", e))
            }
        }
    }

    pub async fn query_scalar(&mut self, sql: &str) -> Result<ScalarValue, QueryError> {
        let Some(client) = self.client.as_mut() else {
            return Err(ConnectionError::new("client already released").into());
        };
        self.broken = true;
        let result = sqlserver::query_scalar(client, sql).await;
        self.broken = matches!(result, Err(QueryError::Execution(_)));
        result
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if self.broken {
                log::debug!("pool {}: discarding client", self.pool.fingerprint);
            } else {
                self.pool.release(client, self.opened_at);
            }
        }
    }
}
