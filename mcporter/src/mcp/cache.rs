//! Connection cache
//!
//! Owns at most one live connection per keep-alive server. Creation is shared:
//! the map stores the in-flight creation (a `OnceCell`) rather than only the
//! finished connection, so callers racing on the same name await the same
//! attempt. Ephemeral servers bypass the map and get a fresh connection that
//! is closed on release.
//!
//! A keep-alive entry counts its outstanding [`Acquired`] handles. The idle
//! timer only runs while that count is zero, so a long call never has its
//! connection closed underneath it. Entries whose transport has gone away are
//! replaced on the next acquisition.
//!
//! The map lock is synchronous and never held across an await, so work on
//! different server names never blocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::classify::is_connection_lost;
use super::transport::{ConnectOptions, Connection, Connector, TransportError};
use super::types::ServerDefinition;

/// Upper bound for closing one connection during shutdown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type ConnectionCell = Arc<OnceCell<Arc<dyn Connection>>>;

/// A connection handed out by the cache
///
/// Hand it back with [`ConnectionCache::release`] (or
/// [`ConnectionCache::settle`]) once the operation is done.
pub struct Acquired {
    server: String,
    connection: Arc<dyn Connection>,
    /// Cache cell this connection lives in; `None` for ephemeral connections
    cell: Option<ConnectionCell>,
}

impl Acquired {
    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    /// Owned handle, for operations that outlive a borrow of `self`
    pub fn shared(&self) -> Arc<dyn Connection> {
        self.connection.clone()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.cell.is_none()
    }
}

/// Cache entry for one keep-alive server
struct Entry {
    cell: ConnectionCell,
    idle_timeout: Duration,
    last_used: Instant,
    /// Outstanding `Acquired` handles; the entry is idle only at zero
    in_use: usize,
    /// Bumped on every use; a timer only evicts the generation it was armed for
    generation: u64,
    idle_timer: Option<JoinHandle<()>>,
}

impl Entry {
    fn is_dead(&self) -> bool {
        self.cell.get().is_some_and(|c| c.is_closed())
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

struct CacheInner {
    connector: Arc<dyn Connector>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl CacheInner {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // A panic while holding the lock cannot leave an entry half-written
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registry of live connections, keyed by server name
#[derive(Clone)]
pub struct ConnectionCache {
    inner: Arc<CacheInner>,
}

impl ConnectionCache {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                connector,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Get the live connection for a server, creating it if needed
    pub async fn get_or_create(
        &self,
        definition: &ServerDefinition,
        options: ConnectOptions,
    ) -> Result<Acquired, TransportError> {
        let name = definition.name.trim();
        if name.is_empty() {
            return Err(TransportError::InvalidRequest(
                "server name must not be empty".to_string(),
            ));
        }

        let Some(idle_timeout) = definition.lifecycle.and_then(|l| l.idle_timeout()) else {
            let connection = self.inner.connector.connect(definition, options).await?;
            tracing::debug!("Opened ephemeral connection to '{}'", name);
            return Ok(Acquired {
                server: name.to_string(),
                connection,
                cell: None,
            });
        };

        let (cell, dead) = {
            let mut entries = self.inner.entries();
            let dead = if entries.get(name).is_some_and(Entry::is_dead) {
                entries.remove(name)
            } else {
                None
            };
            let entry = entries.entry(name.to_string()).or_insert_with(|| Entry {
                cell: Arc::new(OnceCell::new()),
                idle_timeout,
                last_used: Instant::now(),
                in_use: 0,
                generation: 0,
                idle_timer: None,
            });
            (entry.cell.clone(), dead)
        };
        if let Some(dead) = dead {
            tracing::info!("Connection to '{}' is closed; reconnecting", name);
            close_entry(name, dead).await;
        }

        // The guard owns our only handle on the cell so that it can tell
        // whether anyone else is still waiting on it
        let guard = CreationGuard {
            inner: &self.inner,
            name,
            cell,
        };
        let connection = guard
            .cell
            .get_or_try_init(|| {
                let connector = self.inner.connector.clone();
                async move {
                    tracing::info!("Creating keep-alive connection to '{}'", name);
                    connector.connect(definition, options).await
                }
            })
            .await?
            .clone();

        let cell = if self.check_out(name, &guard.cell) {
            Some(guard.cell.clone())
        } else {
            // Evicted while we were connecting: nobody else will close it
            tracing::debug!("Connection to '{}' was evicted during creation", name);
            None
        };
        Ok(Acquired {
            server: name.to_string(),
            connection,
            cell,
        })
    }

    /// Return a connection after use
    ///
    /// Ephemeral connections are closed. A keep-alive connection goes back to
    /// the cache; its idle timer starts once no caller holds it.
    pub async fn release(&self, acquired: Acquired) {
        match &acquired.cell {
            Some(cell) => {
                // A replaced or evicted entry is left alone
                self.check_in(&acquired.server, cell);
            }
            None => close_connection(&acquired.server, acquired.connection.as_ref()).await,
        }
    }

    /// Return a connection whose transport failed; a cached one is evicted
    pub async fn discard(&self, acquired: Acquired) {
        let Some(cell) = &acquired.cell else {
            close_connection(&acquired.server, acquired.connection.as_ref()).await;
            return;
        };

        let removed = {
            let mut entries = self.inner.entries();
            let current = entries.get(&acquired.server).is_some_and(|e| Arc::ptr_eq(&e.cell, cell));
            if current {
                entries.remove(&acquired.server)
            } else {
                None
            }
        };
        if let Some(entry) = removed {
            tracing::info!("Dropping broken connection to '{}'", acquired.server);
            close_entry(&acquired.server, entry).await;
        }
    }

    /// Release or discard depending on how the operation went
    pub async fn settle<T>(&self, acquired: Acquired, result: &Result<T, TransportError>) {
        match result {
            Err(e) if is_connection_lost(e) || acquired.connection.is_closed() => self.discard(acquired).await,
            _ => self.release(acquired).await,
        }
    }

    /// Close and forget the connection for a server, if any
    pub async fn evict(&self, server: &str) {
        let entry = self.inner.entries().remove(server);
        if let Some(entry) = entry {
            close_entry(server, entry).await;
        }
    }

    /// Close every cached connection
    ///
    /// Close errors are logged and swallowed; each close gets a bounded amount
    /// of time so one stuck server cannot hold up the rest.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Entry)> = self.inner.entries().drain().collect();
        if drained.is_empty() {
            return;
        }
        tracing::info!("Closing {} cached MCP connection(s)", drained.len());

        join_all(drained.into_iter().map(|(name, entry)| async move {
            if tokio::time::timeout(CLOSE_TIMEOUT, close_entry(&name, entry)).await.is_err() {
                tracing::warn!("Timed out closing connection to '{}'", name);
            }
        }))
        .await;
    }

    /// Whether a live keep-alive connection is cached for a server
    pub fn contains(&self, server: &str) -> bool {
        self.inner
            .entries()
            .get(server)
            .is_some_and(|e| e.cell.initialized() && !e.is_dead())
    }

    /// Live servers with how long each has been idle
    pub fn status(&self) -> Vec<(String, Duration)> {
        let mut status: Vec<_> = self
            .inner
            .entries()
            .iter()
            .filter(|(_, e)| e.cell.initialized())
            .map(|(name, e)| (name.clone(), e.last_used.elapsed()))
            .collect();
        status.sort();
        status
    }

    /// Mark the entry in use and stop its idle timer. Returns false when the
    /// entry no longer holds `cell`.
    fn check_out(&self, name: &str, cell: &ConnectionCell) -> bool {
        let mut entries = self.inner.entries();
        let Some(entry) = entries.get_mut(name).filter(|e| Arc::ptr_eq(&e.cell, cell)) else {
            return false;
        };

        entry.in_use += 1;
        entry.last_used = Instant::now();
        entry.generation += 1;
        entry.cancel_timer();
        true
    }

    /// Drop one use; the last one out arms the idle timer
    fn check_in(&self, name: &str, cell: &ConnectionCell) {
        let mut entries = self.inner.entries();
        let Some(entry) = entries.get_mut(name).filter(|e| Arc::ptr_eq(&e.cell, cell)) else {
            return;
        };

        entry.in_use = entry.in_use.saturating_sub(1);
        entry.last_used = Instant::now();
        if entry.in_use > 0 {
            return;
        }
        entry.generation += 1;
        entry.cancel_timer();
        entry.idle_timer = Some(arm_idle_timer(
            Arc::downgrade(&self.inner),
            name.to_string(),
            entry.generation,
            entry.idle_timeout,
        ));
    }
}

fn arm_idle_timer(inner: Weak<CacheInner>, name: String, generation: u64, idle: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(idle).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };

        let expired = {
            let mut entries = inner.entries();
            let idle_now = entries
                .get(&name)
                .is_some_and(|e| e.generation == generation && e.in_use == 0);
            if idle_now {
                entries.remove(&name)
            } else {
                None
            }
        };

        if let Some(mut entry) = expired {
            tracing::info!("Closing idle MCP server '{}' after {:?}", name, idle);
            // This task is the timer; don't abort ourselves mid-close
            entry.idle_timer = None;
            close_entry(&name, entry).await;
        }
    })
}

async fn close_entry(name: &str, mut entry: Entry) {
    entry.cancel_timer();
    if let Some(connection) = entry.cell.get() {
        close_connection(name, connection.as_ref()).await;
    }
}

async fn close_connection(name: &str, connection: &dyn Connection) {
    if let Err(e) = connection.close().await {
        tracing::warn!("Error closing MCP server '{}': {}", name, e);
    }
}

/// Removes an entry whose creation failed or was cancelled, unless another
/// caller is still waiting on the same cell
struct CreationGuard<'a> {
    inner: &'a CacheInner,
    name: &'a str,
    cell: ConnectionCell,
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        if self.cell.initialized() {
            return;
        }
        let mut entries = self.inner.entries();
        let abandoned = entries
            .get(self.name)
            // map + this guard; clones are only taken under the lock
            .is_some_and(|e| Arc::ptr_eq(&e.cell, &self.cell) && Arc::strong_count(&self.cell) == 2);
        if abandoned {
            entries.remove(self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::lifecycle::ServerLifecycle;
    use crate::mcp::types::{CommandSpec, ServerSource, ToolInfo};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeConnection {
        closed: AtomicBool,
        fail_close: bool,
        /// Transport is gone and says so
        gone: AtomicBool,
        /// Requests fail as if the transport dropped, without `is_closed` noticing
        broken: bool,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn list_tools(&self) -> Result<Vec<ToolInfo>, TransportError> {
            if self.broken || self.gone.load(Ordering::SeqCst) {
                return Err(TransportError::Request("connection closed".to_string()));
            }
            Ok(vec![ToolInfo::new("echo")])
        }
        async fn call_tool(&self, _: &str, arguments: Option<Value>) -> Result<Value, TransportError> {
            if let Some(ms) = arguments.as_ref().and_then(|a| a["sleep_ms"].as_u64()) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Request("closed mid-call".to_string()));
            }
            Ok(Value::Null)
        }
        fn is_closed(&self) -> bool {
            self.gone.load(Ordering::SeqCst)
        }
        async fn close(&self) -> Result<(), TransportError> {
            self.closed.store(true, Ordering::SeqCst);
            if self.fail_close {
                Err(TransportError::Request("close failed".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        connects: AtomicUsize,
        fail_next: AtomicBool,
        fail_close_for: Option<String>,
        broken: bool,
        created: Mutex<Vec<Arc<FakeConnection>>>,
    }

    impl FakeConnector {
        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        fn closed(&self) -> usize {
            self.created
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.closed.load(Ordering::SeqCst))
                .count()
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            definition: &ServerDefinition,
            _: ConnectOptions,
        ) -> Result<Arc<dyn Connection>, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            // Give racing callers a chance to pile up
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(TransportError::Connect("connection refused".to_string()));
            }
            let connection = Arc::new(FakeConnection {
                fail_close: self.fail_close_for.as_deref() == Some(definition.name.as_str()),
                broken: self.broken,
                ..Default::default()
            });
            self.created.lock().unwrap().push(connection.clone());
            Ok(connection)
        }
    }

    fn server(name: &str, lifecycle: Option<ServerLifecycle>) -> ServerDefinition {
        let mut def = ServerDefinition::new(
            name,
            CommandSpec::Stdio {
                command: "fake".to_string(),
                args: vec![],
                cwd: None,
            },
            ServerSource::adhoc(),
        );
        def.lifecycle = lifecycle;
        def
    }

    fn keep_alive(name: &str, idle_ms: u64) -> ServerDefinition {
        server(
            name,
            Some(ServerLifecycle::KeepAlive {
                idle_timeout: Some(Duration::from_millis(idle_ms)),
            }),
        )
    }

    fn setup() -> (ConnectionCache, Arc<FakeConnector>) {
        let connector = Arc::new(FakeConnector::default());
        (ConnectionCache::new(connector.clone()), connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_keep_alive_shares_creation() {
        let (cache, connector) = setup();
        let def = keep_alive("chrome-devtools", 60_000);

        let (a, b) = tokio::join!(
            cache.get_or_create(&def, ConnectOptions::default()),
            cache.get_or_create(&def, ConnectOptions::default()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(connector.connects(), 1);
        assert!(!a.is_ephemeral() && !b.is_ephemeral());
        assert!(Arc::ptr_eq(&a.connection, &b.connection));

        cache.release(a).await;
        cache.release(b).await;
        assert!(cache.contains("chrome-devtools"));
        assert_eq!(connector.closed(), 0);

        // A later call reuses the same connection
        let c = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
        assert_eq!(connector.connects(), 1);
        cache.release(c).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ephemeral_connections_are_independent() {
        let (cache, connector) = setup();
        let def = server("fs", None);

        let (a, b) = tokio::join!(
            cache.get_or_create(&def, ConnectOptions::default()),
            cache.get_or_create(&def, ConnectOptions::default()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(connector.connects(), 2);
        assert!(a.is_ephemeral());
        assert!(!cache.contains("fs"));

        cache.release(a).await;
        assert_eq!(connector.closed(), 1);
        cache.release(b).await;
        assert_eq!(connector.closed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_ephemeral_is_not_cached() {
        let (cache, connector) = setup();
        let def = server("fs", Some(ServerLifecycle::Ephemeral));

        let a = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
        assert!(a.is_ephemeral());
        cache.release(a).await;
        assert_eq!(connector.closed(), 1);
        assert!(cache.status().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction() {
        let (cache, connector) = setup();
        let def = keep_alive("playwright", 100);

        let a = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
        cache.release(a).await;
        assert!(cache.contains("playwright"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;

        assert!(!cache.contains("playwright"));
        assert_eq!(connector.closed(), 1);

        let b = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
        assert_eq!(connector.connects(), 2);
        cache.release(b).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_use_resets_idle_timer() {
        let (cache, connector) = setup();
        let def = keep_alive("playwright", 100);

        let a = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
        cache.release(a).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let b = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
        cache.release(b).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        tokio::task::yield_now().await;
        assert!(cache.contains("playwright"));
        assert_eq!(connector.connects(), 1);
        assert_eq!(connector.closed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_creation_leaves_no_entry() {
        let (cache, connector) = setup();
        connector.fail_next.store(true, Ordering::SeqCst);
        let def = keep_alive("flaky", 60_000);

        let err = cache.get_or_create(&def, ConnectOptions::default()).await.err().unwrap();
        assert!(matches!(err, TransportError::Connect(_)));
        assert!(cache.inner.entries().is_empty());

        let a = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
        assert_eq!(connector.connects(), 2);
        cache.release(a).await;
        assert!(cache.contains("flaky"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_creation_leaves_no_entry() {
        let (cache, _connector) = setup();
        let def = keep_alive("slow", 60_000);

        let result = tokio::time::timeout(
            Duration::from_millis(1),
            cache.get_or_create(&def, ConnectOptions::default()),
        )
        .await;
        assert!(result.is_err());
        assert!(cache.inner.entries().is_empty());
    }

    #[tokio::test]
    async fn test_empty_name_rejected_before_connect() {
        let (cache, connector) = setup();
        let def = keep_alive("  ", 100);
        let err = cache.get_or_create(&def, ConnectOptions::default()).await.err().unwrap();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
        assert_eq!(connector.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_closes_connection() {
        let (cache, connector) = setup();
        let def = keep_alive("linear", 60_000);
        let a = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
        cache.release(a).await;

        cache.evict("linear").await;
        assert!(!cache.contains("linear"));
        assert_eq!(connector.closed(), 1);

        // evicting an unknown name is a no-op
        cache.evict("missing").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_all_swallows_errors() {
        let connector = Arc::new(FakeConnector {
            fail_close_for: Some("broken".to_string()),
            ..Default::default()
        });
        let cache = ConnectionCache::new(connector.clone());

        for name in ["broken", "healthy", "other"] {
            let a = cache
                .get_or_create(&keep_alive(name, 60_000), ConnectOptions::default())
                .await
                .unwrap();
            cache.release(a).await;
        }
        assert_eq!(cache.status().len(), 3);

        cache.close_all().await;
        assert_eq!(connector.closed(), 3);
        assert!(cache.status().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_connection_outlives_idle_timeout() {
        let (cache, connector) = setup();
        let def = keep_alive("playwright", 100);

        let a = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
        let result = a
            .connection()
            .call_tool("navigate", Some(serde_json::json!({"sleep_ms": 200})))
            .await;
        assert!(result.is_ok(), "call failed while held: {:?}", result);
        assert_eq!(connector.closed(), 0);
        assert!(cache.contains("playwright"));

        // the idle clock starts at release
        cache.release(a).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;
        assert!(!cache.contains("playwright"));
        assert_eq!(connector.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_waits_for_last_holder() {
        let (cache, connector) = setup();
        let def = keep_alive("playwright", 100);

        let a = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
        let b = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
        cache.release(a).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;
        assert!(cache.contains("playwright"));

        cache.release(b).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;
        assert!(!cache.contains("playwright"));
        assert_eq!(connector.connects(), 1);
        assert_eq!(connector.closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_is_replaced() {
        let (cache, connector) = setup();
        let def = keep_alive("chrome-devtools", 60_000);

        let a = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
        cache.release(a).await;

        // server exits behind our back
        connector.created.lock().unwrap()[0].gone.store(true, Ordering::SeqCst);
        assert!(!cache.contains("chrome-devtools"));

        let b = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
        assert_eq!(connector.connects(), 2);
        assert!(!b.connection().is_closed());
        assert!(b.connection().list_tools().await.is_ok());
        assert_eq!(connector.closed(), 1);
        cache.release(b).await;
        assert!(cache.contains("chrome-devtools"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_drops_lost_connections() {
        let connector = Arc::new(FakeConnector {
            broken: true,
            ..Default::default()
        });
        let cache = ConnectionCache::new(connector.clone());
        let def = keep_alive("linear", 60_000);

        for round in 1..=3 {
            let a = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
            let result = a.connection().list_tools().await;
            assert!(result.is_err());
            cache.settle(a, &result).await;

            assert!(!cache.contains("linear"));
            assert_eq!(connector.connects(), round);
            assert_eq!(connector.closed(), round);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_keeps_connection_after_ordinary_error() {
        let (cache, connector) = setup();
        let def = keep_alive("linear", 60_000);

        let a = cache.get_or_create(&def, ConnectOptions::default()).await.unwrap();
        let result: Result<(), _> = Err(TransportError::Timeout(Duration::from_secs(1)));
        cache.settle(a, &result).await;

        assert!(cache.contains("linear"));
        assert_eq!(connector.closed(), 0);
    }
}
