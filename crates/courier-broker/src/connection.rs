//! Broker connection management.
//!
//! [`ConnectionManager`] owns one long-lived connection per named broker.
//! Connections open lazily on first use and are supervised in the
//! background: when one is lost, the manager reconnects on a fixed interval
//! and broadcasts [`ConnectionEvent`]s so dependents can re-declare transient
//! topology. While a broker is reconnecting, operations fail fast with
//! [`TransportError::NotConnected`].
//!
//! Sessions are short-lived. When the transport reports thread-safe sessions
//! a small pool is shared round-robin; otherwise every operation opens its
//! own session, which is closed when the [`SessionGuard`] drops.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::transport::{BrokerConnection, BrokerSession, BrokerTransport};

const EVENT_CAPACITY: usize = 64;

// =============================================================================
// Options and Events
// =============================================================================

/// Connection settings for one broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    pub url: String,
    /// Delay between reconnection attempts.
    pub reconnect_interval: Duration,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Pooled sessions when the transport allows sharing them.
    pub session_pool_size: usize,
    /// Carry the content type inside the payload instead of a property.
    pub channel_encoded_payload: bool,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            url: "memory://localhost".to_string(),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: None,
            session_pool_size: 4,
            channel_encoded_payload: false,
        }
    }
}

impl BrokerOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn with_session_pool_size(mut self, size: usize) -> Self {
        self.session_pool_size = size;
        self
    }

    pub fn with_channel_encoded_payload(mut self, enabled: bool) -> Self {
        self.channel_encoded_payload = enabled;
        self
    }
}

/// Lifecycle state of a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not yet connected; the next operation connects.
    Disconnected,
    Connected,
    /// Lost and retrying in the background.
    Reconnecting,
    /// Reconnection gave up.
    Failed,
    /// Shut down.
    Closed,
}

/// Broadcast when a broker connection changes state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { broker: String },
    Lost { broker: String, reason: String },
    Reconnected { broker: String, attempts: u32 },
    ReconnectFailed { broker: String, attempts: u32 },
}

impl ConnectionEvent {
    pub fn broker(&self) -> &str {
        match self {
            Self::Connected { broker }
            | Self::Lost { broker, .. }
            | Self::Reconnected { broker, .. }
            | Self::ReconnectFailed { broker, .. } => broker,
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Owns the connections of every configured broker.
pub struct ConnectionManager {
    links: HashMap<String, Arc<BrokerLink>>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            links: HashMap::new(),
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Registers a broker. Nothing connects until it is first used.
    pub fn add_broker(
        &mut self,
        name: impl Into<String>,
        transport: Arc<dyn BrokerTransport>,
        options: BrokerOptions,
    ) -> &mut Self {
        let name = name.into();
        let link = BrokerLink {
            name: name.clone(),
            transport,
            options,
            state: tokio::sync::Mutex::new(LinkState::default()),
            status: Mutex::new(ConnectionStatus::Disconnected),
            next_session: AtomicUsize::new(0),
            events: self.events.clone(),
            shutdown: self.shutdown.child_token(),
        };
        self.links.insert(name, Arc::new(link));
        self
    }

    pub fn with_broker(
        mut self,
        name: impl Into<String>,
        transport: Arc<dyn BrokerTransport>,
        options: BrokerOptions,
    ) -> Self {
        self.add_broker(name, transport, options);
        self
    }

    pub fn broker_names(&self) -> impl Iterator<Item = &str> {
        self.links.keys().map(String::as_str)
    }

    pub fn has_broker(&self, broker: &str) -> bool {
        self.links.contains_key(broker)
    }

    pub fn options(&self, broker: &str) -> Option<&BrokerOptions> {
        self.links.get(broker).map(|link| &link.options)
    }

    pub fn status(&self, broker: &str) -> Option<ConnectionStatus> {
        self.links.get(broker).map(|link| link.status())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Cancelled when the manager shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Connects eagerly instead of on first use.
    pub async fn connect(&self, broker: &str) -> TransportResult<()> {
        self.link(broker)?.connection().await.map(|_| ())
    }

    /// Acquires a session for one operation.
    pub async fn session(&self, broker: &str) -> TransportResult<SessionGuard> {
        self.link(broker)?.session().await
    }

    /// Runs `f` with a session that is released afterwards, even when `f`
    /// fails or is cancelled.
    pub async fn with_session<F, Fut, T, E>(&self, broker: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(Arc<dyn BrokerSession>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransportError>,
    {
        let guard = self.session(broker).await?;
        f(Arc::clone(guard.session())).await
    }

    /// Opens a dedicated session for a long-running consumer.
    ///
    /// The caller owns the session and closes it.
    pub async fn subscriber_session(&self, broker: &str) -> TransportResult<Arc<dyn BrokerSession>> {
        let connection = self.link(broker)?.connection().await?;
        connection.open_session().await
    }

    /// Closes every connection and stops reconnection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for link in self.links.values() {
            link.close().await;
        }
        info!("Connection manager shut down");
    }

    fn link(&self, broker: &str) -> TransportResult<&Arc<BrokerLink>> {
        self.links
            .get(broker)
            .ok_or_else(|| TransportError::UnknownBroker(broker.to_string()))
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let statuses: HashMap<&str, ConnectionStatus> = self
            .links
            .iter()
            .map(|(name, link)| (name.as_str(), link.status()))
            .collect();
        f.debug_struct("ConnectionManager")
            .field("brokers", &statuses)
            .finish()
    }
}

// =============================================================================
// Session Guard
// =============================================================================

/// A session borrowed for one operation.
///
/// Unpooled sessions are closed when the guard drops.
pub struct SessionGuard {
    session: Arc<dyn BrokerSession>,
    pooled: bool,
}

impl SessionGuard {
    pub fn session(&self) -> &Arc<dyn BrokerSession> {
        &self.session
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }
}

impl Deref for SessionGuard {
    type Target = dyn BrokerSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.pooled {
            return;
        }
        let session = Arc::clone(&self.session);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { session.close().await });
        }
    }
}

// =============================================================================
// Broker Link
// =============================================================================

#[derive(Default)]
struct LinkState {
    connection: Option<Arc<dyn BrokerConnection>>,
    pool: Vec<Arc<dyn BrokerSession>>,
}

struct BrokerLink {
    name: String,
    transport: Arc<dyn BrokerTransport>,
    options: BrokerOptions,
    state: tokio::sync::Mutex<LinkState>,
    status: Mutex<ConnectionStatus>,
    next_session: AtomicUsize,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: CancellationToken,
}

impl BrokerLink {
    fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn not_connected(&self) -> TransportError {
        TransportError::NotConnected {
            broker: self.name.clone(),
        }
    }

    async fn connection(self: &Arc<Self>) -> TransportResult<Arc<dyn BrokerConnection>> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::ShuttingDown);
        }

        // Status only changes while `state` is held, and only a link that
        // never connected connects here. Lost connections belong to the
        // supervisor.
        let mut state = self.state.lock().await;
        match self.status() {
            ConnectionStatus::Reconnecting | ConnectionStatus::Failed => {
                return Err(self.not_connected());
            }
            ConnectionStatus::Closed => return Err(TransportError::ShuttingDown),
            ConnectionStatus::Connected => {
                return match &state.connection {
                    Some(connection) if connection.is_open() => Ok(Arc::clone(connection)),
                    _ => Err(self.not_connected()),
                };
            }
            ConnectionStatus::Disconnected => {}
        }

        info!(broker = %self.name, url = %self.options.url, "Connecting to broker");
        let connection = self.transport.connect(&self.options.url).await.map_err(|e| {
            warn!(broker = %self.name, error = %e, "Broker connection failed");
            match e {
                TransportError::ConnectionFailed { .. } => e,
                other => TransportError::ConnectionFailed {
                    broker: self.name.clone(),
                    reason: other.to_string(),
                },
            }
        })?;

        state.connection = Some(Arc::clone(&connection));
        state.pool.clear();
        self.set_status(ConnectionStatus::Connected);
        drop(state);

        self.emit(ConnectionEvent::Connected {
            broker: self.name.clone(),
        });
        self.spawn_supervisor(Arc::clone(&connection));
        Ok(connection)
    }

    async fn session(self: &Arc<Self>) -> TransportResult<SessionGuard> {
        let connection = self.connection().await?;

        if !connection.shared_sessions() || self.options.session_pool_size == 0 {
            let session = connection.open_session().await?;
            return Ok(SessionGuard {
                session,
                pooled: false,
            });
        }

        let mut state = self.state.lock().await;
        state.pool.retain(|session| session.is_open());
        if state.pool.len() < self.options.session_pool_size {
            let session = connection.open_session().await?;
            state.pool.push(Arc::clone(&session));
            debug!(broker = %self.name, pooled = state.pool.len(), "Opened pooled session");
            return Ok(SessionGuard {
                session,
                pooled: true,
            });
        }

        let index = self.next_session.fetch_add(1, Ordering::Relaxed) % state.pool.len();
        Ok(SessionGuard {
            session: Arc::clone(&state.pool[index]),
            pooled: true,
        })
    }

    fn spawn_supervisor(self: &Arc<Self>, connection: Arc<dyn BrokerConnection>) {
        let link = Arc::clone(self);
        tokio::spawn(async move { link.supervise(connection).await });
    }

    /// Watches the connection and reconnects after it is lost.
    async fn supervise(&self, mut connection: Arc<dyn BrokerConnection>) {
        loop {
            let reason = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                reason = connection.closed() => reason,
            };
            if self.shutdown.is_cancelled() {
                return;
            }

            warn!(broker = %self.name, reason = %reason, "Broker connection lost");
            {
                let mut state = self.state.lock().await;
                self.set_status(ConnectionStatus::Reconnecting);
                state.connection = None;
                state.pool.clear();
            }
            self.emit(ConnectionEvent::Lost {
                broker: self.name.clone(),
                reason,
            });

            match self.reconnect().await {
                Some(restored) => connection = restored,
                None => return,
            }
        }
    }

    async fn reconnect(&self) -> Option<Arc<dyn BrokerConnection>> {
        let mut attempts = 0u32;

        loop {
            if let Some(max) = self.options.max_reconnect_attempts
                && attempts >= max
            {
                error!(broker = %self.name, attempts, "Giving up reconnecting to broker");
                let _state = self.state.lock().await;
                self.set_status(ConnectionStatus::Failed);
                self.emit(ConnectionEvent::ReconnectFailed {
                    broker: self.name.clone(),
                    attempts,
                });
                return None;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.options.reconnect_interval) => {}
            }
            attempts += 1;

            match self.transport.connect(&self.options.url).await {
                Ok(connection) => {
                    let mut state = self.state.lock().await;
                    state.connection = Some(Arc::clone(&connection));
                    self.set_status(ConnectionStatus::Connected);
                    drop(state);
                    info!(broker = %self.name, attempts, "Reconnected to broker");
                    self.emit(ConnectionEvent::Reconnected {
                        broker: self.name.clone(),
                        attempts,
                    });
                    return Some(connection);
                }
                Err(e) => {
                    warn!(broker = %self.name, attempt = attempts, error = %e, "Reconnection attempt failed");
                }
            }
        }
    }

    async fn close(&self) {
        let (connection, pool) = {
            let mut state = self.state.lock().await;
            self.set_status(ConnectionStatus::Closed);
            (state.connection.take(), std::mem::take(&mut state.pool))
        };
        for session in pool {
            session.close().await;
        }
        if let Some(connection) = connection {
            connection.close().await;
            debug!(broker = %self.name, "Closed broker connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBroker, QueueDeclaration};

    fn manager(broker: &MemoryBroker, options: BrokerOptions) -> ConnectionManager {
        ConnectionManager::new().with_broker("main", Arc::new(broker.clone()), options)
    }

    fn fast() -> BrokerOptions {
        BrokerOptions::new("memory://test").with_reconnect_interval(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_connects_lazily() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, fast());
        assert_eq!(broker.connection_count(), 0);
        assert_eq!(manager.status("main"), Some(ConnectionStatus::Disconnected));

        let name: TransportResult<String> = manager
            .with_session("main", |session| async move {
                session
                    .declare_queue(&QueueDeclaration {
                        name: Some("work".into()),
                        ..Default::default()
                    })
                    .await
            })
            .await;
        assert_eq!(name.unwrap(), "work");
        assert_eq!(broker.connection_count(), 1);
        assert_eq!(manager.status("main"), Some(ConnectionStatus::Connected));
    }

    #[tokio::test]
    async fn test_unknown_broker() {
        let manager = ConnectionManager::new();
        assert!(matches!(
            manager.connect("nope").await,
            Err(TransportError::UnknownBroker(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_and_fails_fast_meanwhile() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, fast());
        let mut events = manager.subscribe_events();
        tokio_test::assert_ok!(manager.connect("main").await);
        assert!(matches!(events.recv().await, Ok(ConnectionEvent::Connected { .. })));

        broker.set_available(false);
        broker.disconnect_all("restart");
        assert!(matches!(events.recv().await, Ok(ConnectionEvent::Lost { ref reason, .. }) if reason == "restart"));

        assert!(matches!(
            manager.session("main").await,
            Err(TransportError::NotConnected { .. })
        ));

        tokio::time::sleep(Duration::from_millis(250)).await;
        broker.set_available(true);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, ConnectionEvent::Reconnected { attempts, .. } if attempts >= 3));
        assert_eq!(manager.status("main"), Some(ConnectionStatus::Connected));
        assert!(manager.session("main").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_callers_during_connection_loss_leave_reconnect_to_supervisor() {
        let broker = MemoryBroker::new();
        let manager = Arc::new(manager(
            &broker,
            BrokerOptions::new("memory://test").with_reconnect_interval(Duration::from_millis(20)),
        ));
        let mut events = manager.subscribe_events();
        tokio_test::assert_ok!(manager.connect("main").await);

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    for _ in 0..200 {
                        let _ = manager.connect("main").await;
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        broker.disconnect_all("restart");
        for caller in callers {
            caller.await.unwrap();
        }

        let mut lost = 0;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                ConnectionEvent::Lost { .. } => lost += 1,
                ConnectionEvent::Reconnected { .. } => break,
                _ => {}
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(lost, 1);
        assert_eq!(broker.connection_count(), 1);
        assert_eq!(manager.status("main"), Some(ConnectionStatus::Connected));
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, ConnectionEvent::Lost { .. } | ConnectionEvent::Reconnected { .. }),
                "unexpected {event:?}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, fast().with_max_reconnect_attempts(2));
        let mut events = manager.subscribe_events();
        tokio_test::assert_ok!(manager.connect("main").await);

        broker.set_available(false);
        broker.disconnect_all("gone");

        loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::ReconnectFailed { attempts, .. } => {
                    assert_eq!(attempts, 2);
                    break;
                }
                _ => continue,
            }
        }
        assert_eq!(manager.status("main"), Some(ConnectionStatus::Failed));
    }

    #[tokio::test]
    async fn test_shared_sessions_are_pooled() {
        let broker = MemoryBroker::new().with_shared_sessions(true);
        let manager = manager(&broker, fast().with_session_pool_size(2));

        let a = manager.session("main").await.unwrap();
        let b = manager.session("main").await.unwrap();
        let c = manager.session("main").await.unwrap();
        assert!(a.is_pooled() && b.is_pooled() && c.is_pooled());
        assert!(Arc::ptr_eq(c.session(), a.session()) || Arc::ptr_eq(c.session(), b.session()));
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, fast());
        manager.connect("main").await.unwrap();

        manager.shutdown().await;
        assert_eq!(broker.connection_count(), 0);
        assert!(matches!(
            manager.connect("main").await,
            Err(TransportError::ShuttingDown)
        ));
    }
}
