// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the single broker connection of a transport. Connect attempts are serialized,
//! `connect` is idempotent and, when reconnection is enabled, retries forever with a
//! fixed interval. A watcher task per live connection notices drops and either
//! schedules a reconnect or reports the terminal close.
//!
//! Every successful connect bumps a generation counter. Channel handles use it to tell
//! a fresh connection from a duplicate notification about the one they already use.

use crate::{
    broker::{Broker, BrokerConnection},
    config::TransportConfig,
    errors::AmqpError,
};
use futures_util::future::BoxFuture;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

const EVENTS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle notifications of the connection manager.
#[derive(Clone)]
pub enum ConnectionEvent {
    Connected {
        generation: u64,
        connection: Arc<dyn BrokerConnection>,
    },
    /// The live connection went away; a reconnect may follow.
    Disconnected,
    /// Terminal: no further connection will be made.
    Closed,
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Connected { generation, .. } => f
                .debug_struct("Connected")
                .field("generation", generation)
                .finish(),
            ConnectionEvent::Disconnected => f.write_str("Disconnected"),
            ConnectionEvent::Closed => f.write_str("Closed"),
        }
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    broker: Arc<dyn Broker>,
    url: String,
    reconnect_interval: Duration,
    reconnect: AtomicBool,
    closing: AtomicBool,
    closed_emitted: AtomicBool,
    shared: Mutex<ManagerShared>,
    connecting: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
}

struct ManagerShared {
    state: ConnectionState,
    live: Option<Arc<dyn BrokerConnection>>,
    generation: u64,
}

impl ConnectionManager {
    pub fn new(config: &TransportConfig, broker: Arc<dyn Broker>) -> ConnectionManager {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        ConnectionManager {
            inner: Arc::new(ManagerInner {
                broker,
                url: config.url.clone(),
                reconnect_interval: config.reconnect_interval(),
                reconnect: AtomicBool::new(config.reconnect),
                closing: AtomicBool::new(false),
                closed_emitted: AtomicBool::new(false),
                shared: Mutex::new(ManagerShared {
                    state: ConnectionState::Disconnected,
                    live: None,
                    generation: 0,
                }),
                connecting: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of successful connects so far.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// The live connection and its generation, if connected.
    pub fn connection(&self) -> Option<(u64, Arc<dyn BrokerConnection>)> {
        let shared = self.lock();
        shared
            .live
            .as_ref()
            .map(|conn| (shared.generation, conn.clone()))
    }

    /// Connects unless already connected.
    ///
    /// With reconnection enabled failures are logged and retried after the reconnect
    /// interval until a connect succeeds or the manager is closed. Otherwise the first
    /// failure is returned.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        loop {
            if self.connection().is_some() {
                return Ok(());
            }

            let attempt = {
                let _guard = self.inner.connecting.lock().await;
                if self.connection().is_some() {
                    return Ok(());
                }
                if self.is_closing() {
                    return Err(AmqpError::TransportClosed);
                }

                self.lock().state = ConnectionState::Connecting;
                debug!(url = self.inner.url, "connecting to broker");

                match self.inner.broker.connect(&self.inner.url).await {
                    Ok(conn) => self.install(conn).await,
                    Err(err) => {
                        self.lock().state = ConnectionState::Disconnected;
                        Err(err)
                    }
                }
            };

            match attempt {
                Ok(()) => return Ok(()),
                Err(AmqpError::TransportClosed) => return Err(AmqpError::TransportClosed),
                Err(err) if self.inner.reconnect.load(Ordering::SeqCst) => {
                    warn!(
                        error = err.to_string(),
                        retry_in_ms = self.inner.reconnect_interval.as_millis() as u64,
                        "failure to connect, retrying"
                    );
                    tokio::time::sleep(self.inner.reconnect_interval).await;
                }
                Err(err) => {
                    error!(error = err.to_string(), "failure to connect");
                    return Err(err);
                }
            }
        }
    }

    /// Disables reconnection, closes the live connection and reports `Closed`.
    ///
    /// Safe to call repeatedly; `Closed` is reported once.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.inner.reconnect.store(false, Ordering::SeqCst);
        self.inner.closing.store(true, Ordering::SeqCst);

        let live = {
            let mut shared = self.lock();
            shared.state = ConnectionState::Disconnected;
            shared.live.take()
        };

        let result = match live {
            Some(conn) => {
                debug!("closing broker connection");
                conn.close().await
            }
            None => Ok(()),
        };

        self.emit_closed();
        result
    }

    async fn install(&self, conn: Arc<dyn BrokerConnection>) -> Result<(), AmqpError> {
        let generation = {
            let mut shared = self.lock();
            if self.is_closing() {
                shared.state = ConnectionState::Disconnected;
                None
            } else {
                shared.generation += 1;
                shared.state = ConnectionState::Connected;
                shared.live = Some(conn.clone());
                Some(shared.generation)
            }
        };

        let Some(generation) = generation else {
            let _ = conn.close().await;
            return Err(AmqpError::TransportClosed);
        };

        debug!(generation, "broker connected");
        tokio::spawn(watch_connection(
            Arc::downgrade(&self.inner),
            conn.clone(),
            generation,
        ));

        let _ = self.inner.events.send(ConnectionEvent::Connected {
            generation,
            connection: conn,
        });

        Ok(())
    }

    // boxed: connect spawns the watcher, which reconnects through here
    fn reconnect(&self) -> BoxFuture<'_, Result<(), AmqpError>> {
        Box::pin(self.connect())
    }

    fn emit_closed(&self) {
        if !self.inner.closed_emitted.swap(true, Ordering::SeqCst) {
            debug!("connection manager closed");
            let _ = self.inner.events.send(ConnectionEvent::Closed);
        }
    }

    fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, ManagerShared> {
        self.inner.shared.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn watch_connection(
    inner: Weak<ManagerInner>,
    conn: Arc<dyn BrokerConnection>,
    generation: u64,
) {
    conn.closed().await;

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let manager = ConnectionManager { inner };

    {
        let mut shared = manager.lock();
        if shared.generation != generation || shared.live.is_none() {
            return;
        }
        shared.live = None;
        shared.state = ConnectionState::Disconnected;
    }

    if manager.is_closing() {
        return;
    }

    let _ = manager.inner.events.send(ConnectionEvent::Disconnected);

    if !manager.inner.reconnect.load(Ordering::SeqCst) {
        warn!(generation, "broker connection lost");
        manager.emit_closed();
        return;
    }

    warn!(
        generation,
        retry_in_ms = manager.inner.reconnect_interval.as_millis() as u64,
        "broker connection lost, reconnecting"
    );
    tokio::time::sleep(manager.inner.reconnect_interval).await;

    if let Err(err) = manager.reconnect().await {
        debug!(error = err.to_string(), "reconnect abandoned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::MockBroker, memory::MemoryBroker};
    use std::sync::atomic::AtomicUsize;

    fn config(reconnect: bool) -> TransportConfig {
        let cfg = TransportConfig::new("memory://");
        if reconnect {
            cfg.reconnect(Duration::from_millis(10))
        } else {
            cfg
        }
    }

    #[tokio::test]
    async fn retries_until_the_broker_accepts() {
        let conn = MemoryBroker::new().connect("memory://").await.unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));

        let mut broker = MockBroker::new();
        let counter = attempts.clone();
        broker.expect_connect().times(3).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AmqpError::ConnectionError("refused".to_owned()))
            } else {
                Ok(conn.clone())
            }
        });

        let manager = ConnectionManager::new(&config(true), Arc::new(broker));
        manager.connect().await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(manager.generation(), 1);
        assert!(manager.is_connected());

        // already connected: no further attempt
        manager.connect().await.unwrap();
    }

    #[tokio::test]
    async fn failure_propagates_without_reconnect() {
        let mut broker = MockBroker::new();
        broker
            .expect_connect()
            .times(1)
            .returning(|_| Err(AmqpError::ConnectionError("refused".to_owned())));

        let manager = ConnectionManager::new(&config(false), Arc::new(broker));

        assert_eq!(
            manager.connect().await,
            Err(AmqpError::ConnectionError("refused".to_owned()))
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn reconnects_after_broker_drop() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(&config(true), Arc::new(broker.clone()));
        let mut events = manager.subscribe();

        manager.connect().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected { generation: 1, .. }
        ));

        broker.drop_connections();

        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Disconnected
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected { generation: 2, .. }
        ));
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn drop_without_reconnect_is_terminal() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(&config(false), Arc::new(broker.clone()));
        let mut events = manager.subscribe();

        manager.connect().await.unwrap();
        events.recv().await.unwrap();
        broker.drop_connections();

        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Disconnected));
        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Closed));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn close_reports_closed_once() {
        let broker = MemoryBroker::new();
        let manager = ConnectionManager::new(&config(true), Arc::new(broker.clone()));
        let mut events = manager.subscribe();

        manager.connect().await.unwrap();
        events.recv().await.unwrap();

        manager.close().await.unwrap();
        manager.close().await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Closed));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(broker.connection_count(), 0);
        assert_eq!(manager.connect().await, Err(AmqpError::TransportClosed));
    }
}
