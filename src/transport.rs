// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport
//!
//! The `Transport` is the entry point of the crate. It owns the connection manager and
//! a registry of named channel handles, and wires the two together: every time the
//! connection is (re)established each registered channel is reopened and replays its
//! setup chain; when the connection drops the channels are reset; when the connection
//! is closed for good every outstanding RPC is rejected.
//!
//! All messaging patterns are built from the factories exposed here.
//!
//! ```ignore
//! let transport = Transport::new(TransportConfig::new(url), Arc::new(LapinBroker::new()))?;
//! let client = transport.rpc_client("fib", RpcClientOptions::default());
//! transport.connect().await?;
//! transport.ready().await?;
//! let n: u64 = client.call(&json!({"n": 8})).await?;
//! ```

use crate::{
    broker::Broker,
    channel::{ChannelHandle, ChannelRegistry, InitId},
    command::{
        CommandOptions, CommandResultRecipient, CommandSender, CommandServerOptions,
    },
    config::{TransportConfig, DEFAULT_CHANNEL_NAME},
    connection::{ConnectionEvent, ConnectionManager},
    consumer::{ConsumeHandler, Consumer, ConsumerHandle, ConsumerOptions},
    errors::AmqpError,
    pending::PendingTable,
    producer::{Producer, ProducerOptions},
    pubsub::Publisher,
    rpc_client::{RpcClient, RpcClientOptions},
    rpc_server::{RpcHandler, RpcServerOptions},
    topology::Topology,
};
use futures_util::future::join_all;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, warn};

const EVENTS_CAPACITY: usize = 64;

/// Notifications for observers of the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Every channel finished its setup chain on the current connection
    Ready,
    /// A channel failed to initialize
    Error(AmqpError),
    /// The transport is closed for good
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
enum ReadyState {
    Pending,
    Ready,
    Failed(AmqpError),
    Closed,
}

#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    config: TransportConfig,
    connection: ConnectionManager,
    channels: ChannelRegistry,
    events: broadcast::Sender<TransportEvent>,
    ready: watch::Sender<ReadyState>,
    pending: Mutex<Vec<Weak<PendingTable>>>,
    closed: AtomicBool,
    closed_emitted: AtomicBool,
}

impl Transport {
    /// Validates the configuration and builds an unconnected transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: TransportConfig, broker: Arc<dyn Broker>) -> Result<Transport, AmqpError> {
        config.validate()?;

        let connection = ConnectionManager::new(&config, broker);
        let connection_events = connection.subscribe();
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let (ready, _) = watch::channel(ReadyState::Pending);

        let transport = Transport {
            inner: Arc::new(TransportInner {
                config,
                connection,
                channels: Arc::new(Mutex::new(HashMap::new())),
                events,
                ready,
                pending: Mutex::new(vec![]),
                closed: AtomicBool::new(false),
                closed_emitted: AtomicBool::new(false),
            }),
        };

        transport.channel(DEFAULT_CHANNEL_NAME);
        tokio::spawn(lifecycle(Arc::downgrade(&transport.inner), connection_events));

        Ok(transport)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Connects to the broker. Resolves immediately when already connected.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::TransportClosed);
        }
        self.inner.connection.connect().await
    }

    /// Resolves once every channel finished its first setup chain.
    ///
    /// The outcome is settled once and replayed to every caller: the first channel
    /// initialization error, or `TransportClosed` if the transport closed before
    /// becoming ready.
    pub async fn ready(&self) -> Result<(), AmqpError> {
        let mut ready = self.inner.ready.subscribe();
        loop {
            match &*ready.borrow_and_update() {
                ReadyState::Pending => {}
                ReadyState::Ready => return Ok(()),
                ReadyState::Failed(err) => return Err(err.clone()),
                ReadyState::Closed => return Err(AmqpError::TransportClosed),
            }

            if ready.changed().await.is_err() {
                return Err(AmqpError::TransportClosed);
            }
        }
    }

    /// Returns the named channel, creating it on first use.
    ///
    /// A channel created while connected is opened right away.
    pub fn channel(&self, name: &str) -> ChannelHandle {
        let (handle, created) = {
            let mut channels = self.inner.channels.lock().unwrap_or_else(|e| e.into_inner());
            match channels.get(name) {
                Some(handle) => (handle.clone(), false),
                None => {
                    let handle = ChannelHandle::new(
                        name,
                        self.inner.config.channel_settings.effective(name),
                        &self.inner.channels,
                        self.inner.events.clone(),
                    );
                    channels.insert(name.to_owned(), handle.clone());
                    (handle, true)
                }
            }
        };

        if created {
            debug!(channel = name, "channel registered");
            if let Some((generation, connection)) = self.inner.connection.connection() {
                let _ = handle.open(generation, connection);
            }
        }

        handle
    }

    /// Registers a setup action on the default channel.
    pub fn add_init<F, Fut>(&self, action: F) -> InitId
    where
        F: Fn(ChannelHandle) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), AmqpError>> + Send + 'static,
    {
        self.channel(DEFAULT_CHANNEL_NAME).add_init(action)
    }

    /// Installs a topology on the named channel; it is re-asserted on every reopen.
    pub fn install(&self, channel_name: &str, topology: Topology) -> InitId {
        topology.install(&self.channel(channel_name))
    }

    pub fn producer(&self, options: ProducerOptions) -> Producer {
        Producer::new(self, options)
    }

    pub fn consumer<H: ConsumeHandler>(&self, options: ConsumerOptions, handler: H) -> ConsumerHandle {
        Consumer::start(self, options, Arc::new(handler))
    }

    pub fn rpc_client(&self, exchange: &str, options: RpcClientOptions) -> RpcClient {
        RpcClient::new(self, exchange, options)
    }

    pub fn rpc_server<H: RpcHandler>(
        &self,
        exchange: &str,
        options: RpcServerOptions,
        handler: H,
    ) -> ConsumerHandle {
        crate::rpc_server::start(self, exchange, options, Arc::new(handler))
    }

    pub fn publisher(&self, exchange: &str) -> Publisher {
        Publisher::new(self, exchange)
    }

    pub fn subscriber<H: ConsumeHandler>(&self, exchange: &str, handler: H) -> ConsumerHandle {
        crate::pubsub::subscribe(self, exchange, Arc::new(handler))
    }

    pub fn command_sender(&self, exchange: &str, options: CommandOptions) -> CommandSender {
        CommandSender::new(self, exchange, options)
    }

    pub fn command_server<H: RpcHandler>(
        &self,
        exchange: &str,
        options: CommandServerOptions,
        handler: H,
    ) -> ConsumerHandle {
        crate::command::serve(self, exchange, options, Arc::new(handler))
    }

    pub fn command_result_recipient<R, E>(
        &self,
        exchange: &str,
        options: CommandOptions,
        on_result: R,
        on_error: E,
    ) -> CommandResultRecipient
    where
        R: ConsumeHandler,
        E: ConsumeHandler,
    {
        CommandResultRecipient::new(self, exchange, options, Arc::new(on_result), Arc::new(on_error))
    }

    /// Closes every channel and the connection, then rejects every outstanding RPC
    /// with `TransportClosed`.
    ///
    /// Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing transport");

        let handles: Vec<ChannelHandle> = {
            let mut channels = self.inner.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            if let Err(err) = handle.close().await {
                warn!(channel = handle.name(), error = err.to_string(), "error closing channel");
            }
        }

        let result = self.inner.connection.close().await;
        self.inner.finish();
        result
    }

    /// Registers an RPC table so it is failed when the transport closes.
    pub(crate) fn register_pending(&self, table: &Arc<PendingTable>) {
        if self.inner.closed.load(Ordering::SeqCst) {
            table.reject_all(AmqpError::TransportClosed);
            return;
        }

        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.retain(|table| table.strong_count() > 0);
        pending.push(Arc::downgrade(table));
    }

    pub(crate) fn reconnect_enabled(&self) -> bool {
        self.inner.config.reconnect
    }
}

impl TransportInner {
    fn handles(&self) -> Vec<ChannelHandle> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Terminal close: fails outstanding requests, settles `ready`, notifies observers.
    fn finish(&self) {
        let tables: Vec<Weak<PendingTable>> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain(..).collect()
        };
        for table in tables.iter().filter_map(Weak::upgrade) {
            table.reject_all(AmqpError::TransportClosed);
        }

        self.ready.send_if_modified(|state| {
            if *state == ReadyState::Pending {
                *state = ReadyState::Closed;
                true
            } else {
                false
            }
        });

        if !self.closed_emitted.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed);
        }
    }

    fn settle_ready(&self, outcome: Result<(), AmqpError>) {
        if let Err(err) = &outcome {
            error!(error = err.to_string(), "transport failed to become ready");
        }

        self.ready.send_if_modified(|state| {
            if *state != ReadyState::Pending {
                return false;
            }
            *state = match &outcome {
                Ok(()) => ReadyState::Ready,
                Err(err) => ReadyState::Failed(err.clone()),
            };
            true
        });

        if outcome.is_ok() {
            let _ = self.events.send(TransportEvent::Ready);
        }
    }
}

async fn lifecycle(inner: Weak<TransportInner>, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "connection events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            ConnectionEvent::Connected {
                generation,
                connection,
            } => {
                let opens: Vec<_> = inner
                    .handles()
                    .iter()
                    .map(|handle| handle.open(generation, connection.clone()))
                    .collect();
                let inner = Arc::downgrade(&inner);

                tokio::spawn(async move {
                    let mut outcome = Ok(());
                    for result in join_all(opens).await {
                        // a dropped sender means the channel was closed meanwhile
                        if let Ok(Err(err)) = result {
                            if outcome.is_ok() {
                                outcome = Err(err);
                            }
                        }
                    }

                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    // a drop mid-setup fails the chain; the next connection settles instead
                    if inner.connection.connection().map(|(current, _)| current) != Some(generation) {
                        debug!(generation, ok = outcome.is_ok(), "setup superseded by a newer connection");
                        return;
                    }
                    debug!(generation, ok = outcome.is_ok(), "channels opened");
                    inner.settle_ready(outcome);
                });
            }
            ConnectionEvent::Disconnected => {
                for handle in inner.handles() {
                    handle.reset();
                }
            }
            ConnectionEvent::Closed => {
                for handle in inner.handles() {
                    handle.reset();
                }
                inner.finish();
                break;
            }
        }
    }
}
