// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Handles
//!
//! A `ChannelHandle` owns one named logical channel multiplexed over the transport's
//! connection. It keeps the ordered list of setup actions (exchange, queue, binding
//! and consumer declarations) that must run every time the underlying broker channel
//! is (re)opened, and exposes the broker operations as pass-throughs that fail with
//! `NotConnected` while no live channel exists.
//!
//! Setup actions are executed by a single worker task per handle, which drains a FIFO
//! command queue. Opening a channel and running an action registered on an already
//! open channel are both commands, so actions never interleave and always run in
//! registration order, within one open cycle and across reopen cycles.
//!
//! ```text
//! Unopened --open--> Opening --setup chain ok--> Ready
//!                       |                          |
//!                       +--action failed--> Failed |
//!    ^                                             |
//!    +------------- connection dropped ------------+
//! ```

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, ConsumeOptions, DeliveryStream, MessageProperties,
        QueueStatus,
    },
    config::PrefetchSettings,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::TransportEvent,
};
use futures_util::future::BoxFuture;
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, Weak},
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error};

/// Future returned by a setup action.
pub type SetupFuture = BoxFuture<'static, Result<(), AmqpError>>;

type SetupAction = Arc<dyn Fn(ChannelHandle) -> SetupFuture + Send + Sync>;

pub(crate) type ChannelRegistry = Arc<Mutex<HashMap<String, ChannelHandle>>>;

/// Identifies a registered setup action, see [`ChannelHandle::remove_init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InitId(u64);

/// Lifecycle of a channel handle.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelStatus {
    Unopened,
    Opening,
    Ready,
    Failed(AmqpError),
    Closed,
}

enum Command {
    Open {
        generation: u64,
        connection: Arc<dyn BrokerConnection>,
        done: oneshot::Sender<Result<(), AmqpError>>,
    },
    Run {
        id: u64,
    },
    Shutdown,
}

/// Handle to one named channel. Cloning is cheap and every clone refers to the same channel.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: String,
    settings: PrefetchSettings,
    shared: Mutex<ChannelShared>,
    // only written while `shared` is held
    status: watch::Sender<ChannelStatus>,
    commands: mpsc::UnboundedSender<Command>,
    registry: Weak<Mutex<HashMap<String, ChannelHandle>>>,
    events: broadcast::Sender<TransportEvent>,
}

struct ChannelShared {
    generation: u64,
    live: Option<Arc<dyn BrokerChannel>>,
    inits: Vec<(u64, SetupAction)>,
    next_init: u64,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

impl ChannelHandle {
    /// Creates the handle and spawns its setup worker.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn new(
        name: &str,
        settings: PrefetchSettings,
        registry: &ChannelRegistry,
        events: broadcast::Sender<TransportEvent>,
    ) -> ChannelHandle {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ChannelStatus::Unopened);

        let handle = ChannelHandle {
            inner: Arc::new(ChannelInner {
                name: name.to_owned(),
                settings,
                shared: Mutex::new(ChannelShared {
                    generation: 0,
                    live: None,
                    inits: vec![],
                    next_init: 0,
                }),
                status,
                commands,
                registry: Arc::downgrade(registry),
                events,
            }),
        };

        tokio::spawn(run_worker(Arc::downgrade(&handle.inner), receiver));

        handle
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn settings(&self) -> PrefetchSettings {
        self.inner.settings
    }

    pub fn status(&self) -> ChannelStatus {
        self.inner.status.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.status() == ChannelStatus::Ready
    }

    /// Registers a setup action.
    ///
    /// The action runs, after every action registered before it, each time the channel
    /// is opened. If the channel is already open it is also queued to run right away,
    /// behind whatever setup work is in flight.
    pub fn add_init<F, Fut>(&self, action: F) -> InitId
    where
        F: Fn(ChannelHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AmqpError>> + Send + 'static,
    {
        let action: SetupAction = Arc::new(move |channel| Box::pin(action(channel)));

        let mut shared = self.lock();
        let id = shared.next_init;
        shared.next_init += 1;
        shared.inits.push((id, action));

        // while Opening the in-flight open sequence picks the action up itself
        if *self.inner.status.borrow() == ChannelStatus::Ready {
            let _ = self.inner.commands.send(Command::Run { id });
        }

        InitId(id)
    }

    /// Unregisters a setup action; it will not run on later opens.
    pub fn remove_init(&self, id: InitId) {
        self.lock().inits.retain(|(registered, _)| *registered != id.0);
    }

    /// Waits until the setup chain has completed on a live channel.
    pub async fn opened(&self) -> Result<(), AmqpError> {
        let mut status = self.inner.status.subscribe();
        loop {
            match &*status.borrow_and_update() {
                ChannelStatus::Ready => return Ok(()),
                ChannelStatus::Closed => return Err(self.not_connected()),
                _ => {}
            }

            if status.changed().await.is_err() {
                return Err(self.not_connected());
            }
        }
    }

    /// Queues an open of the broker channel on the given connection.
    ///
    /// Opening twice for the same connection generation is a no-op.
    pub(crate) fn open(
        &self,
        generation: u64,
        connection: Arc<dyn BrokerConnection>,
    ) -> oneshot::Receiver<Result<(), AmqpError>> {
        let (done, receiver) = oneshot::channel();
        let _ = self.inner.commands.send(Command::Open {
            generation,
            connection,
            done,
        });
        receiver
    }

    /// Drops the live channel after the connection went away.
    pub(crate) fn reset(&self) {
        let mut shared = self.lock();
        shared.live = None;
        if *self.inner.status.borrow() != ChannelStatus::Closed {
            self.inner.status.send_replace(ChannelStatus::Unopened);
        }
    }

    /// Closes the broker channel and removes the handle from the transport's registry.
    ///
    /// Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let live = {
            let mut shared = self.lock();
            if *self.inner.status.borrow() == ChannelStatus::Closed {
                return Ok(());
            }
            self.inner.status.send_replace(ChannelStatus::Closed);
            shared.inits.clear();
            shared.live.take()
        };

        debug!(channel = self.inner.name, "closing channel");
        let _ = self.inner.commands.send(Command::Shutdown);

        if let Some(registry) = self.inner.registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
            if registry
                .get(&self.inner.name)
                .is_some_and(|registered| Arc::ptr_eq(&registered.inner, &self.inner))
            {
                registry.remove(&self.inner.name);
            }
        }

        match live {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }

    pub async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!(
            channel = self.inner.name,
            exchange = def.name,
            kind = ?def.kind,
            "assert exchange"
        );
        self.live()?.assert_exchange(def).await
    }

    /// Declares a queue and returns its actual (possibly broker generated) name.
    pub async fn assert_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!(channel = self.inner.name, queue = def.name, "assert queue");
        self.live()?.assert_queue(def).await
    }

    pub async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            channel = self.inner.name,
            queue = binding.queue_name,
            exchange = binding.exchange_name,
            routing_key = binding.routing_key,
            "bind queue"
        );
        self.live()?.bind_queue(binding).await
    }

    /// Reports the ready message and consumer counts of an existing queue.
    pub async fn check_queue(&self, queue: &str) -> Result<QueueStatus, AmqpError> {
        debug!(channel = self.inner.name, queue, "check queue");
        self.live()?.check_queue(queue).await
    }

    /// Returns the number of purged messages.
    pub async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        debug!(channel = self.inner.name, queue, "purge queue");
        self.live()?.purge_queue(queue).await
    }

    pub async fn delete_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        debug!(channel = self.inner.name, queue, "delete queue");
        self.live()?.delete_queue(queue).await
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        self.live()?
            .publish(exchange, routing_key, content, properties)
            .await
    }

    /// Publishes straight to a queue through the default exchange.
    pub async fn send_to_queue(
        &self,
        queue: &str,
        content: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        self.publish("", queue, content, properties).await
    }

    pub async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        debug!(channel = self.inner.name, queue, "consume");
        self.live()?.consume(queue, options).await
    }

    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        debug!(channel = self.inner.name, consumer_tag, "cancel");
        self.live()?.cancel(consumer_tag).await
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.live()?.ack(delivery_tag).await
    }

    pub async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.live()?.nack(delivery_tag, requeue).await
    }

    pub async fn prefetch(&self, count: u16, global: bool) -> Result<(), AmqpError> {
        self.live()?.prefetch(count, global).await
    }

    /// Generation of the connection the channel was last opened on.
    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Like `live`, but only while the channel is still the one opened for `generation`.
    ///
    /// Delivery tags are scoped to the broker channel that issued them, so settling a
    /// delivery must not go through a channel reopened since.
    pub(crate) fn live_at(&self, generation: u64) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let shared = self.lock();
        if shared.generation != generation {
            return Err(self.not_connected());
        }
        match (&*self.inner.status.borrow(), &shared.live) {
            (ChannelStatus::Opening | ChannelStatus::Ready, Some(channel)) => Ok(channel.clone()),
            _ => Err(self.not_connected()),
        }
    }

    fn live(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let shared = self.lock();
        match (&*self.inner.status.borrow(), &shared.live) {
            (ChannelStatus::Opening | ChannelStatus::Ready, Some(channel)) => Ok(channel.clone()),
            _ => Err(self.not_connected()),
        }
    }

    fn not_connected(&self) -> AmqpError {
        AmqpError::NotConnected(self.inner.name.clone())
    }

    fn init_error(&self, err: &AmqpError) -> AmqpError {
        match err {
            AmqpError::ChannelInitError { .. } => err.clone(),
            other => AmqpError::ChannelInitError {
                channel: self.inner.name.clone(),
                reason: other.to_string(),
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelShared> {
        self.inner.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_current(&self, shared: &ChannelShared, generation: u64, expected: &ChannelStatus) -> bool {
        shared.generation == generation && *self.inner.status.borrow() == *expected
    }

    async fn open_sequence(
        &self,
        generation: u64,
        connection: Arc<dyn BrokerConnection>,
    ) -> Result<(), AmqpError> {
        {
            let mut shared = self.lock();
            let status = self.status();
            if status == ChannelStatus::Closed {
                return Err(self.not_connected());
            }
            if shared.generation == generation
                && matches!(status, ChannelStatus::Opening | ChannelStatus::Ready)
            {
                return Ok(());
            }
            shared.generation = generation;
            shared.live = None;
            self.inner.status.send_replace(ChannelStatus::Opening);
        }

        debug!(channel = self.inner.name, generation, "opening channel");

        let channel = connection
            .create_channel()
            .await
            .map_err(|err| self.init_error(&err))?;

        let PrefetchSettings { count, global } = self.inner.settings;
        debug!(channel = self.inner.name, count, global, "setting prefetch");
        channel
            .prefetch(count, global)
            .await
            .map_err(|err| self.init_error(&err))?;

        let stale = {
            let mut shared = self.lock();
            if self.is_current(&shared, generation, &ChannelStatus::Opening) {
                shared.live = Some(channel.clone());
                false
            } else {
                true
            }
        };
        if stale {
            let _ = channel.close().await;
            return Err(self.not_connected());
        }

        let mut last_run: Option<u64> = None;
        loop {
            let (id, action) = {
                let shared = self.lock();
                if !self.is_current(&shared, generation, &ChannelStatus::Opening) {
                    return Err(self.not_connected());
                }

                let next = shared
                    .inits
                    .iter()
                    .find(|(id, _)| last_run.map_or(true, |last| *id > last));

                match next {
                    Some((id, action)) => (*id, action.clone()),
                    None => {
                        self.inner.status.send_replace(ChannelStatus::Ready);
                        debug!(channel = self.inner.name, generation, "channel ready");
                        return Ok(());
                    }
                }
            };

            action(self.clone())
                .await
                .map_err(|err| self.init_error(&err))?;

            last_run = Some(id);
        }
    }

    async fn run_registered(&self, id: u64) -> Result<(), (u64, AmqpError)> {
        let (generation, action) = {
            let shared = self.lock();
            if *self.inner.status.borrow() != ChannelStatus::Ready {
                // runs with the next open instead
                return Ok(());
            }
            match shared.inits.iter().find(|(registered, _)| *registered == id) {
                Some((_, action)) => (shared.generation, action.clone()),
                None => return Ok(()),
            }
        };

        action(self.clone())
            .await
            .map_err(|err| (generation, self.init_error(&err)))
    }

    /// Marks the channel failed if `generation` is still the one being set up.
    fn fail(&self, generation: u64, err: &AmqpError) {
        let failed = {
            let shared = self.lock();
            let status = self.status();
            if shared.generation == generation
                && matches!(status, ChannelStatus::Opening | ChannelStatus::Ready)
            {
                self.inner.status.send_replace(ChannelStatus::Failed(err.clone()));
                true
            } else {
                false
            }
        };

        if failed {
            error!(
                channel = self.inner.name,
                error = err.to_string(),
                "error during channel initialization"
            );
            let _ = self.inner.events.send(TransportEvent::Error(err.clone()));
        }
    }
}

async fn run_worker(inner: Weak<ChannelInner>, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let handle = ChannelHandle { inner };

        match command {
            Command::Open {
                generation,
                connection,
                done,
            } => {
                let result = handle.open_sequence(generation, connection).await;
                if let Err(err) = &result {
                    handle.fail(generation, err);
                }
                let _ = done.send(result);
            }
            Command::Run { id } => {
                if let Err((generation, err)) = handle.run_registered(id).await {
                    handle.fail(generation, &err);
                }
            }
            Command::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::Broker, memory::MemoryBroker};
    use std::time::Duration;

    fn new_handle(name: &str) -> (ChannelHandle, ChannelRegistry) {
        let registry: ChannelRegistry = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(16);
        let handle = ChannelHandle::new(name, PrefetchSettings::default(), &registry, events);
        registry
            .lock()
            .unwrap()
            .insert(name.to_owned(), handle.clone());
        (handle, registry)
    }

    fn tracing_action(
        trace: &Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
    ) -> impl Fn(ChannelHandle) -> BoxFuture<'static, Result<(), AmqpError>> + Send + Sync {
        let trace = trace.clone();
        move |_| {
            let trace = trace.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                trace.lock().unwrap().push(label);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn operations_fail_before_open() {
        let (handle, _registry) = new_handle("alpha");

        let err = handle
            .assert_queue(&QueueDefinition::new("q"))
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::NotConnected("alpha".to_owned()));
    }

    #[tokio::test]
    async fn setup_actions_replay_in_order_on_every_open() {
        let broker = MemoryBroker::new();
        let (handle, _registry) = new_handle("default");
        let trace = Arc::new(Mutex::new(vec![]));

        handle.add_init(tracing_action(&trace, "a"));
        handle.add_init(tracing_action(&trace, "b"));

        let conn = broker.connect("memory://").await.unwrap();
        handle.open(1, conn).await.unwrap().unwrap();
        assert!(handle.is_open());

        // registered on an open channel: runs right away, after everything before it
        handle.add_init(tracing_action(&trace, "c"));
        handle.add_init(tracing_action(&trace, "d"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*trace.lock().unwrap(), vec!["a", "b", "c", "d"]);

        handle.reset();
        assert_eq!(handle.status(), ChannelStatus::Unopened);

        let conn = broker.connect("memory://").await.unwrap();
        handle.open(2, conn).await.unwrap().unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["a", "b", "c", "d", "a", "b", "c", "d"]
        );
    }

    #[tokio::test]
    async fn actions_added_while_opening_run_once() {
        let broker = MemoryBroker::new();
        let (handle, _registry) = new_handle("default");
        let trace = Arc::new(Mutex::new(vec![]));

        handle.add_init(tracing_action(&trace, "a"));
        let conn = broker.connect("memory://").await.unwrap();
        let opened = handle.open(1, conn);
        handle.add_init(tracing_action(&trace, "b"));
        opened.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(*trace.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn reopening_same_generation_is_noop() {
        let broker = MemoryBroker::new();
        let (handle, _registry) = new_handle("default");
        let trace = Arc::new(Mutex::new(vec![]));
        handle.add_init(tracing_action(&trace, "a"));

        let conn = broker.connect("memory://").await.unwrap();
        let first = handle.open(1, conn.clone());
        let second = handle.open(1, conn);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(*trace.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn failing_action_marks_channel_failed_and_stops_chain() {
        let broker = MemoryBroker::new();
        let (handle, _registry) = new_handle("default");
        let trace = Arc::new(Mutex::new(vec![]));
        let failed_once = Arc::new(std::sync::atomic::AtomicBool::new(false));

        handle.add_init(tracing_action(&trace, "a"));
        handle.add_init(move |_| {
            let first = !failed_once.swap(true, std::sync::atomic::Ordering::SeqCst);
            async move {
                if first {
                    Err(AmqpError::DeclareQueueError("q".to_owned()))
                } else {
                    Ok(())
                }
            }
        });
        handle.add_init(tracing_action(&trace, "c"));

        let conn = broker.connect("memory://").await.unwrap();
        let err = handle.open(1, conn).await.unwrap().unwrap_err();

        assert!(matches!(err, AmqpError::ChannelInitError { ref channel, .. } if channel == "default"));
        assert!(matches!(handle.status(), ChannelStatus::Failed(_)));
        assert_eq!(*trace.lock().unwrap(), vec!["a"]);
        assert!(handle
            .publish("", "q", vec![], MessageProperties::default())
            .await
            .is_err());

        // the handle stays usable for the next open
        let conn = broker.connect("memory://").await.unwrap();
        handle.open(2, conn).await.unwrap().unwrap();
        assert!(handle.is_open());
        assert_eq!(*trace.lock().unwrap(), vec!["a", "a", "c"]);
    }

    #[tokio::test]
    async fn removed_actions_do_not_replay() {
        let broker = MemoryBroker::new();
        let (handle, _registry) = new_handle("default");
        let trace = Arc::new(Mutex::new(vec![]));

        handle.add_init(tracing_action(&trace, "a"));
        let id = handle.add_init(tracing_action(&trace, "b"));
        handle.remove_init(id);

        let conn = broker.connect("memory://").await.unwrap();
        handle.open(1, conn).await.unwrap().unwrap();
        assert_eq!(*trace.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn close_deregisters_and_is_idempotent() {
        let broker = MemoryBroker::new();
        let (handle, registry) = new_handle("alpha");
        let conn = broker.connect("memory://").await.unwrap();
        handle.open(1, conn).await.unwrap().unwrap();

        handle.close().await.unwrap();
        handle.close().await.unwrap();

        assert_eq!(handle.status(), ChannelStatus::Closed);
        assert!(registry.lock().unwrap().is_empty());
        assert_eq!(
            handle.opened().await,
            Err(AmqpError::NotConnected("alpha".to_owned()))
        );
    }

    #[tokio::test]
    async fn queue_maintenance_goes_through_the_live_channel() {
        let broker = MemoryBroker::new();
        let (handle, _registry) = new_handle("ops");
        assert_eq!(
            handle.purge_queue("backlog").await,
            Err(AmqpError::NotConnected("ops".to_owned()))
        );

        let conn = broker.connect("memory://").await.unwrap();
        handle.open(1, conn).await.unwrap().unwrap();
        handle.assert_queue(&QueueDefinition::new("backlog")).await.unwrap();
        handle
            .send_to_queue("backlog", b"1".to_vec(), MessageProperties::default())
            .await
            .unwrap();

        let status = handle.check_queue("backlog").await.unwrap();
        assert_eq!((status.message_count, status.consumer_count), (1, 0));
        assert_eq!(handle.purge_queue("backlog").await, Ok(1));
        assert_eq!(handle.delete_queue("backlog").await, Ok(0));
        assert!(!broker.has_queue("backlog"));
    }

    #[tokio::test]
    async fn live_at_rejects_other_generations() {
        let broker = MemoryBroker::new();
        let (handle, _registry) = new_handle("default");

        let conn = broker.connect("memory://").await.unwrap();
        handle.open(1, conn).await.unwrap().unwrap();
        assert_eq!(handle.generation(), 1);
        assert!(handle.live_at(1).is_ok());

        handle.reset();
        assert!(handle.live_at(1).is_err());

        let conn = broker.connect("memory://").await.unwrap();
        handle.open(2, conn).await.unwrap().unwrap();
        assert_eq!(
            handle.live_at(1).err(),
            Some(AmqpError::NotConnected("default".to_owned()))
        );
        assert!(handle.live_at(2).is_ok());
    }
}
