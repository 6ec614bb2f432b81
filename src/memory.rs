// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! `MemoryBroker` implements the broker capability traits without a network. It is
//! the reference used by the crate's tests and is useful to embedders that want an
//! in-process messaging fabric.
//!
//! Supported semantics:
//! - default, direct, fanout and topic exchanges (headers exchanges route like fanout)
//! - broker-named, exclusive and auto-deleting queues
//! - round-robin dispatch across consumers, manual and automatic acknowledgement
//! - `nack` with requeue (redelivered at the head of the queue) or drop
//! - unacknowledged deliveries are requeued when their channel or connection goes away
//!
//! Tests can simulate outages with [`MemoryBroker::drop_connections`] and
//! [`MemoryBroker::refuse_connections`]. Prefetch limits and message TTLs are accepted
//! but not enforced.

use crate::{
    broker::{
        Broker, BrokerChannel, BrokerConnection, ConsumeOptions, Delivery, DeliveryStream,
        MessageProperties, QueueStatus,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

/// In-process broker. Clones share the same broker state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    refused: usize,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<QueueBinding>,
    connections: HashMap<u64, watch::Sender<bool>>,
    channels: HashMap<u64, ChannelState>,
}

#[derive(Default)]
struct MemoryQueue {
    messages: VecDeque<StoredMessage>,
    consumers: Vec<MemoryConsumer>,
    cursor: usize,
    owner: Option<u64>,
    auto_delete: bool,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    content: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct MemoryConsumer {
    tag: String,
    channel: u64,
    no_ack: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct ChannelState {
    connection: u64,
    next_tag: u64,
    unacked: HashMap<u64, (String, StoredMessage)>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Closes every live connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.close_connection(id);
        }
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: usize) {
        self.lock().refused = count;
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// Number of messages waiting in the queue, not counting unacknowledged ones.
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|queue| queue.messages.len())
    }

    pub fn consumer_count(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|queue| queue.consumers.len())
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.lock();
        if state.refused > 0 {
            state.refused -= 1;
            return Err(AmqpError::ConnectionError(format!(
                "connection to {} refused",
                url
            )));
        }

        let id = state.next_id();
        let (closed, receiver) = watch::channel(false);
        state.connections.insert(id, closed);
        debug!(connection = id, "memory connection opened");

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            closed: receiver,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.id) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                next_tag: 1,
                unacked: HashMap::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            connection: self.id,
        }))
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.lock().close_connection(self.id);
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    connection: u64,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = self.broker.lock();
        if state.channels.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(AmqpError::ChannelError("channel is closed".to_owned()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        match state.exchanges.get(&def.name) {
            Some(kind) if *kind != def.kind => {
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None if def.passive => Err(AmqpError::DeclareExchangeError(def.name.clone())),
            None => {
                state.exchanges.insert(def.name.clone(), def.kind);
                Ok(())
            }
        }
    }

    async fn assert_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.open_state()?;
        let name = if def.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            def.name.clone()
        };

        match state.queues.get(&name) {
            Some(queue) if queue.owner.is_some_and(|owner| owner != self.connection) => {
                Err(AmqpError::DeclareQueueError(name))
            }
            Some(_) => Ok(name),
            None if def.passive => Err(AmqpError::DeclareQueueError(name)),
            None => {
                state.queues.insert(
                    name.clone(),
                    MemoryQueue {
                        owner: def.exclusive.then_some(self.connection),
                        auto_delete: def.auto_delete,
                        ..MemoryQueue::default()
                    },
                );
                Ok(name)
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn check_queue(&self, queue: &str) -> Result<QueueStatus, AmqpError> {
        let state = self.open_state()?;
        let found = state
            .queues
            .get(queue)
            .ok_or_else(|| AmqpError::DeclareQueueError(queue.to_owned()))?;

        Ok(QueueStatus {
            queue: queue.to_owned(),
            message_count: found.messages.len() as u32,
            consumer_count: found.consumers.len() as u32,
        })
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        let mut state = self.open_state()?;
        let found = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| AmqpError::PurgeQueueError(queue.to_owned()))?;

        let purged = found.messages.len() as u32;
        found.messages.clear();
        Ok(purged)
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        let mut state = self.open_state()?;
        let ready = state
            .queues
            .get(queue)
            .map(|found| found.messages.len() as u32)
            .ok_or_else(|| AmqpError::DeleteQueueError(queue.to_owned()))?;

        state.delete_queue(queue);
        debug!(queue, ready, "memory queue deleted");
        Ok(ready)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        let targets = state.route(exchange, routing_key)?;

        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            content,
            properties,
            redelivered: false,
        };

        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.messages.push_back(message.clone());
            }
            state.dispatch(&queue);
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.open_state()?;
        let tag = if options.consumer_tag.is_empty() {
            format!("amq.ctag-{}", state.next_id())
        } else {
            options.consumer_tag.clone()
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let connection = self.connection;
        match state.queues.get_mut(queue) {
            Some(q) if q.owner.map_or(true, |owner| owner == connection) => {
                q.consumers.push(MemoryConsumer {
                    tag: tag.clone(),
                    channel: self.id,
                    no_ack: options.no_ack,
                    sender,
                });
            }
            _ => return Err(AmqpError::BindingConsumerError(queue.to_owned())),
        }
        state.dispatch(queue);

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed();

        Ok(DeliveryStream {
            consumer_tag: tag,
            deliveries,
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        let channel = self.id;
        state.remove_consumers(|consumer| consumer.channel == channel && consumer.tag == consumer_tag);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        state
            .channels
            .get_mut(&self.id)
            .and_then(|channel| channel.unacked.remove(&delivery_tag))
            .map(|_| ())
            .ok_or(AmqpError::AckMessageError)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        let (queue, message) = state
            .channels
            .get_mut(&self.id)
            .and_then(|channel| channel.unacked.remove(&delivery_tag))
            .ok_or(AmqpError::NackMessageError)?;

        if requeue {
            state.requeue(&queue, message);
            state.dispatch(&queue);
        }
        Ok(())
    }

    async fn prefetch(&self, _count: u16, _global: bool) -> Result<(), AmqpError> {
        self.open_state().map(|_| ())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                vec![]
            });
        }

        let kind = self
            .exchanges
            .get(exchange)
            .ok_or(AmqpError::PublishingError)?;

        let mut targets: Vec<String> = vec![];
        for binding in self.bindings.iter().filter(|b| b.exchange_name == exchange) {
            let matched = match kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
            };
            if matched && !targets.contains(&binding.queue_name) {
                targets.push(binding.queue_name.clone());
            }
        }

        Ok(targets)
    }

    /// Hands waiting messages to the queue's consumers, round-robin.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.consumers.is_empty() || queue.messages.is_empty() {
                return;
            }

            let index = queue.cursor % queue.consumers.len();
            queue.cursor = queue.cursor.wrapping_add(1);
            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            let consumer = &queue.consumers[index];
            let (channel_id, no_ack, sender) =
                (consumer.channel, consumer.no_ack, consumer.sender.clone());

            let Some(channel) = self.channels.get_mut(&channel_id) else {
                return;
            };
            let delivery_tag = channel.next_tag;
            channel.next_tag += 1;

            let delivery = Delivery {
                delivery_tag,
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                content: message.content.clone(),
                properties: message.properties.clone(),
            };

            if sender.send(delivery).is_err() {
                // the consumer went away without cancelling
                if let Some(queue) = self.queues.get_mut(queue_name) {
                    queue.messages.push_front(message);
                    queue.consumers.remove(index);
                }
                continue;
            }

            if !no_ack {
                channel
                    .unacked
                    .insert(delivery_tag, (queue_name.to_owned(), message));
            }
        }
    }

    fn requeue(&mut self, queue_name: &str, mut message: StoredMessage) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            message.redelivered = true;
            queue.messages.push_front(message);
        }
    }

    fn remove_consumers<F: Fn(&MemoryConsumer) -> bool>(&mut self, matches: F) {
        let mut emptied = vec![];
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| !matches(consumer));
            if before > 0 && queue.consumers.is_empty() && queue.auto_delete {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            self.delete_queue(&name);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|binding| binding.queue_name != name);
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        self.remove_consumers(|consumer| consumer.channel == id);

        let mut touched = vec![];
        let mut unacked: Vec<(u64, (String, StoredMessage))> = channel.unacked.into_iter().collect();
        // requeued in reverse so the oldest delivery ends up first
        unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, (queue, message)) in unacked {
            self.requeue(&queue, message);
            if !touched.contains(&queue) {
                touched.push(queue);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, id: u64) {
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.connection == id)
            .map(|(channel_id, _)| *channel_id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }

        if let Some(closed) = self.connections.remove(&id) {
            debug!(connection = id, "memory connection closed");
            closed.send_replace(true);
        }
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}
