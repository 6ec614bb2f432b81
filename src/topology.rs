// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology
//!
//! A `Topology` collects exchanges, queues and the bindings between them and installs
//! them on a channel as one setup action, so the whole set is re-asserted every time
//! the channel reopens.
//!
//! Installation always runs in this order:
//! 1. exchanges
//! 2. queues
//! 3. queue-to-exchange bindings
//!
//! Within each group definitions are applied in the order they were added.

use crate::{
    channel::{ChannelHandle, InitId},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) bindings: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Declares everything on `channel` right now.
    pub async fn apply(&self, channel: &ChannelHandle) -> Result<(), AmqpError> {
        for exchange in &self.exchanges {
            debug!("creating exchange: {}", exchange.name());
            channel.assert_exchange(exchange).await?;
        }

        for queue in &self.queues {
            let name = channel.assert_queue(queue).await?;
            debug!("queue: {} was created", name);
        }

        for binding in &self.bindings {
            debug!(
                queue = binding.queue_name(),
                exchange = binding.exchange_name(),
                "binding queue"
            );
            channel.bind_queue(binding).await?;
        }

        Ok(())
    }

    /// Registers the topology as a setup action of `channel`.
    pub fn install(self, channel: &ChannelHandle) -> InitId {
        let topology = Arc::new(self);
        channel.add_init(move |channel: ChannelHandle| {
            let topology = topology.clone();
            async move { topology.apply(&channel).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::Broker,
        channel::ChannelRegistry,
        config::{PrefetchSettings, TransportConfig},
        memory::MemoryBroker,
        transport::Transport,
    };
    use std::{collections::HashMap, sync::Mutex};
    use tokio::sync::broadcast;

    // added in reverse so the install order does not follow insertion across groups
    fn orders() -> Topology {
        Topology::new()
            .binding(QueueBinding::new("orders.created").exchange("orders").routing_key("created"))
            .queue(QueueDefinition::new("orders.created").durable())
            .exchange(ExchangeDefinition::new("orders").topic().durable())
    }

    async fn opened(broker: &MemoryBroker) -> ChannelHandle {
        let registry: ChannelRegistry = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(4);
        let channel = ChannelHandle::new("default", PrefetchSettings::default(), &registry, events);
        let conn = broker.connect("memory://").await.unwrap();
        channel.open(1, conn).await.unwrap().unwrap();
        channel
    }

    #[tokio::test]
    async fn applies_exchanges_then_queues_then_bindings() {
        let broker = MemoryBroker::new();
        let channel = opened(&broker).await;

        orders().apply(&channel).await.unwrap();

        assert!(broker.has_exchange("orders"));
        assert!(broker.has_queue("orders.created"));
    }

    #[tokio::test]
    async fn binding_to_unknown_exchange_fails() {
        let broker = MemoryBroker::new();
        let channel = opened(&broker).await;

        let err = Topology::new()
            .queue(QueueDefinition::new("orders.created"))
            .binding(QueueBinding::new("orders.created").exchange("missing"))
            .apply(&channel)
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::BindingExchangeToQueueError(_, _)));
    }

    #[tokio::test]
    async fn installs_on_every_open() {
        let broker = MemoryBroker::new();
        let config = TransportConfig::new("memory://").reconnect(std::time::Duration::from_millis(10));
        let transport = Transport::new(config, Arc::new(broker.clone())).unwrap();
        transport.install(
            "default",
            Topology::new().queue(QueueDefinition::new("session").exclusive()),
        );

        transport.connect().await.unwrap();
        transport.ready().await.unwrap();
        assert!(broker.has_queue("session"));

        let mut events = transport.events();
        broker.drop_connections();
        assert!(!broker.has_queue("session"));

        while events.recv().await.unwrap() != crate::transport::TransportEvent::Ready {}
        assert!(broker.has_queue("session"));
    }
}
