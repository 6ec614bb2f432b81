// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capabilities
//!
//! The transport coordinates client-side state around a broker client library;
//! this module defines the capability set it needs from that library. `Broker`
//! opens connections, `BrokerConnection` opens channels and reports when the link
//! goes away, and `BrokerChannel` exposes the raw channel operations.
//!
//! Two implementations ship with the crate: [`crate::amqp::LapinBroker`] talks to
//! a real AMQP 0.9.1 server and [`crate::memory::MemoryBroker`] runs in-process.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// Message properties carried next to the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// The AMQP `type` property (`result` / `error` on RPC replies)
    pub kind: Option<String>,
    /// Per-message TTL in milliseconds, as a decimal string
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub priority: Option<u8>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub content: Vec<u8>,
    pub properties: MessageProperties,
}

/// Options for starting a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// The broker acknowledges deliveries itself; `ack`/`nack` become no-ops
    pub no_ack: bool,
    pub exclusive: bool,
    /// Consumer tag to request; empty lets the broker pick one
    pub consumer_tag: String,
}

impl ConsumeOptions {
    pub fn no_ack() -> Self {
        ConsumeOptions {
            no_ack: true,
            ..ConsumeOptions::default()
        }
    }
}

/// Counters of an existing queue, as reported by a passive declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub queue: String,
    /// Messages ready for delivery
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A started consumer: its tag and the stream of its deliveries.
///
/// The stream ends when the consumer is cancelled or its channel goes away.
pub struct DeliveryStream {
    pub consumer_tag: String,
    pub deliveries: BoxStream<'static, Delivery>,
}

/// Opens connections to a broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// One live connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Resolves once the connection is gone, whoever closed it.
    async fn closed(&self);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// One live channel multiplexed over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares the queue and returns its actual name.
    async fn assert_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Fails when the queue does not exist.
    async fn check_queue(&self, queue: &str) -> Result<QueueStatus, AmqpError>;

    /// Drops the ready messages of the queue and returns how many there were.
    async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError>;

    /// Deletes the queue and returns how many ready messages it held.
    async fn delete_queue(&self, queue: &str) -> Result<u32, AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn prefetch(&self, count: u16, global: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
