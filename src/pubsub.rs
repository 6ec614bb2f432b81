// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Fanout publish/subscribe.
//!
//! Publishers produce to a fanout exchange with route `default`. Each subscriber gets
//! its own broker-named, exclusive, auto-deleting queue bound to that exchange.

use crate::{
    consumer::{ConsumeHandler, ConsumerHandle, ConsumerOptions},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    producer::{Producer, ProducerOptions, PublishOptions},
    queue::QueueDefinition,
    transport::Transport,
};
use serde::Serialize;
use std::sync::Arc;

pub const PUBSUB_ROUTE: &str = "default";

#[derive(Clone)]
pub struct Publisher {
    producer: Producer,
}

impl Publisher {
    pub(crate) fn new(transport: &Transport, exchange: &str) -> Publisher {
        Publisher {
            producer: transport.producer(ProducerOptions::declare(
                ExchangeDefinition::new(exchange).fanout(),
            )),
        }
    }

    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        self.producer.publish(payload, PUBSUB_ROUTE, options).await
    }
}

pub(crate) fn subscribe(
    transport: &Transport,
    exchange: &str,
    handler: Arc<dyn ConsumeHandler>,
) -> ConsumerHandle {
    let options = ConsumerOptions::declare(QueueDefinition::server_named())
        .bind(ExchangeDefinition::new(exchange).fanout(), &[PUBSUB_ROUTE]);

    crate::consumer::Consumer::start(transport, options, handler)
}
