// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Producer
//!
//! Publishes envelopes to an exchange. Every message is sent with a JSON content
//! type, a fresh message id and the current trace context injected into its headers.

use crate::{
    broker::MessageProperties,
    channel::ChannelHandle,
    config::DEFAULT_CHANNEL_NAME,
    envelope::{self, JSON_CONTENT_TYPE},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel,
    transport::Transport,
};
use opentelemetry::Context;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) declare: bool,
    pub(crate) channel_name: String,
}

impl ProducerOptions {
    /// Produces to an exchange that is declared elsewhere.
    pub fn new(exchange: &str) -> ProducerOptions {
        ProducerOptions {
            exchange: ExchangeDefinition::new(exchange),
            declare: false,
            channel_name: DEFAULT_CHANNEL_NAME.to_owned(),
        }
    }

    /// Produces to an exchange the producer asserts on every channel open.
    pub fn declare(exchange: ExchangeDefinition) -> ProducerOptions {
        ProducerOptions {
            exchange,
            declare: true,
            channel_name: DEFAULT_CHANNEL_NAME.to_owned(),
        }
    }

    pub fn channel(mut self, name: &str) -> Self {
        self.channel_name = name.to_owned();
        self
    }
}

/// Per-message publishing options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Message `type` property
    pub kind: Option<String>,
    /// Per-message TTL
    pub expiration: Option<Duration>,
    pub priority: Option<u8>,
    /// Application context carried in the envelope
    pub context: Option<Value>,
    /// Trace context to propagate; defaults to the current one
    pub trace: Option<Context>,
}

impl PublishOptions {
    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn trace(mut self, ctx: Context) -> Self {
        self.trace = Some(ctx);
        self
    }
}

#[derive(Clone)]
pub struct Producer {
    channel: ChannelHandle,
    exchange: String,
}

impl Producer {
    pub(crate) fn new(transport: &Transport, options: ProducerOptions) -> Producer {
        let channel = transport.channel(&options.channel_name);
        let exchange = options.exchange.name().to_owned();

        if options.declare {
            let def = options.exchange;
            channel.add_init(move |channel: ChannelHandle| {
                let def = def.clone();
                async move { channel.assert_exchange(&def).await }
            });
        }

        Producer { channel, exchange }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    /// Publishes `payload` through the given route.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        route: &str,
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        let body = envelope::encode(payload, options.context.as_ref())?;

        let mut props = MessageProperties {
            correlation_id: options.correlation_id,
            reply_to: options.reply_to,
            kind: options.kind,
            expiration: options
                .expiration
                .map(|ttl| ttl.as_millis().to_string()),
            message_id: Some(Uuid::new_v4().to_string()),
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            priority: options.priority,
            ..MessageProperties::default()
        };
        let ctx = options.trace.unwrap_or_else(Context::current);
        otel::inject(&ctx, &mut props.headers);

        debug!(
            exchange = self.exchange,
            route,
            kind = props.kind.as_deref().unwrap_or_default(),
            "publish"
        );

        self.channel
            .publish(&self.exchange, route, body, props)
            .await
            .inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    exchange = self.exchange,
                    route,
                    "error publishing message"
                )
            })
    }
}
