// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Broker
//!
//! Implementation of the broker capability traits over `lapin`, talking AMQP 0.9.1 to
//! a RabbitMQ server. Queue definitions are translated into the RabbitMQ `x-*` queue
//! arguments and message properties into `BasicProperties`.

use crate::{
    broker::{
        Broker, BrokerChannel, BrokerConnection, ConsumeOptions, Delivery, DeliveryStream,
        MessageProperties, QueueStatus,
    },
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";
/// Constant for the header field used to enable message priorities
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";

const REPLY_SUCCESS: u16 = 200;

/// Connects to a RabbitMQ server with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinBroker {
    connection_name: Option<String>,
}

impl LapinBroker {
    pub fn new() -> LapinBroker {
        LapinBroker::default()
    }

    /// Name reported to the server, visible in the management UI.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        let conn = match Connection::connect(url, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let conn = Arc::new(conn);
        let (closed, receiver) = watch::channel(false);
        let on_error = closed.clone();
        let weak = Arc::downgrade(&conn);
        let runtime = Handle::try_current().ok();
        // runs on lapin's io thread, so the close is spawned back onto the caller's runtime
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            on_error.send_replace(true);
            if let Some(runtime) = &runtime {
                runtime.spawn(close_after_error(weak.clone()));
            }
        });

        Ok(Arc::new(LapinConnection {
            conn,
            closed,
            receiver,
        }))
    }
}

async fn close_after_error(conn: Weak<Connection>) {
    let Some(conn) = conn.upgrade() else {
        return;
    };
    if !conn.status().connected() {
        return;
    }
    if let Err(err) = conn.close(REPLY_SUCCESS, "closing after error").await {
        debug!(error = err.to_string(), "connection already gone after error");
    }
}

struct LapinConnection {
    conn: Arc<Connection>,
    closed: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn closed(&self) {
        let mut closed = self.receiver.clone();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.send_replace(true);
        if !self.conn.status().connected() {
            return Ok(());
        }

        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error closing the connection");
                AmqpError::ConnectionError(err.to_string())
            })
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        let params: BTreeMap<ShortString, AMQPValue> = def
            .params
            .iter()
            .map(|(key, value)| {
                (
                    ShortString::from(key.clone()),
                    AMQPValue::LongString(LongString::from(value.clone())),
                )
            })
            .collect();

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::from(params),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn assert_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    nowait: false,
                },
                FieldTable::from(queue_arguments(def)),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name());
                Ok(queue.name().as_str().to_owned())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn check_queue(&self, queue: &str) -> Result<QueueStatus, AmqpError> {
        match self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = queue, "error to check the queue");
                Err(AmqpError::DeclareQueueError(queue.to_owned()))
            }
            Ok(found) => Ok(QueueStatus {
                queue: found.name().as_str().to_owned(),
                message_count: found.message_count(),
                consumer_count: found.consumer_count(),
            }),
        }
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        match self
            .channel
            .queue_purge(queue, QueuePurgeOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = queue, "error to purge the queue");
                Err(AmqpError::PurgeQueueError(queue.to_owned()))
            }
            Ok(purged) => {
                debug!(name = queue, purged, "queue purged");
                Ok(purged)
            }
        }
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        match self
            .channel
            .queue_delete(
                queue,
                QueueDeleteOptions {
                    if_unused: false,
                    if_empty: false,
                    nowait: false,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = queue, "error to delete the queue");
                Err(AmqpError::DeleteQueueError(queue.to_owned()))
            }
            Ok(ready) => {
                debug!(name = queue, ready, "queue deleted");
                Ok(ready)
            }
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &content,
                to_basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let consumer_tag = consumer.tag().as_str().to_owned();
        let deliveries = consumer
            .filter_map(|result| async move {
                match result {
                    Ok(delivery) => Some(from_lapin_delivery(delivery)),
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        None
                    }
                }
            })
            .boxed();

        Ok(DeliveryStream {
            consumer_tag,
            deliveries,
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error cancelling consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn prefetch(&self, count: u16, global: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions { global })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error configuring qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}

/// Translates a queue definition into RabbitMQ `x-*` queue arguments.
fn queue_arguments(def: &QueueDefinition) -> BTreeMap<ShortString, AMQPValue> {
    let mut args = BTreeMap::new();

    if let Some(ttl) = def.ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = def.max_length {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    if let Some(max) = def.max_length_bytes {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    if let Some(max) = def.max_priority {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_PRIORITY),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    if let Some(exchange) = &def.dead_letter_exchange {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }

    if let Some(key) = &def.dead_letter_routing_key {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(key.clone())),
        );
    }

    args
}

fn to_basic_properties(props: MessageProperties) -> BasicProperties {
    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .into_iter()
        .map(|(key, value)| {
            (
                ShortString::from(key),
                AMQPValue::LongString(LongString::from(value)),
            )
        })
        .collect();

    let mut basic = BasicProperties::default().with_headers(FieldTable::from(headers));

    if let Some(value) = props.content_type {
        basic = basic.with_content_type(ShortString::from(value));
    }
    if let Some(value) = props.kind {
        basic = basic.with_type(ShortString::from(value));
    }
    if let Some(value) = props.message_id {
        basic = basic.with_message_id(ShortString::from(value));
    }
    if let Some(value) = props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(value));
    }
    if let Some(value) = props.reply_to {
        basic = basic.with_reply_to(ShortString::from(value));
    }
    if let Some(value) = props.expiration {
        basic = basic.with_expiration(ShortString::from(value));
    }
    if let Some(value) = props.priority {
        basic = basic.with_priority(value);
    }

    basic
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let short = |value: &Option<ShortString>| value.as_ref().map(|v| v.as_str().to_owned());

    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    header_string(value).map(|value| (key.as_str().to_owned(), value))
                })
                .collect()
        })
        .unwrap_or_default();

    let properties = MessageProperties {
        correlation_id: short(props.correlation_id()),
        reply_to: short(props.reply_to()),
        kind: short(props.kind()),
        expiration: short(props.expiration()),
        message_id: short(props.message_id()),
        content_type: short(props.content_type()),
        priority: *props.priority(),
        headers,
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        content: delivery.data,
        properties,
    }
}

/// Renders the header values the transport cares about as strings.
fn header_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
            .map_err(|e| error!("Error decoding header value {:?}", e))
            .ok()
            .map(str::to_owned),
        AMQPValue::ShortString(value) => Some(value.as_str().to_owned()),
        AMQPValue::Boolean(value) => Some(value.to_string()),
        AMQPValue::ShortInt(value) => Some(value.to_string()),
        AMQPValue::LongInt(value) => Some(value.to_string()),
        AMQPValue::LongLongInt(value) => Some(value.to_string()),
        AMQPValue::LongUInt(value) => Some(value.to_string()),
        _ => None,
    }
}
