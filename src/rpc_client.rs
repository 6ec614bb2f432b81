// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Client
//!
//! Sends requests to `<exchange>` with route `query` and waits for the correlated
//! reply. Each client owns a private reply queue, `<exchange>.<uuid>`, declared
//! exclusive and auto-deleting and bound to the exchange with its own name as routing
//! key; it is re-declared by the channel's setup chain after every reconnect.
//!
//! Outstanding requests live in a [`PendingTable`] keyed by a UUIDv4 correlation id.
//! A request settles exactly once: with the reply, with `RpcTimeout` when its deadline
//! passes, or with `TransportClosed` when the transport shuts down.

use crate::{
    channel::{ChannelHandle, ChannelStatus},
    config::DEFAULT_CHANNEL_NAME,
    consumer::{ConsumerHandle, ConsumerOptions},
    errors::{AmqpError, HandlerError, RemoteError},
    exchange::ExchangeDefinition,
    job::Job,
    pending::{self, PendingTable},
    producer::{Producer, ProducerOptions, PublishOptions},
    queue::{QueueBinding, QueueDefinition},
    transport::Transport,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Routing key of RPC requests.
pub const QUERY_ROUTE: &str = "query";
/// `type` of a successful reply.
pub const RESULT_KIND: &str = "result";
/// `type` of a failed reply.
pub const ERROR_KIND: &str = "error";

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RpcClientOptions {
    pub channel_name: String,
    pub default_timeout: Duration,
    /// How often expired requests are swept
    pub sweep_interval: Duration,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        RpcClientOptions {
            channel_name: DEFAULT_CHANNEL_NAME.to_owned(),
            default_timeout: DEFAULT_RPC_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl RpcClientOptions {
    pub fn channel(mut self, name: &str) -> Self {
        self.channel_name = name.to_owned();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides the client's default timeout
    pub timeout: Option<Duration>,
    /// Application context carried in the request envelope
    pub context: Option<Value>,
}

#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    reply_queue: String,
    channel: ChannelHandle,
    producer: Producer,
    pending: Arc<PendingTable>,
    default_timeout: Duration,
    reconnect: bool,
    replies: ConsumerHandle,
}

impl RpcClient {
    pub(crate) fn new(transport: &Transport, exchange: &str, options: RpcClientOptions) -> RpcClient {
        let reply_queue = format!("{}.{}", exchange, Uuid::new_v4());
        let channel = transport.channel(&options.channel_name);
        let pending = PendingTable::new();
        transport.register_pending(&pending);
        tokio::spawn(pending::sweep(
            Arc::downgrade(&pending),
            options.sweep_interval,
        ));

        let producer = transport.producer(
            ProducerOptions::new(exchange).channel(&options.channel_name),
        );

        let exchange_def = ExchangeDefinition::new(exchange).direct();
        let queue_def = QueueDefinition::new(&reply_queue).exclusive().auto_delete();
        channel.add_init(move |channel: ChannelHandle| {
            let exchange_def = exchange_def.clone();
            let queue_def = queue_def.clone();
            async move {
                channel.assert_exchange(&exchange_def).await?;
                let queue = channel.assert_queue(&queue_def).await?;
                channel
                    .bind_queue(
                        &QueueBinding::new(&queue)
                            .exchange(exchange_def.name())
                            .routing_key(&queue),
                    )
                    .await
            }
        });

        let replies = {
            let pending = pending.clone();
            transport.consumer(
                ConsumerOptions::new(&reply_queue)
                    .channel(&options.channel_name)
                    .no_ack()
                    .ordered(),
                move |payload: Value, job: Job| {
                    let pending = pending.clone();
                    async move {
                        settle_reply(&pending, payload, &job);
                        Ok::<_, HandlerError>(())
                    }
                },
            )
        };

        RpcClient {
            inner: Arc::new(ClientInner {
                reply_queue,
                channel,
                producer,
                pending,
                default_timeout: options.default_timeout,
                reconnect: transport.reconnect_enabled(),
                replies,
            }),
        }
    }

    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Sends a request with the default timeout.
    pub async fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Value, AmqpError> {
        self.send_with(payload, SendOptions::default()).await
    }

    /// Sends a request and waits for its reply.
    ///
    /// An `error` reply yields `AmqpError::Remote`. While the channel is not open the
    /// request waits for it, within its own deadline, if the channel is being set up
    /// or reconnection is enabled; otherwise it fails with `NotConnected`.
    pub async fn send_with<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        options: SendOptions,
    ) -> Result<Value, AmqpError> {
        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);
        let deadline = Instant::now() + timeout;
        let correlation_id = Uuid::new_v4().to_string();

        let reply = self.inner.pending.insert(&correlation_id, deadline)?;

        if let Err(err) = self.wait_for_channel(deadline, &correlation_id).await {
            self.inner.pending.remove(&correlation_id);
            return Err(err);
        }

        debug!(correlation_id, reply_to = self.inner.reply_queue, "sending rpc request");
        let mut publish = PublishOptions::default()
            .correlation_id(&correlation_id)
            .reply_to(&self.inner.reply_queue)
            .expiration(timeout);
        publish.context = options.context;

        if let Err(err) = self
            .inner
            .producer
            .publish(payload, QUERY_ROUTE, publish)
            .await
        {
            self.inner.pending.remove(&correlation_id);
            return Err(err);
        }

        reply.await.unwrap_or(Err(AmqpError::TransportClosed))
    }

    /// Sends a typed request and decodes the reply.
    pub async fn call<Req, Res>(&self, payload: &Req) -> Result<Res, AmqpError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let value = self.send(payload).await?;
        serde_json::from_value(value).map_err(|err| AmqpError::MalformedMessage(err.to_string()))
    }

    /// Stops the reply consumer. Outstanding requests are left to expire.
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        self.inner.replies.cancel().await
    }

    async fn wait_for_channel(&self, deadline: Instant, correlation_id: &str) -> Result<(), AmqpError> {
        let channel = &self.inner.channel;
        match channel.status() {
            ChannelStatus::Ready => return Ok(()),
            ChannelStatus::Opening => {}
            _ if self.inner.reconnect => {}
            _ => return Err(AmqpError::NotConnected(channel.name().to_owned())),
        }

        debug!(correlation_id, channel = channel.name(), "waiting for channel");
        match tokio::time::timeout_at(deadline, channel.opened()).await {
            Ok(result) => result,
            Err(_) => Err(AmqpError::RpcTimeout(correlation_id.to_owned())),
        }
    }
}

fn settle_reply(pending: &PendingTable, payload: Value, job: &Job) {
    let props = &job.msg().properties;
    let Some(correlation_id) = props.correlation_id.as_deref() else {
        debug!("dropping reply without correlation id");
        return;
    };

    let reply = match props.kind.as_deref() {
        Some(ERROR_KIND) => Err(AmqpError::Remote(RemoteError::from_payload(payload))),
        _ => Ok(payload),
    };

    if !pending.resolve(correlation_id, reply) {
        debug!(correlation_id, "dropping reply for unknown or expired request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::TransportConfig, memory::MemoryBroker};
    use serde_json::json;

    fn transport(broker: &MemoryBroker) -> Transport {
        Transport::new(TransportConfig::new("memory://"), Arc::new(broker.clone())).unwrap()
    }

    #[tokio::test]
    async fn declares_private_reply_queue() {
        let broker = MemoryBroker::new();
        let transport = transport(&broker);
        let client = transport.rpc_client("fib", RpcClientOptions::default());

        transport.connect().await.unwrap();
        transport.ready().await.unwrap();

        assert!(client.reply_queue().starts_with("fib."));
        assert!(broker.has_queue(client.reply_queue()));
        assert_eq!(broker.consumer_count(client.reply_queue()), Some(1));
    }

    #[tokio::test]
    async fn times_out_without_server() {
        let broker = MemoryBroker::new();
        let transport = transport(&broker);
        let client = transport.rpc_client(
            "fib",
            RpcClientOptions {
                sweep_interval: Duration::from_millis(10),
                ..RpcClientOptions::default()
            },
        );
        transport.connect().await.unwrap();
        transport.ready().await.unwrap();

        let started = Instant::now();
        let err = client
            .send_with(
                &json!({"n": 8}),
                SendOptions {
                    timeout: Some(Duration::from_millis(50)),
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::RpcTimeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn fails_fast_when_disconnected_without_reconnect() {
        let broker = MemoryBroker::new();
        let transport = transport(&broker);
        let client = transport.rpc_client("fib", RpcClientOptions::default());

        let err = client.send(&json!({"n": 1})).await.unwrap_err();

        assert_eq!(err, AmqpError::NotConnected("default".to_owned()));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn late_replies_are_dropped() {
        let table = PendingTable::new();
        let broker = MemoryBroker::new();
        let transport = transport(&broker);
        transport.connect().await.unwrap();
        transport.ready().await.unwrap();

        let delivery = crate::broker::Delivery {
            delivery_tag: 1,
            redelivered: false,
            exchange: "fib".to_owned(),
            routing_key: "fib.reply".to_owned(),
            content: vec![],
            properties: crate::broker::MessageProperties::default()
                .with_correlation_id("gone")
                .with_kind(RESULT_KIND),
        };
        let job = Job::new(
            delivery,
            None,
            opentelemetry::Context::new(),
            transport.channel("default"),
            1,
            true,
        );

        settle_reply(&table, json!(21), &job);
        assert_eq!(table.len(), 0);
    }
}
