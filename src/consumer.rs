// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer
//!
//! A consumer registers one setup action on its channel. Each time the channel opens
//! the action (optionally) declares the exchange and queue, binds the routes, starts
//! consuming and spawns a dispatch loop for the resulting delivery stream.
//!
//! The dispatch loop decodes every delivery into an envelope, wraps it in a [`Job`]
//! and hands `(payload, job)` to the handler on its own task, inside a consumer span
//! joined to the producer's trace. An `ordered` consumer instead awaits each handler
//! before taking the next delivery. Deliveries that do not decode are rejected without
//! requeue. The handler owns acknowledgement: nothing is acked on its behalf.

use crate::{
    broker::{ConsumeOptions, DeliveryStream},
    channel::{ChannelHandle, InitId},
    config::DEFAULT_CHANNEL_NAME,
    envelope,
    errors::{AmqpError, HandlerError},
    exchange::ExchangeDefinition,
    job::Job,
    otel,
    queue::{QueueBinding, QueueDefinition},
    transport::Transport,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedSpan},
    trace::{Span, Status},
};
use serde_json::Value;
use std::{
    borrow::Cow,
    future::Future,
    sync::{Arc, Mutex},
};
use tracing::{debug, error, warn};

/// Handles the deliveries of a consumer.
#[async_trait]
pub trait ConsumeHandler: Send + Sync + 'static {
    async fn consume(&self, payload: Value, job: Job) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> ConsumeHandler for F
where
    F: Fn(Value, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn consume(&self, payload: Value, job: Job) -> Result<(), HandlerError> {
        self(payload, job).await
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub(crate) channel_name: String,
    pub(crate) queue: QueueDefinition,
    pub(crate) declare_queue: bool,
    pub(crate) exchange: Option<ExchangeDefinition>,
    pub(crate) routes: Vec<String>,
    pub(crate) consume: ConsumeOptions,
    pub(crate) ordered: bool,
}

impl ConsumerOptions {
    /// Consumes an existing queue.
    pub fn new(queue: &str) -> ConsumerOptions {
        ConsumerOptions {
            channel_name: DEFAULT_CHANNEL_NAME.to_owned(),
            queue: QueueDefinition::new(queue),
            declare_queue: false,
            exchange: None,
            routes: vec![],
            consume: ConsumeOptions::default(),
            ordered: false,
        }
    }

    /// Declares the queue before consuming it. A queue without a name is named by the
    /// broker, anew on every channel open.
    pub fn declare(queue: QueueDefinition) -> ConsumerOptions {
        ConsumerOptions {
            queue,
            declare_queue: true,
            ..ConsumerOptions::new("")
        }
    }

    pub fn channel(mut self, name: &str) -> Self {
        self.channel_name = name.to_owned();
        self
    }

    /// Declares `exchange` and binds the queue to it with each route.
    pub fn bind(mut self, exchange: ExchangeDefinition, routes: &[&str]) -> Self {
        self.exchange = Some(exchange);
        self.routes = routes.iter().map(|route| route.to_string()).collect();
        self
    }

    pub fn no_ack(mut self) -> Self {
        self.consume.no_ack = true;
        self
    }

    /// Handles deliveries one at a time, in delivery order.
    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    pub fn consume_options(mut self, options: ConsumeOptions) -> Self {
        self.consume = options;
        self
    }
}

#[derive(Default)]
struct ConsumerState {
    consumer_tag: Option<String>,
    queue: Option<String>,
}

/// A running consumer.
#[derive(Clone)]
pub struct ConsumerHandle {
    channel: ChannelHandle,
    init: InitId,
    state: Arc<Mutex<ConsumerState>>,
}

impl ConsumerHandle {
    /// Tag of the current broker consumer; `None` until the channel opened.
    pub fn consumer_tag(&self) -> Option<String> {
        self.lock().consumer_tag.clone()
    }

    /// Name of the consumed queue as reported by the broker.
    pub fn queue_name(&self) -> Option<String> {
        self.lock().queue.clone()
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    /// Stops consuming and drops the setup action so the consumer is not restarted
    /// on reconnect. Handlers already running finish.
    pub async fn cancel(&self) -> Result<(), AmqpError> {
        self.channel.remove_init(self.init);
        let tag = self.lock().consumer_tag.take();

        match tag {
            Some(tag) => match self.channel.cancel(&tag).await {
                Err(AmqpError::NotConnected(_)) => Ok(()),
                other => other,
            },
            None => Ok(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConsumerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub(crate) struct Consumer;

impl Consumer {
    pub(crate) fn start(
        transport: &Transport,
        options: ConsumerOptions,
        handler: Arc<dyn ConsumeHandler>,
    ) -> ConsumerHandle {
        let channel = transport.channel(&options.channel_name);
        let state = Arc::new(Mutex::new(ConsumerState::default()));
        let options = Arc::new(options);

        let init = {
            let state = state.clone();
            channel.add_init(move |channel: ChannelHandle| {
                let state = state.clone();
                let options = options.clone();
                let handler = handler.clone();
                async move { setup(channel, &options, state, handler).await }
            })
        };

        ConsumerHandle {
            channel,
            init,
            state,
        }
    }
}

async fn setup(
    channel: ChannelHandle,
    options: &ConsumerOptions,
    state: Arc<Mutex<ConsumerState>>,
    handler: Arc<dyn ConsumeHandler>,
) -> Result<(), AmqpError> {
    let generation = channel.generation();

    if let Some(exchange) = &options.exchange {
        channel.assert_exchange(exchange).await?;
    }

    let queue = if options.declare_queue {
        channel.assert_queue(&options.queue).await?
    } else {
        options.queue.name().to_owned()
    };

    if let Some(exchange) = &options.exchange {
        for route in &options.routes {
            channel
                .bind_queue(
                    &QueueBinding::new(&queue)
                        .exchange(exchange.name())
                        .routing_key(route),
                )
                .await?;
        }
    }

    let stream = channel.consume(&queue, &options.consume).await?;
    debug!(
        channel = channel.name(),
        queue,
        consumer_tag = stream.consumer_tag,
        "ready to consume"
    );

    {
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        state.consumer_tag = Some(stream.consumer_tag.clone());
        state.queue = Some(queue.clone());
    }

    tokio::spawn(dispatch(
        stream,
        Dispatch {
            channel,
            generation,
            handler,
            no_ack: options.consume.no_ack,
            ordered: options.ordered,
            queue,
        },
    ));

    Ok(())
}

struct Dispatch {
    channel: ChannelHandle,
    /// Connection generation the stream was started on
    generation: u64,
    handler: Arc<dyn ConsumeHandler>,
    no_ack: bool,
    ordered: bool,
    queue: String,
}

async fn dispatch(mut stream: DeliveryStream, consumer: Dispatch) {
    let Dispatch {
        channel,
        generation,
        handler,
        no_ack,
        ordered,
        queue,
    } = consumer;
    let tracer = global::tracer("amqp consumer");

    while let Some(delivery) = stream.deliveries.next().await {
        let name = delivery
            .properties
            .kind
            .clone()
            .unwrap_or_else(|| queue.clone());
        debug!(queue, kind = name, exchange = delivery.exchange, "received");

        let env = match envelope::decode(&delivery.content) {
            Ok(env) => env,
            Err(err) => {
                warn!(
                    queue,
                    error = err.to_string(),
                    "malformed message is dropped from queue"
                );
                if !no_ack {
                    let nacked = match channel.live_at(generation) {
                        Ok(live) => live.nack(delivery.delivery_tag, false).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = nacked {
                        error!(error = err.to_string(), "error whiling nack msg");
                    }
                }
                continue;
            }
        };

        let (ctx, mut span) = otel::new_span(&delivery.properties, &tracer, &name);
        let job = Job::new(delivery, env.context, ctx, channel.clone(), generation, no_ack);

        if ordered {
            handle(handler.as_ref(), env.payload, job, &mut span).await;
        } else {
            let handler = handler.clone();
            tokio::spawn(async move {
                handle(handler.as_ref(), env.payload, job, &mut span).await;
            });
        }
    }

    debug!(queue, "consumer stream ended");
}

async fn handle(handler: &dyn ConsumeHandler, payload: Value, job: Job, span: &mut BoxedSpan) {
    match handler.consume(payload, job).await {
        Ok(()) => span.set_status(Status::Ok),
        Err(err) => {
            error!(error = err.to_string(), "error handling message");
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MessageProperties, config::TransportConfig, job::AckStatus, memory::MemoryBroker,
    };
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn connected(broker: &MemoryBroker) -> Transport {
        let transport =
            Transport::new(TransportConfig::new("memory://"), Arc::new(broker.clone())).unwrap();
        transport.add_init(|channel: ChannelHandle| async move {
            channel.assert_queue(&QueueDefinition::new("work")).await.map(|_| ())
        });
        transport
    }

    #[tokio::test]
    async fn delivers_payload_and_context() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;
        let (seen, mut received) = mpsc::unbounded_channel();

        let consumer = transport.consumer(ConsumerOptions::new("work"), move |payload: Value, job: Job| {
            let seen = seen.clone();
            async move {
                job.ack().await?;
                let _ = seen.send((payload, job.context().cloned(), job.ack_status()));
                Ok::<_, HandlerError>(())
            }
        });
        transport.connect().await.unwrap();
        transport.ready().await.unwrap();
        assert!(consumer.consumer_tag().is_some());

        let body = envelope::encode(&json!({"n": 1}), Some(&json!({"user": 2}))).unwrap();
        transport
            .channel("default")
            .send_to_queue("work", body, MessageProperties::default())
            .await
            .unwrap();

        let (payload, context, status) = received.recv().await.unwrap();
        assert_eq!(payload, json!({"n": 1}));
        assert_eq!(context, Some(json!({"user": 2})));
        assert_eq!(status, AckStatus::Ack);
        assert_eq!(broker.queue_depth("work"), Some(0));
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;
        let (seen, mut received) = mpsc::unbounded_channel();

        transport.consumer(ConsumerOptions::new("work"), move |payload: Value, job: Job| {
            let seen = seen.clone();
            async move {
                job.ack().await?;
                let _ = seen.send(payload);
                Ok::<_, HandlerError>(())
            }
        });
        transport.connect().await.unwrap();
        transport.ready().await.unwrap();

        let channel = transport.channel("default");
        channel
            .send_to_queue("work", b"not json".to_vec(), MessageProperties::default())
            .await
            .unwrap();
        channel
            .send_to_queue(
                "work",
                envelope::encode(&json!("ok"), None).unwrap(),
                MessageProperties::default(),
            )
            .await
            .unwrap();

        assert_eq!(received.recv().await.unwrap(), json!("ok"));
        assert_eq!(broker.queue_depth("work"), Some(0));
    }

    #[tokio::test]
    async fn cancel_stops_delivery_and_replay() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;

        let consumer = transport.consumer(ConsumerOptions::new("work"), |_payload: Value, job: Job| async move {
            job.ack().await?;
            Ok::<_, HandlerError>(())
        });
        transport.connect().await.unwrap();
        transport.ready().await.unwrap();
        assert_eq!(broker.consumer_count("work"), Some(1));

        consumer.cancel().await.unwrap();
        assert_eq!(broker.consumer_count("work"), Some(0));

        transport
            .channel("default")
            .send_to_queue(
                "work",
                envelope::encode(&json!(1), None).unwrap(),
                MessageProperties::default(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.queue_depth("work"), Some(1));
    }

    #[tokio::test]
    async fn declares_and_binds_server_named_queue() {
        let broker = MemoryBroker::new();
        let transport =
            Transport::new(TransportConfig::new("memory://"), Arc::new(broker.clone())).unwrap();
        let (seen, mut received) = mpsc::unbounded_channel();

        let consumer = transport.consumer(
            ConsumerOptions::declare(QueueDefinition::server_named())
                .bind(ExchangeDefinition::new("events").topic(), &["user.*"])
                .no_ack(),
            move |payload: Value, _job: Job| {
                let seen = seen.clone();
                async move {
                    let _ = seen.send(payload);
                    Ok::<_, HandlerError>(())
                }
            },
        );
        transport.connect().await.unwrap();
        transport.ready().await.unwrap();

        let queue = consumer.queue_name().unwrap();
        assert!(queue.starts_with("amq.gen-"));

        transport
            .channel("default")
            .publish(
                "events",
                "user.created",
                envelope::encode(&json!({"id": 1}), None).unwrap(),
                MessageProperties::default(),
            )
            .await
            .unwrap();

        assert_eq!(received.recv().await.unwrap(), json!({"id": 1}));
    }

    #[tokio::test]
    async fn ordered_consumers_handle_in_delivery_order() {
        let broker = MemoryBroker::new();
        let transport = connected(&broker).await;
        let (seen, mut received) = mpsc::unbounded_channel();

        transport.consumer(
            ConsumerOptions::new("work").no_ack().ordered(),
            move |payload: Value, _job: Job| {
                let seen = seen.clone();
                async move {
                    // the first message takes longest
                    let delay = 30 - 10 * payload.as_u64().unwrap_or_default();
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let _ = seen.send(payload);
                    Ok::<_, HandlerError>(())
                }
            },
        );
        transport.connect().await.unwrap();
        transport.ready().await.unwrap();

        let channel = transport.channel("default");
        for n in 0..3 {
            channel
                .send_to_queue(
                    "work",
                    envelope::encode(&json!(n), None).unwrap(),
                    MessageProperties::default(),
                )
                .await
                .unwrap();
        }

        let mut order = vec![];
        for _ in 0..3 {
            order.push(received.recv().await.unwrap());
        }
        assert_eq!(order, vec![json!(0), json!(1), json!(2)]);
    }
}
