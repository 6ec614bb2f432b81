// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Commands
//!
//! Fire-and-forget commands over a direct exchange:
//!
//! - the sender publishes to `<exchange>` with route `command`, consumed from the
//!   durable-by-choice queue `<exchange>.command`;
//! - the server handles each command and, unless told otherwise, publishes the
//!   outcome with route `result` or `error`, carrying the command's context;
//! - a result recipient consumes `<exchange>.result` and `<exchange>.error`.
//!
//! Unlike RPC there is no correlation: results are addressed to whoever consumes the
//! result queues.

use crate::{
    broker::ConsumeOptions,
    channel::ChannelHandle,
    config::DEFAULT_CHANNEL_NAME,
    consumer::{ConsumeHandler, Consumer, ConsumerHandle, ConsumerOptions},
    errors::{AmqpError, HandlerError},
    exchange::ExchangeDefinition,
    job::Job,
    producer::{Producer, ProducerOptions, PublishOptions},
    queue::{QueueBinding, QueueDefinition},
    rpc_client::{ERROR_KIND, RESULT_KIND},
    rpc_server::RpcHandler,
    transport::Transport,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub const COMMAND_ROUTE: &str = "command";

/// Options of command senders and result recipients.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub channel_name: String,
    /// Declaration of `<exchange>.command`; its name is always overridden
    pub queue: Option<QueueDefinition>,
    /// Used by result recipients; acknowledged by the broker unless changed
    pub consume: ConsumeOptions,
}

impl Default for CommandOptions {
    fn default() -> Self {
        CommandOptions {
            channel_name: DEFAULT_CHANNEL_NAME.to_owned(),
            queue: None,
            consume: ConsumeOptions::no_ack(),
        }
    }
}

impl CommandOptions {
    pub fn channel(mut self, name: &str) -> Self {
        self.channel_name = name.to_owned();
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommandServerOptions {
    pub channel_name: String,
    /// Publish handler outcomes to the `result` and `error` routes
    pub produce_results: bool,
    pub queue: Option<QueueDefinition>,
    pub consume: ConsumeOptions,
}

impl Default for CommandServerOptions {
    fn default() -> Self {
        CommandServerOptions {
            channel_name: DEFAULT_CHANNEL_NAME.to_owned(),
            produce_results: true,
            queue: None,
            consume: ConsumeOptions::default(),
        }
    }
}

impl CommandServerOptions {
    pub fn channel(mut self, name: &str) -> Self {
        self.channel_name = name.to_owned();
        self
    }

    pub fn without_results(mut self) -> Self {
        self.produce_results = false;
        self
    }
}

fn command_queue(exchange: &str, queue: Option<QueueDefinition>) -> QueueDefinition {
    let name = format!("{}.{}", exchange, COMMAND_ROUTE);
    queue
        .map(|def| def.renamed(&name))
        .unwrap_or_else(|| QueueDefinition::new(&name))
}

#[derive(Clone)]
pub struct CommandSender {
    producer: Producer,
}

impl CommandSender {
    pub(crate) fn new(transport: &Transport, exchange: &str, options: CommandOptions) -> CommandSender {
        let exchange_def = ExchangeDefinition::new(exchange).direct();
        let queue_def = command_queue(exchange, options.queue);

        transport
            .channel(&options.channel_name)
            .add_init(move |channel: ChannelHandle| {
                let exchange_def = exchange_def.clone();
                let queue_def = queue_def.clone();
                async move {
                    channel.assert_exchange(&exchange_def).await?;
                    let queue = channel.assert_queue(&queue_def).await?;
                    channel
                        .bind_queue(
                            &QueueBinding::new(&queue)
                                .exchange(exchange_def.name())
                                .routing_key(COMMAND_ROUTE),
                        )
                        .await
                }
            });

        CommandSender {
            producer: transport.producer(ProducerOptions::new(exchange).channel(&options.channel_name)),
        }
    }

    pub async fn send<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        self.producer.publish(payload, COMMAND_ROUTE, options).await
    }
}

pub(crate) fn serve(
    transport: &Transport,
    exchange: &str,
    options: CommandServerOptions,
    handler: Arc<dyn RpcHandler>,
) -> ConsumerHandle {
    let exchange_def = ExchangeDefinition::new(exchange).direct();

    let producer = if options.produce_results {
        let exchange_def = exchange_def.clone();
        transport
            .channel(&options.channel_name)
            .add_init(move |channel: ChannelHandle| {
                let exchange_def = exchange_def.clone();
                async move { declare_outcome_queues(&channel, &exchange_def).await }
            });
        Some(transport.producer(ProducerOptions::new(exchange).channel(&options.channel_name)))
    } else {
        None
    };

    let consumer = ConsumerOptions::declare(command_queue(exchange, options.queue))
        .channel(&options.channel_name)
        .bind(exchange_def, &[COMMAND_ROUTE])
        .consume_options(options.consume);

    transport.consumer(consumer, move |payload: Value, job: Job| {
        let handler = handler.clone();
        let producer = producer.clone();
        async move { execute(handler.as_ref(), producer.as_ref(), payload, job).await }
    })
}

async fn execute(
    handler: &dyn RpcHandler,
    producer: Option<&Producer>,
    payload: Value,
    job: Job,
) -> Result<(), HandlerError> {
    let outcome = handler.handle(payload, job.clone()).await;

    let Some(outcome) = job.settle(outcome).await else {
        return Ok(());
    };
    let Some(producer) = producer else {
        return Ok(());
    };

    let (route, body) = match outcome {
        Ok(value) => (RESULT_KIND, value),
        Err(remote) => (ERROR_KIND, serde_json::to_value(remote)?),
    };

    let mut options = PublishOptions::default().trace(job.trace_context().clone());
    options.context = job.context().cloned();

    debug!(route, "producing command outcome");
    producer.publish(&body, route, options).await?;
    Ok(())
}

async fn declare_outcome_queues(
    channel: &ChannelHandle,
    exchange: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    channel.assert_exchange(exchange).await?;
    for route in [RESULT_KIND, ERROR_KIND] {
        let queue = channel
            .assert_queue(&QueueDefinition::new(&format!("{}.{}", exchange.name(), route)))
            .await?;
        channel
            .bind_queue(&QueueBinding::new(&queue).exchange(exchange.name()).routing_key(route))
            .await?;
    }
    Ok(())
}

/// Consumers of a command exchange's result and error queues.
pub struct CommandResultRecipient {
    pub result_consumer: ConsumerHandle,
    pub error_consumer: ConsumerHandle,
}

impl CommandResultRecipient {
    pub(crate) fn new(
        transport: &Transport,
        exchange: &str,
        options: CommandOptions,
        on_result: Arc<dyn ConsumeHandler>,
        on_error: Arc<dyn ConsumeHandler>,
    ) -> CommandResultRecipient {
        let consume = |route: &str, handler: Arc<dyn ConsumeHandler>| {
            let queue = QueueDefinition::new(&format!("{}.{}", exchange, route));
            let options = ConsumerOptions::declare(queue)
                .channel(&options.channel_name)
                .bind(ExchangeDefinition::new(exchange).direct(), &[route])
                .consume_options(options.consume.clone());
            Consumer::start(transport, options, handler)
        };

        CommandResultRecipient {
            result_consumer: consume(RESULT_KIND, on_result),
            error_consumer: consume(ERROR_KIND, on_error),
        }
    }

    pub async fn cancel(&self) -> Result<(), AmqpError> {
        self.result_consumer.cancel().await?;
        self.error_consumer.cancel().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::TransportConfig, job::AckStatus, memory::MemoryBroker};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn transport(broker: &MemoryBroker) -> Transport {
        Transport::new(TransportConfig::new("memory://"), Arc::new(broker.clone())).unwrap()
    }

    fn recorder(
        tx: mpsc::UnboundedSender<(&'static str, Value, Option<Value>)>,
        kind: &'static str,
    ) -> impl ConsumeHandler {
        move |payload: Value, job: Job| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((kind, payload, job.context().cloned()));
                Ok::<_, HandlerError>(())
            }
        }
    }

    fn greeter() -> impl RpcHandler {
        |payload: Value, _job: Job| async move {
            if payload.as_u64().unwrap_or_default() > 0 {
                Ok(json!("hola"))
            } else {
                Err(HandlerError::new("Oops"))
            }
        }
    }

    #[tokio::test]
    async fn produces_results_with_context() {
        let broker = MemoryBroker::new();
        let transport = transport(&broker);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sender = transport.command_sender("command.test", CommandOptions::default());
        transport.command_result_recipient(
            "command.test",
            CommandOptions::default(),
            recorder(tx.clone(), "result"),
            recorder(tx, "error"),
        );
        transport.command_server("command.test", CommandServerOptions::default(), greeter());
        transport.connect().await.unwrap();
        transport.ready().await.unwrap();

        sender
            .send(&json!(1), PublishOptions::default().context(json!({"say": "hello"})))
            .await
            .unwrap();
        let (kind, payload, context) = rx.recv().await.unwrap();
        assert_eq!(kind, "result");
        assert_eq!(payload, json!("hola"));
        assert_eq!(context, Some(json!({"say": "hello"})));

        sender.send(&json!(0), PublishOptions::default()).await.unwrap();
        let (kind, payload, context) = rx.recv().await.unwrap();
        assert_eq!(kind, "error");
        assert_eq!(payload["message"], json!("Oops"));
        assert_eq!(context, None);
    }

    #[tokio::test]
    async fn server_acks_and_skips_results_when_disabled() {
        let broker = MemoryBroker::new();
        let transport = transport(&broker);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let sender = transport.command_sender("quiet", CommandOptions::default());
        transport.command_server(
            "quiet",
            CommandServerOptions::default().without_results(),
            move |payload: Value, job: Job| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((payload, job.clone()));
                    Ok::<_, HandlerError>(Value::Null)
                }
            },
        );
        transport.connect().await.unwrap();
        transport.ready().await.unwrap();

        sender.send(&json!({"op": "sync"}), PublishOptions::default()).await.unwrap();
        let (payload, job) = rx.recv().await.unwrap();
        assert_eq!(payload, json!({"op": "sync"}));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(job.ack_status(), AckStatus::Ack);
        assert_eq!(broker.queue_depth("quiet.command"), Some(0));
        assert!(!broker.has_queue("quiet.result"));
    }
}
