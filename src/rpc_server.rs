// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Server
//!
//! Consumes `<exchange>.query`, bound to the exchange with route `query`, and answers
//! every request on the same exchange with route = the request's `reply_to`.
//!
//! When the handler returns, the job is settled: unless the handler nacked it, the
//! request is acked and a `result` reply (or an `error` reply carrying
//! `{message, stack, details}`) is published with the request's correlation id. A
//! nacked request gets no reply and no implicit ack, so the broker redelivers it.

use crate::{
    config::DEFAULT_CHANNEL_NAME,
    consumer::{ConsumerHandle, ConsumerOptions},
    errors::HandlerError,
    exchange::ExchangeDefinition,
    job::Job,
    producer::{Producer, ProducerOptions, PublishOptions},
    queue::QueueDefinition,
    rpc_client::{ERROR_KIND, QUERY_ROUTE, RESULT_KIND},
    transport::Transport,
};
use async_trait::async_trait;
use serde_json::Value;
use std::{future::Future, sync::Arc};
use tracing::{debug, warn};

/// Handles RPC requests (and commands).
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Value, job: Job) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(Value, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, payload: Value, job: Job) -> Result<Value, HandlerError> {
        self(payload, job).await
    }
}

#[derive(Debug, Clone)]
pub struct RpcServerOptions {
    pub channel_name: String,
    /// Overrides the declaration of the request queue; its name is always
    /// `<exchange>.query`
    pub queue: Option<QueueDefinition>,
}

impl Default for RpcServerOptions {
    fn default() -> Self {
        RpcServerOptions {
            channel_name: DEFAULT_CHANNEL_NAME.to_owned(),
            queue: None,
        }
    }
}

impl RpcServerOptions {
    pub fn channel(mut self, name: &str) -> Self {
        self.channel_name = name.to_owned();
        self
    }
}

pub(crate) fn start(
    transport: &Transport,
    exchange: &str,
    options: RpcServerOptions,
    handler: Arc<dyn RpcHandler>,
) -> ConsumerHandle {
    let queue_name = format!("{}.{}", exchange, QUERY_ROUTE);
    let queue = options
        .queue
        .map(|def| def.renamed(&queue_name))
        .unwrap_or_else(|| QueueDefinition::new(&queue_name));

    let producer = transport.producer(ProducerOptions::new(exchange).channel(&options.channel_name));

    transport.consumer(
        ConsumerOptions::declare(queue)
            .channel(&options.channel_name)
            .bind(ExchangeDefinition::new(exchange).direct(), &[QUERY_ROUTE]),
        move |payload: Value, job: Job| {
            let handler = handler.clone();
            let producer = producer.clone();
            async move { answer(handler.as_ref(), &producer, payload, job).await }
        },
    )
}

async fn answer(
    handler: &dyn RpcHandler,
    producer: &Producer,
    payload: Value,
    job: Job,
) -> Result<(), HandlerError> {
    let props = job.msg().properties.clone();
    let outcome = handler.handle(payload, job.clone()).await;

    let Some(reply) = job.settle(outcome).await else {
        return Ok(());
    };

    let Some(reply_to) = props.reply_to.as_deref() else {
        warn!("request without reply_to, dropping reply");
        return Ok(());
    };

    let (kind, body) = match reply {
        Ok(value) => (RESULT_KIND, value),
        Err(remote) => (ERROR_KIND, serde_json::to_value(remote)?),
    };

    let mut options = PublishOptions::default()
        .kind(kind)
        .trace(job.trace_context().clone());
    options.correlation_id = props.correlation_id;

    debug!(reply_to, kind, "replying");
    producer.publish(&body, reply_to, options).await?;
    Ok(())
}
