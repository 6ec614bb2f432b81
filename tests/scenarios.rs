// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use amqp_transport::{
    config::{ChannelSettings, TransportConfig},
    consumer::ConsumerOptions,
    exchange::ExchangeDefinition,
    job::Job,
    memory::MemoryBroker,
    producer::{ProducerOptions, PublishOptions},
    queue::QueueDefinition,
    rpc_client::RpcClientOptions,
    rpc_server::RpcServerOptions,
    AmqpError, HandlerError, Transport, TransportEvent,
};
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;

fn fib(n: u64) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        (a, b) = (b, a + b);
    }
    a
}

fn transport(broker: &MemoryBroker, config: TransportConfig) -> Transport {
    Transport::new(config, Arc::new(broker.clone())).unwrap()
}

#[tokio::test]
async fn rpc_computes_fibonacci() {
    let broker = MemoryBroker::new();
    let transport = transport(&broker, TransportConfig::new("memory://"));
    transport.rpc_server("fibonacci", RpcServerOptions::default(), |payload: Value, _job: Job| async move {
        let n = payload["n"].as_u64().ok_or_else(|| HandlerError::new("n is required"))?;
        Ok::<_, HandlerError>(json!(fib(n)))
    });
    let client = transport.rpc_client("fibonacci", RpcClientOptions::default());

    transport.connect().await.unwrap();
    transport.ready().await.unwrap();

    let n: u64 = client.call(&json!({"n": 8})).await.unwrap();
    assert_eq!(n, 21);

    transport.close().await.unwrap();
}

#[tokio::test]
async fn nacked_request_is_answered_once_after_redelivery() {
    let broker = MemoryBroker::new();
    let transport = transport(&broker, TransportConfig::new("memory://"));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    transport.rpc_server("fibonacci", RpcServerOptions::default(), move |payload: Value, job: Job| {
        let counter = counter.clone();
        async move {
            if !job.msg().redelivered {
                counter.fetch_add(1, Ordering::SeqCst);
                job.nack().await?;
                return Ok(Value::Null);
            }
            counter.fetch_add(1, Ordering::SeqCst);
            job.ack().await?;
            Ok::<_, HandlerError>(json!(fib(payload["n"].as_u64().unwrap_or_default())))
        }
    });
    let client = transport.rpc_client("fibonacci", RpcClientOptions::default());

    transport.connect().await.unwrap();
    transport.ready().await.unwrap();

    assert_eq!(client.send(&json!({"n": 8})).await.unwrap(), json!(21));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(broker.queue_depth("fibonacci.query"), Some(0));
}

#[tokio::test]
async fn close_rejects_outstanding_requests() {
    let broker = MemoryBroker::new();
    let transport = transport(&broker, TransportConfig::new("memory://"));
    let client = transport.rpc_client("silent", RpcClientOptions::default());
    let mut events = transport.events();

    transport.connect().await.unwrap();
    transport.ready().await.unwrap();

    let calls: Vec<_> = (0..3)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move { client.send(&json!({"n": n})).await })
        })
        .collect();
    while client.pending_requests() < 3 {
        tokio::task::yield_now().await;
    }
    // let the requests reach the broker
    tokio::time::sleep(Duration::from_millis(20)).await;

    transport.close().await.unwrap();

    for call in calls {
        let outcome = tokio::time::timeout(Duration::from_millis(100), call)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Err(AmqpError::TransportClosed));
    }
    assert_eq!(client.pending_requests(), 0);

    loop {
        if events.recv().await.unwrap() == TransportEvent::Closed {
            break;
        }
    }
}

#[tokio::test]
async fn named_channels_consume_independently() {
    let broker = MemoryBroker::new();
    let config = TransportConfig::new("memory://")
        .channel_prefetch("alpha", 1, false)
        .channel_prefetch("bravo", 5, false);
    let transport = transport(&broker, config);
    let (seen, mut received) = mpsc::unbounded_channel();

    for name in ["alpha", "bravo"] {
        let seen = seen.clone();
        transport.consumer(
            ConsumerOptions::declare(QueueDefinition::new(&format!("{}.inbox", name)))
                .channel(name)
                .bind(ExchangeDefinition::new("greetings").direct(), &[name]),
            move |payload: Value, job: Job| {
                let seen = seen.clone();
                async move {
                    job.ack().await?;
                    let _ = seen.send((job.msg().routing_key.clone(), payload));
                    Ok::<_, HandlerError>(())
                }
            },
        );
    }
    let producer = transport.producer(ProducerOptions::new("greetings"));

    transport.connect().await.unwrap();
    transport.ready().await.unwrap();
    assert_eq!(transport.channel("alpha").settings().count, 1);
    assert_eq!(transport.channel("bravo").settings().count, 5);

    producer
        .publish("hello alpha", "alpha", PublishOptions::default())
        .await
        .unwrap();
    producer
        .publish("hello bravo", "bravo", PublishOptions::default())
        .await
        .unwrap();

    let mut messages = vec![received.recv().await.unwrap(), received.recv().await.unwrap()];
    messages.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        messages,
        vec![
            ("alpha".to_owned(), json!("hello alpha")),
            ("bravo".to_owned(), json!("hello bravo")),
        ]
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(received.try_recv().is_err());
}

#[tokio::test]
async fn rpc_survives_reconnect() {
    let broker = MemoryBroker::new();
    let config = TransportConfig::new("memory://").reconnect(Duration::from_millis(10));
    let transport = transport(&broker, config);
    transport.rpc_server("fibonacci", RpcServerOptions::default(), |payload: Value, _job: Job| async move {
        Ok::<_, HandlerError>(json!(fib(payload["n"].as_u64().unwrap_or_default())))
    });
    let client = transport.rpc_client("fibonacci", RpcClientOptions::default());

    transport.connect().await.unwrap();
    transport.ready().await.unwrap();
    assert_eq!(client.send(&json!({"n": 5})).await.unwrap(), json!(5));

    let mut events = transport.events();
    broker.drop_connections();
    loop {
        if events.recv().await.unwrap() == TransportEvent::Ready {
            break;
        }
    }

    assert_eq!(client.send(&json!({"n": 10})).await.unwrap(), json!(55));
    assert!(broker.has_queue(client.reply_queue()));
}

#[test]
fn channel_settings_fall_back_to_defaults() {
    let settings = ChannelSettings::default();
    assert!(!settings.effective("anything").global);
}
