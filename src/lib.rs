// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
mod pending;

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod command;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod job;
pub mod memory;
pub mod producer;
pub mod pubsub;
pub mod queue;
pub mod rpc_client;
pub mod rpc_server;
pub mod topology;
pub mod transport;

pub use config::TransportConfig;
pub use errors::{AmqpError, HandlerError, RemoteError};
pub use job::Job;
pub use transport::{Transport, TransportEvent};
