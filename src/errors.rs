// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Transport
//!
//! This module provides the error taxonomy shared by every layer of the transport.
//! The `AmqpError` enum covers connection, channel initialization, broker operations,
//! RPC correlation and message decoding failures. It is `Clone` so a single failure
//! (for instance a transport shutdown) can be delivered to every waiting caller.
//!
//! `RemoteError` is the structured body of an `error`-tagged reply and `HandlerError`
//! is what consumer and RPC handlers return when they fail.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Represents errors that can occur during AMQP transport operations.
///
/// Each variant provides specific context about what operation failed. Connection
/// and channel level failures are recovered by the reconnect loop when it is enabled;
/// RPC level failures are only ever surfaced to the caller awaiting that call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AmqpError {
    /// A configuration value failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error establishing (or keeping) a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// A setup action failed while the channel was being (re)opened
    #[error("failure to initialize channel `{channel}`: {reason}")]
    ChannelInitError { channel: String, reason: String },

    /// A broker operation was invoked while the channel has no live reference
    #[error("channel `{0}` is not connected")]
    NotConnected(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error purging the ready messages of a queue
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error deleting a queue
    #[error("failure to delete queue `{0}`")]
    DeleteQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// A delivery body could not be decoded as an envelope
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// No reply arrived for the correlation id before its expiration
    #[error("rpc request `{0}` expired")]
    RpcTimeout(String),

    /// The remote handler failed and answered with an `error` reply
    #[error("remote handler failure: {0}")]
    Remote(RemoteError),

    /// The transport was closed while the operation was outstanding
    #[error("transport closed")]
    TransportClosed,
}

/// Structured error carried in the body of an `error`-tagged reply.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl RemoteError {
    /// Builds a remote error from an `error` reply payload.
    ///
    /// Payloads that do not follow the `{message, stack, details}` shape are kept
    /// whole in `details`.
    pub fn from_payload(payload: Value) -> RemoteError {
        match serde_json::from_value::<RemoteError>(payload.clone()) {
            Ok(err) => err,
            Err(_) => RemoteError {
                message: "remote handler failure".to_owned(),
                stack: None,
                details: Some(payload),
            },
        }
    }
}

/// Failure returned by consumer and RPC handlers.
///
/// Any `std::error::Error` converts into a `HandlerError`, so handlers can use `?`
/// freely. The error's source chain is rendered into `stack`.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    message: String,
    stack: Option<String>,
    details: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
            stack: None,
            details: None,
        }
    }

    /// Attaches structured details that are forwarded to the caller as-is.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    /// Converts the failure into the body of an `error` reply.
    pub fn into_remote(self) -> RemoteError {
        RemoteError {
            message: self.message,
            stack: self.stack,
            details: self.details,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error,
{
    fn from(err: E) -> Self {
        let mut chain = vec![];
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }

        HandlerError {
            message: err.to_string(),
            stack: if chain.is_empty() {
                None
            } else {
                Some(chain.join("\n"))
            },
            details: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Error, Debug)]
    #[error("outer")]
    struct Outer {
        #[source]
        inner: std::io::Error,
    }

    #[test]
    fn handler_error_renders_source_chain() {
        let err = Outer {
            inner: std::io::Error::new(std::io::ErrorKind::Other, "disk gone"),
        };

        let remote = HandlerError::from(err).into_remote();

        assert_eq!(remote.message, "outer");
        assert_eq!(remote.stack.as_deref(), Some("caused by: disk gone"));
        assert_eq!(remote.details, None);
    }

    #[test]
    fn remote_error_keeps_unexpected_payloads() {
        let remote = RemoteError::from_payload(json!(42));
        assert_eq!(remote.details, Some(json!(42)));

        let remote = RemoteError::from_payload(json!({"message": "n is not natural", "details": {"n": -1}}));
        assert_eq!(remote.message, "n is not natural");
        assert_eq!(remote.details, Some(json!({"n": -1})));
    }
}
