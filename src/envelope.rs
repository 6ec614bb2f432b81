// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Every body on the wire is the JSON document `{"payload": <any>, "context": <any|null>}`.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A decoded message body.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub context: Option<Value>,
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a, T: ?Sized> {
    payload: &'a T,
    context: Option<&'a Value>,
}

/// Serializes a payload and its optional context into an envelope body.
pub fn encode<T: Serialize + ?Sized>(payload: &T, context: Option<&Value>) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(&OutgoingEnvelope { payload, context })
        .map_err(|err| AmqpError::MalformedMessage(err.to_string()))
}

/// Parses an envelope body.
///
/// A body that is not a JSON object is rejected; a JSON `null` body is accepted
/// as an empty envelope.
pub fn decode(content: &[u8]) -> Result<Envelope, AmqpError> {
    let value: Value =
        serde_json::from_slice(content).map_err(|err| AmqpError::MalformedMessage(err.to_string()))?;

    match value {
        Value::Null => Ok(Envelope::default()),
        Value::Object(_) => serde_json::from_value(value)
            .map_err(|err| AmqpError::MalformedMessage(err.to_string())),
        other => Err(AmqpError::MalformedMessage(format!(
            "expected an envelope object, got `{}`",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_null_context() {
        let body = encode(&json!({"n": 8}), None).unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&body).unwrap(),
            json!({"payload": {"n": 8}, "context": null})
        );
    }

    #[test]
    fn decodes_missing_fields_as_null() {
        let env = decode(br#"{"context": {"user": 1}}"#).unwrap();
        assert_eq!(env.payload, Value::Null);
        assert_eq!(env.context, Some(json!({"user": 1})));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(decode(b"not json"), Err(AmqpError::MalformedMessage(_))));
        assert!(matches!(decode(b"[1,2]"), Err(AmqpError::MalformedMessage(_))));
    }
}
