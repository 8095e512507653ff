//! Versioned message envelope stored in `tasks.message`.
//!
//! Wire form is JSON with byte fields in standard base64:
//!
//! ```json
//! {"v":1,"message_id":"…","queue_name":"default","actor_name":"echo",
//!  "args":"W10=","kwargs":"e30=","options":"","enqueued_at":"2024-01-01T00:00:00Z"}
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Current envelope version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Errors encoding or decoding an envelope.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 in field '{field}': {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("Unsupported envelope version {0}")]
    UnsupportedVersion(u32),
}

/// A task invocation: which actor, on which queue, with which arguments.
///
/// `args`, `kwargs` and `options` are opaque to the broker; the producer and
/// the actor agree on their encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: Uuid,
    pub queue_name: String,
    pub actor_name: String,
    pub args: Vec<u8>,
    pub kwargs: Vec<u8>,
    pub options: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u32,
    message_id: Uuid,
    queue_name: String,
    actor_name: String,
    #[serde(default)]
    args: String,
    #[serde(default)]
    kwargs: String,
    #[serde(default)]
    options: String,
    enqueued_at: DateTime<Utc>,
}

impl Message {
    /// Creates a message with a fresh id, enqueued now.
    pub fn new(
        queue_name: impl Into<String>,
        actor_name: impl Into<String>,
        args: Vec<u8>,
        kwargs: Vec<u8>,
        options: Vec<u8>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            queue_name: queue_name.into(),
            actor_name: actor_name.into(),
            args,
            kwargs,
            options,
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_message_id(mut self, message_id: Uuid) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let envelope = Envelope {
            v: ENVELOPE_VERSION,
            message_id: self.message_id,
            queue_name: self.queue_name.clone(),
            actor_name: self.actor_name.clone(),
            args: STANDARD.encode(&self.args),
            kwargs: STANDARD.encode(&self.kwargs),
            options: STANDARD.encode(&self.options),
            enqueued_at: self.enqueued_at,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if envelope.v != ENVELOPE_VERSION {
            return Err(MessageError::UnsupportedVersion(envelope.v));
        }

        let field = |field: &'static str, value: &str| {
            STANDARD
                .decode(value)
                .map_err(|source| MessageError::Base64 { field, source })
        };

        Ok(Self {
            message_id: envelope.message_id,
            args: field("args", &envelope.args)?,
            kwargs: field("kwargs", &envelope.kwargs)?,
            options: field("options", &envelope.options)?,
            queue_name: envelope.queue_name,
            actor_name: envelope.actor_name,
            enqueued_at: envelope.enqueued_at,
        })
    }

    /// Decodes `args` as JSON.
    pub fn args_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, MessageError> {
        Ok(serde_json::from_slice(&self.args)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::new(
            "default",
            "echo",
            br#"["hello"]"#.to_vec(),
            br#"{"loud":true}"#.to_vec(),
            Vec::new(),
        )
    }

    #[test]
    fn test_encode_decode_preserves_message() {
        let message = sample();
        let decoded = Message::decode(&message.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_encoded_envelope_is_versioned_json() {
        let encoded = sample().encode().expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&encoded).expect("json");
        assert_eq!(value["v"], 1);
        assert_eq!(value["actor_name"], "echo");
        assert_eq!(value["args"], STANDARD.encode(br#"["hello"]"#));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&sample().encode().expect("encode")).expect("json");
        value["v"] = serde_json::json!(2);
        let bytes = serde_json::to_vec(&value).expect("json");

        assert!(matches!(
            Message::decode(&bytes),
            Err(MessageError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&sample().encode().expect("encode")).expect("json");
        value["kwargs"] = serde_json::json!("***");
        let bytes = serde_json::to_vec(&value).expect("json");

        match Message::decode(&bytes) {
            Err(MessageError::Base64 { field, .. }) => assert_eq!(field, "kwargs"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_args_json() {
        let args: Vec<String> = sample().args_json().expect("args");
        assert_eq!(args, vec!["hello".to_string()]);
    }
}
