//! Helpers for the opaque message values carried by the broker.
//!
//! The broker never looks at message content. It only reads the embedded
//! `to` address (used when a publishing link has no target) and the message
//! id (used in log lines).

use fe2o3_amqp::types::messaging::{Body, Message, MessageId};
use fe2o3_amqp::types::primitives::Value;

/// Message type stored in queues and forwarded to consumers.
pub type BrokerMessage = Message<Body<Value>>;

/// The address embedded in the message properties, if any.
pub fn embedded_address(message: &BrokerMessage) -> Option<&str> {
    message
        .properties
        .as_ref()
        .and_then(|p| p.to.as_deref())
}

/// The message id rendered as a string, if the message carries one.
pub fn message_id(message: &BrokerMessage) -> Option<String> {
    message
        .properties
        .as_ref()
        .and_then(|p| p.message_id.as_ref())
        .map(message_id_to_string)
}

/// Short description for log lines.
pub fn summarize(message: &BrokerMessage) -> String {
    match message_id(message) {
        Some(id) => format!("message '{id}'"),
        None => "message".to_string(),
    }
}

fn message_id_to_string(id: &MessageId) -> String {
    match id {
        MessageId::String(s) => s.clone(),
        MessageId::Ulong(n) => n.to_string(),
        MessageId::Uuid(u) => format!("{:?}", u),
        MessageId::Binary(b) => b.iter().map(|byte| format!("{:02x}", byte)).collect(),
    }
}
