// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Internal Message Envelope
//!
//! Messages are what endpoints exchange through internal channels. A message is
//! immutable: every hop produces a new message through [`MessageBuilder`] or one
//! of the `with_*` helpers, carrying a fresh id and timestamp.

use crate::{errors::IntegrationError, history::MessageHistory};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

/// Well-known header keys.
pub mod headers {
    /// Reserved key holding the [`MessageHistory`](crate::history::MessageHistory)
    pub const HISTORY: &str = "history";
    /// Name of the registry channel a reply must be sent to
    pub const REPLY_CHANNEL: &str = "replyChannel";
    pub const CONTENT_TYPE: &str = "contentType";

    pub const AMQP_RECEIVED_ROUTING_KEY: &str = "amqp_receivedRoutingKey";
    pub const AMQP_RECEIVED_EXCHANGE: &str = "amqp_receivedExchange";
    pub const AMQP_DELIVERY_TAG: &str = "amqp_deliveryTag";
    pub const AMQP_REDELIVERED: &str = "amqp_redelivered";
    pub const AMQP_MESSAGE_ID: &str = "amqp_messageId";
    pub const AMQP_CORRELATION_ID: &str = "amqp_correlationId";
    pub const AMQP_REPLY_TO: &str = "amqp_replyTo";
    pub const AMQP_TYPE: &str = "amqp_type";
    /// Overrides the exchange an outbound endpoint publishes to
    pub const AMQP_EXCHANGE: &str = "amqp_exchange";
    /// Overrides the routing key an outbound endpoint publishes with
    pub const AMQP_ROUTING_KEY: &str = "amqp_routingKey";

    pub const FILE_NAME: &str = "file_name";
    pub const FILE_PATH: &str = "file_path";
}

pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Milliseconds since the unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Message body: opaque bytes or a typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Bytes(Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    /// Encodes the payload for the wire.
    pub fn to_bytes(&self) -> Result<Cow<'_, [u8]>, IntegrationError> {
        match self {
            Payload::Bytes(b) => Ok(Cow::Borrowed(b.as_slice())),
            Payload::Text(t) => Ok(Cow::Borrowed(t.as_bytes())),
            Payload::Json(v) => serde_json::to_vec(v)
                .map(Cow::Owned)
                .map_err(|e| IntegrationError::HandlerError(e.to_string())),
        }
    }

    /// Text view of the payload, when it is valid UTF-8.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Payload::Text(t) => Some(Cow::Borrowed(t)),
            Payload::Bytes(b) => std::str::from_utf8(b).ok().map(Cow::Borrowed),
            Payload::Json(v) => Some(Cow::Owned(v.to_string())),
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Payload::Bytes(_) => OCTET_STREAM_CONTENT_TYPE,
            Payload::Text(_) => TEXT_CONTENT_TYPE,
            Payload::Json(_) => JSON_CONTENT_TYPE,
        }
    }

    /// Decodes a wire body according to its content type.
    pub fn from_wire(body: Vec<u8>, content_type: Option<&str>) -> Payload {
        match content_type {
            Some(JSON_CONTENT_TYPE) => match serde_json::from_slice(&body) {
                Ok(v) => Payload::Json(v),
                Err(_) => Payload::Bytes(body),
            },
            Some(ct) if ct.starts_with("text/") => match String::from_utf8(body) {
                Ok(t) => Payload::Text(t),
                Err(e) => Payload::Bytes(e.into_bytes()),
            },
            _ => Payload::Bytes(body),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_owned())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// A single header value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    History(MessageHistory),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<MessageHistory> for HeaderValue {
    fn from(value: MessageHistory) -> Self {
        HeaderValue::History(value)
    }
}

pub type Headers = HashMap<String, HeaderValue>;

/// Immutable message envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: Uuid,
    timestamp: u64,
    payload: Payload,
    headers: Headers,
}

impl Message {
    pub fn new(payload: impl Into<Payload>) -> Message {
        MessageBuilder::with_payload(payload).build()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Creation time in milliseconds since the unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    /// String header shortcut.
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    /// New message with the same payload and one header added or replaced.
    pub fn with_header(&self, key: &str, value: impl Into<HeaderValue>) -> Message {
        MessageBuilder::from_message(self).header(key, value).build()
    }

    /// New message with the same headers and another payload.
    pub fn with_payload(&self, payload: impl Into<Payload>) -> Message {
        MessageBuilder::from_message(self).payload(payload).build()
    }
}

/// Builds messages, optionally starting from an existing one.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    payload: Payload,
    headers: Headers,
}

impl MessageBuilder {
    pub fn with_payload(payload: impl Into<Payload>) -> MessageBuilder {
        MessageBuilder {
            payload: payload.into(),
            headers: Headers::default(),
        }
    }

    /// Copies payload and headers; id and timestamp are regenerated on build.
    pub fn from_message(message: &Message) -> MessageBuilder {
        MessageBuilder {
            payload: message.payload.clone(),
            headers: message.headers.clone(),
        }
    }

    pub fn payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    /// Adds the headers, keeping existing keys that are not overwritten.
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn remove_header(mut self, key: &str) -> Self {
        self.headers.remove(key);
        self
    }

    pub fn build(self) -> Message {
        Message {
            id: Uuid::new_v4(),
            timestamp: now_millis(),
            payload: self.payload,
            headers: self.headers,
        }
    }
}
