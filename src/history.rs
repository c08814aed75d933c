// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message History
//!
//! Provenance tracking for messages. Every endpoint a message passes through
//! appends one [`HistoryEntry`] to the history stored under the reserved
//! [`headers::HISTORY`] header. Entries are only ever appended.

use crate::message::{headers, now_millis, HeaderValue, Message, MessageBuilder};
use serde::{Deserialize, Serialize};

/// One traversed component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub timestamp: u64,
}

/// Ordered, append-only list of traversed components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHistory(Vec<HistoryEntry>);

impl MessageHistory {
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.0.last()
    }

    /// Finds the `index`-th entry recorded by the component `name`.
    pub fn locate(&self, name: &str, index: usize) -> Option<&HistoryEntry> {
        self.0.iter().filter(|e| e.name == name).nth(index)
    }

    fn appended(&self, entry: HistoryEntry) -> MessageHistory {
        let mut entries = Vec::with_capacity(self.0.len() + 1);
        entries.extend_from_slice(&self.0);
        entries.push(entry);
        MessageHistory(entries)
    }

    /// JSON form used when the history crosses the broker.
    pub(crate) fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_owned())
    }

    pub(crate) fn from_json(raw: &str) -> Option<MessageHistory> {
        serde_json::from_str(raw).ok()
    }
}

/// Returns a new message whose history is the input's with one entry appended.
pub fn record(message: &Message, name: &str, component_type: &str) -> Message {
    let history = read(message).appended(HistoryEntry {
        name: name.to_owned(),
        component_type: component_type.to_owned(),
        timestamp: now_millis(),
    });

    MessageBuilder::from_message(message)
        .header(headers::HISTORY, HeaderValue::History(history))
        .build()
}

/// Reads the history of a message; empty when none was recorded.
pub fn read(message: &Message) -> MessageHistory {
    match message.header(headers::HISTORY) {
        Some(HeaderValue::History(history)) => history.clone(),
        Some(HeaderValue::String(raw)) => MessageHistory::from_json(raw).unwrap_or_default(),
        _ => MessageHistory::default(),
    }
}
