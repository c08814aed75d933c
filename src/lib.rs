// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod container;
pub mod endpoint;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod flow;
pub mod header_mapper;
pub mod history;
pub mod message;
pub mod queue;
pub mod template;
pub mod topology;

pub use channel::{ChannelKind, ChannelRegistry, MessageChannel};
pub use errors::IntegrationError;
pub use flow::{IntegrationFlow, Lifecycle};
pub use message::{Message, Payload};
