// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Plain configuration structs handed to the connection factory, listener
//! containers and endpoints. All of them deserialize with `serde` and provide
//! defaults; durations are expressed in milliseconds.

use crate::errors::IntegrationError;
use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};
use std::{env, time::Duration};

/// Connection parameters for the RabbitMQ server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfig {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for RabbitMQConfig {
    fn default() -> Self {
        RabbitMQConfig {
            app_name: "rabbitmq-integration".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "".to_owned(),
        }
    }
}

impl RabbitMQConfig {
    /// Reads `APP_NAME` and `RABBITMQ_{HOST,PORT,USER,PASSWORD,VHOST}`,
    /// falling back to the defaults for unset variables.
    pub fn from_env() -> Result<RabbitMQConfig, IntegrationError> {
        let defaults = RabbitMQConfig::default();

        let port = match env::var("RABBITMQ_PORT") {
            Ok(raw) => raw.parse::<u16>().map_err(|_| {
                IntegrationError::ConfigurationError(format!("invalid RABBITMQ_PORT `{raw}`"))
            })?,
            Err(_) => defaults.port,
        };

        Ok(RabbitMQConfig {
            app_name: env::var("APP_NAME").unwrap_or(defaults.app_name),
            host: env::var("RABBITMQ_HOST").unwrap_or(defaults.host),
            port,
            user: env::var("RABBITMQ_USER").unwrap_or(defaults.user),
            password: env::var("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            vhost: env::var("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
        })
    }

    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

/// Exponential backoff used when (re)connecting to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts after the first one before giving up.
    pub max_retries: usize,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            min_delay_ms: 100,
            max_delay_ms: 30_000,
            max_retries: 5,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    pub fn builder(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_retries);

        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// Concurrency strategy of a listener container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    /// Fixed workers, each owning a connection and pulling deliveries.
    #[default]
    Pooled,
    /// Broker-pushed deliveries executed on a shared worker pool.
    Direct,
}

/// Options of a [`ConsumerContainer`](crate::container::ConsumerContainer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub kind: ContainerKind,
    /// Pooled: number of workers (one connection each).
    pub concurrency: usize,
    /// Direct: consumers opened per queue.
    pub consumers_per_queue: usize,
    /// Direct: deliveries processed at the same time across all consumers.
    pub pool_size: usize,
    pub prefetch_count: u16,
    /// Grace period given to in-flight deliveries on stop.
    pub shutdown_timeout_ms: u64,
    /// Retries for queues that do not configure their own.
    pub default_retries: u32,
    /// Declare the bound queues on start.
    pub declare_queues: bool,
    pub backoff: BackoffConfig,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        ContainerConfig {
            kind: ContainerKind::Pooled,
            concurrency: 1,
            consumers_per_queue: 1,
            pool_size: 4,
            prefetch_count: 250,
            shutdown_timeout_ms: 5_000,
            default_retries: 3,
            declare_queues: true,
            backoff: BackoffConfig::default(),
        }
    }
}

impl ContainerConfig {
    pub fn pooled(concurrency: usize) -> ContainerConfig {
        ContainerConfig {
            kind: ContainerKind::Pooled,
            concurrency,
            ..Default::default()
        }
    }

    pub fn direct(consumers_per_queue: usize, pool_size: usize) -> ContainerConfig {
        ContainerConfig {
            kind: ContainerKind::Direct,
            consumers_per_queue,
            pool_size,
            ..Default::default()
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<(), IntegrationError> {
        match self.kind {
            ContainerKind::Pooled if self.concurrency == 0 => Err(
                IntegrationError::ConfigurationError("concurrency must be at least 1".to_owned()),
            ),
            ContainerKind::Direct if self.consumers_per_queue == 0 || self.pool_size == 0 => {
                Err(IntegrationError::ConfigurationError(
                    "consumers_per_queue and pool_size must be at least 1".to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }
}
