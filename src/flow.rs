// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Integration Flow
//!
//! Owns the channel registry and the event stream of one flow, together with
//! the components wired to them. Components start in registration order and
//! stop in reverse order.

use crate::{channel::ChannelRegistry, errors::IntegrationError, events::EventStream};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

/// A component that can be started and stopped.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &str;

    /// Starting a running component is a no-op.
    async fn start(&self) -> Result<(), IntegrationError>;

    /// Stopping a stopped component is a no-op.
    async fn stop(&self) -> Result<(), IntegrationError>;

    fn is_running(&self) -> bool;
}

pub struct IntegrationFlow {
    registry: ChannelRegistry,
    events: EventStream,
    components: Vec<Arc<dyn Lifecycle>>,
}

impl Default for IntegrationFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegrationFlow {
    pub fn new() -> IntegrationFlow {
        IntegrationFlow::with_registry(ChannelRegistry::new(EventStream::new()))
    }

    pub fn with_registry(registry: ChannelRegistry) -> IntegrationFlow {
        IntegrationFlow {
            events: registry.events().clone(),
            registry,
            components: Vec::new(),
        }
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn events(&self) -> &EventStream {
        &self.events
    }

    pub fn register(&mut self, component: Arc<dyn Lifecycle>) -> &mut Self {
        self.components.push(component);
        self
    }

    pub fn components(&self) -> &[Arc<dyn Lifecycle>] {
        &self.components
    }

    /// Starts every component; on failure, the ones already started are
    /// stopped again and the error is returned.
    pub async fn start(&self) -> Result<(), IntegrationError> {
        for (started, component) in self.components.iter().enumerate() {
            if let Err(err) = component.start().await {
                error!(
                    error = err.to_string(),
                    component = component.name(),
                    "failure to start component"
                );
                for previous in self.components[..started].iter().rev() {
                    if let Err(err) = previous.stop().await {
                        error!(
                            error = err.to_string(),
                            component = previous.name(),
                            "failure to stop component"
                        );
                    }
                }
                return Err(err);
            }
            debug!(component = component.name(), "component started");
        }

        info!(components = self.components.len(), "integration flow started");
        Ok(())
    }

    /// Stops every component and clears the registry, returning the first
    /// failure once all components were asked to stop.
    pub async fn stop(&self) -> Result<(), IntegrationError> {
        let mut first_error = None;
        for component in self.components.iter().rev() {
            if let Err(err) = component.stop().await {
                error!(
                    error = err.to_string(),
                    component = component.name(),
                    "failure to stop component"
                );
                first_error.get_or_insert(err);
            }
        }
        self.registry.clear().await;

        info!("integration flow stopped");
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_running(&self) -> bool {
        !self.components.is_empty() && self.components.iter().all(|c| c.is_running())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };

    struct Recorder {
        name: &'static str,
        fail_start: bool,
        running: AtomicBool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Recorder> {
            Recorder::build(name, false, log)
        }

        fn build(name: &'static str, fail_start: bool, log: &Arc<Mutex<Vec<String>>>) -> Arc<Recorder> {
            Arc::new(Recorder {
                name,
                fail_start,
                running: AtomicBool::new(false),
                log: log.clone(),
            })
        }
    }

    #[async_trait]
    impl Lifecycle for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn start(&self) -> Result<(), IntegrationError> {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            if self.fail_start {
                return Err(IntegrationError::ConfigurationError(self.name.into()));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), IntegrationError> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn should_start_in_order_and_stop_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut flow = IntegrationFlow::new();
        flow.register(Recorder::new("inbound", &log))
            .register(Recorder::new("activator", &log));
        flow.registry().channel("requests").await.unwrap();

        flow.start().await.unwrap();
        assert!(flow.is_running());
        flow.stop().await.unwrap();

        assert!(!flow.is_running());
        assert_eq!(
            *log.lock().unwrap(),
            ["start inbound", "start activator", "stop activator", "stop inbound"]
        );
        assert!(flow.registry().names().await.is_empty());
    }

    #[tokio::test]
    async fn should_roll_back_when_a_component_fails_to_start() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut flow = IntegrationFlow::new();
        flow.register(Recorder::new("first", &log))
            .register(Recorder::build("broken", true, &log))
            .register(Recorder::new("never", &log));

        let result = flow.start().await;

        assert_eq!(
            result,
            Err(IntegrationError::ConfigurationError("broken".into()))
        );
        assert_eq!(*log.lock().unwrap(), ["start first", "start broken", "stop first"]);
        assert!(!flow.components()[0].is_running());
    }
}
