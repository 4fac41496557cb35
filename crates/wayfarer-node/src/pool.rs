//! Provider service pool
//!
//! Supervises running service instances. Stopping an instance winds down
//! its discovery announcer, the p2p listener, every accepted channel and
//! the tunnel server, then reports the state change on the bus. `stop_all`
//! keeps going on errors and reports them together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{info, warn};
use wayfarer_market::Proposal;
use wayfarer_p2p::{Channel, ListenerHandle};

use crate::bus::{AppEvent, EventBus};
use crate::error::{NodeError, NodeResult};

/// Service instance lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Starting,
    Running,
    NotRunning,
}

impl ServiceStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Starting => "Starting",
            ServiceStatus::Running => "Running",
            ServiceStatus::NotRunning => "NotRunning",
        }
    }
}

/// A running tunnel server that can be asked to stop
#[async_trait]
pub trait RunnableService: Send + Sync {
    async fn stop(&self) -> NodeResult<()>;
}

/// Marketplace announcer for one service instance
#[async_trait]
pub trait DiscoveryAnnouncer: Send + Sync {
    async fn stop(&self);
}

/// One provider service with everything it owns
pub struct ServiceInstance {
    id: String,
    proposal: Proposal,
    state: Mutex<ServiceStatus>,
    service: Arc<dyn RunnableService>,
    discovery: Option<Arc<dyn DiscoveryAnnouncer>>,
    listener: Mutex<Option<ListenerHandle>>,
    channels: Mutex<Vec<Arc<dyn Channel>>>,
}

impl ServiceInstance {
    pub fn new(
        id: String,
        proposal: Proposal,
        service: Arc<dyn RunnableService>,
        discovery: Option<Arc<dyn DiscoveryAnnouncer>>,
        listener: Option<ListenerHandle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            proposal,
            state: Mutex::new(ServiceStatus::Running),
            service,
            discovery,
            listener: Mutex::new(listener),
            channels: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn proposal(&self) -> &Proposal {
        &self.proposal
    }

    pub fn state(&self) -> ServiceStatus {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Track an accepted consumer channel so stop can close it
    pub fn track_channel(&self, channel: Arc<dyn Channel>) {
        self.channels
            .lock()
            .expect("channels lock poisoned")
            .push(channel);
    }

    fn set_state(&self, state: ServiceStatus, bus: &EventBus) {
        *self.state.lock().expect("state lock poisoned") = state;
        bus.publish(AppEvent::ServiceStatus {
            id: self.id.clone(),
            status: state.as_str().to_string(),
        });
    }
}

/// Concurrent map of running service instances
pub struct ServicePool {
    instances: Mutex<HashMap<String, Arc<ServiceInstance>>>,
    bus: EventBus,
}

impl ServicePool {
    pub fn new(bus: EventBus) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            bus,
        }
    }

    /// Register a running instance
    pub fn add(&self, instance: Arc<ServiceInstance>) {
        self.instances
            .lock()
            .expect("pool lock poisoned")
            .insert(instance.id().to_string(), instance);
    }

    pub fn instance(&self, id: &str) -> Option<Arc<ServiceInstance>> {
        self.instances
            .lock()
            .expect("pool lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<ServiceInstance>> {
        self.instances
            .lock()
            .expect("pool lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Stop one instance and remove it from the pool
    pub async fn stop(&self, id: &str) -> NodeResult<()> {
        let instance = self
            .instances
            .lock()
            .expect("pool lock poisoned")
            .remove(id)
            .ok_or_else(|| NodeError::NoSuchInstance(id.to_string()))?;
        self.stop_instance(&instance).await
    }

    async fn stop_instance(&self, instance: &Arc<ServiceInstance>) -> NodeResult<()> {
        info!(id = %instance.id(), "stopping service instance");
        let mut errors = Vec::new();

        if let Some(discovery) = &instance.discovery {
            discovery.stop().await;
        }
        if let Some(mut listener) = instance
            .listener
            .lock()
            .expect("listener lock poisoned")
            .take()
        {
            listener.close();
        }

        let channels: Vec<Arc<dyn Channel>> = instance
            .channels
            .lock()
            .expect("channels lock poisoned")
            .drain(..)
            .collect();
        for channel in channels {
            channel.close().await;
        }

        if let Err(err) = instance.service.stop().await {
            warn!(id = %instance.id(), %err, "service stop failed");
            errors.push(err.to_string());
        }

        instance.set_state(ServiceStatus::NotRunning, &self.bus);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NodeError::Collection(errors))
        }
    }

    /// Stop every instance, accumulating failures
    pub async fn stop_all(&self) -> NodeResult<()> {
        let instances: Vec<Arc<ServiceInstance>> = {
            let mut map = self.instances.lock().expect("pool lock poisoned");
            map.drain().map(|(_, instance)| instance).collect()
        };

        let mut errors = Vec::new();
        for instance in instances {
            if let Err(err) = self.stop_instance(&instance).await {
                errors.push(err.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NodeError::Collection(errors))
        }
    }
}
