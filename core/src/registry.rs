//! Contracts the control plane consumes: the platform service registry and
//! the change-propagation controller.

use crate::{
    config::{ConfigValue, Key},
    service::{Service, ServiceInstance, TagsList},
    Error,
};
use ahash::AHashSet;
use std::fmt;

/// A change observed by a controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Add,
    Update,
    Delete,
}

pub type ServiceHandler = Box<dyn Fn(&Service, Event) + Send + Sync>;
pub type InstanceHandler = Box<dyn Fn(&ServiceInstance, Event) + Send + Sync>;
pub type ConfigHandler = Box<dyn Fn(&Key, &ConfigValue, Event) + Send + Sync>;

/// Read-only view of the platform service registry. The platform adapter
/// owns the data; implementations return point-in-time snapshots.
pub trait ServiceDiscovery: Send + Sync {
    /// All registered services, in stable hostname order.
    fn services(&self) -> Vec<Service>;

    fn get_service(&self, hostname: &str) -> Option<Service>;

    /// Instances of a hostname, narrowed to the named service ports (all
    /// ports when empty) and to instances matching one of the tag selectors
    /// (all instances when empty).
    fn instances(&self, hostname: &str, port_names: &[String], tags: &TagsList)
        -> Vec<ServiceInstance>;

    /// Instances whose endpoint address is one of the given host IPs; used
    /// to find the workloads co-located with a proxy.
    fn host_instances(&self, addrs: &AHashSet<String>) -> Vec<ServiceInstance>;
}

/// Fans typed change events out to registered handlers.
///
/// Handlers must be registered before [`Controller::run`] is invoked and are
/// called serially from the delivery task; no reentrancy is assumed and no
/// ordering holds across the three families.
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    fn append_service_handler(&self, handler: ServiceHandler) -> Result<(), Error>;

    fn append_instance_handler(&self, handler: InstanceHandler) -> Result<(), Error>;

    /// Registers a handler for one declared config kind; fails on an
    /// undeclared kind.
    fn append_config_handler(&self, kind: &str, handler: ConfigHandler) -> Result<(), Error>;

    /// Delivers events until `stop` is signaled.
    async fn run(&self, stop: drain::Watch);
}

// === impl Event ===

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Add => "add".fmt(f),
            Event::Update => "update".fmt(f),
            Event::Delete => "delete".fmt(f),
        }
    }
}
