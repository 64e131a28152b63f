//! A process-local implementation of the registry, config-store, and
//! controller contracts.
//!
//! The platform adapter that would normally populate the registry is out of
//! scope; this implementation backs the standalone binary and the test
//! suites. Mutations enqueue typed change events that `run` delivers
//! serially to the registered handlers.

use crate::{
    config::{ConfigStore, ConfigValue, Key, KindMap},
    registry::{ConfigHandler, Controller, Event, InstanceHandler, ServiceDiscovery, ServiceHandler},
    service::{Service, ServiceInstance, TagsList},
    Error,
};
use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

enum Change {
    Service(Service, Event),
    Instance(ServiceInstance, Event),
    Config(Key, ConfigValue, Event),
}

/// In-memory service registry, config store, and change controller.
pub struct Registry {
    kinds: KindMap,
    services: RwLock<BTreeMap<String, Service>>,
    instances: RwLock<Vec<ServiceInstance>>,
    configs: RwLock<BTreeMap<Key, ConfigValue>>,

    service_handlers: RwLock<Vec<ServiceHandler>>,
    instance_handlers: RwLock<Vec<InstanceHandler>>,
    config_handlers: RwLock<AHashMap<String, Vec<ConfigHandler>>>,

    events_tx: mpsc::UnboundedSender<Change>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Change>>>,
}

/// Initial registry contents loaded from a file at startup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub services: Vec<Service>,
    pub instances: Vec<ServiceInstance>,
    pub rules: Vec<SeedRule>,
}

/// One named config object in a seed file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeedRule {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(flatten)]
    pub value: ConfigValue,
}

fn default_namespace() -> String {
    "default".to_string()
}

// === impl Registry ===

impl Registry {
    pub fn new(kinds: KindMap) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            kinds,
            services: RwLock::new(BTreeMap::new()),
            instances: RwLock::new(Vec::new()),
            configs: RwLock::new(BTreeMap::new()),
            service_handlers: RwLock::new(Vec::new()),
            instance_handlers: RwLock::new(Vec::new()),
            config_handlers: RwLock::new(AHashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Registers or replaces a service.
    pub fn add_service(&self, service: Service) -> Result<(), Error> {
        service.validate()?;
        let event = {
            let mut services = self.services.write();
            match services.insert(service.hostname.clone(), service.clone()) {
                Some(_) => Event::Update,
                None => Event::Add,
            }
        };
        self.notify(Change::Service(service, event));
        Ok(())
    }

    pub fn remove_service(&self, hostname: &str) {
        let removed = self.services.write().remove(hostname);
        if let Some(service) = removed {
            self.notify(Change::Service(service, Event::Delete));
        }
    }

    /// Registers or replaces an instance, identified by its endpoint
    /// address and port.
    pub fn add_instance(&self, instance: ServiceInstance) -> Result<(), Error> {
        instance.validate()?;
        let event = {
            let mut instances = self.instances.write();
            let at = instances.iter().position(|i| {
                i.endpoint.address == instance.endpoint.address
                    && i.endpoint.port == instance.endpoint.port
            });
            match at {
                Some(at) => {
                    instances[at] = instance.clone();
                    Event::Update
                }
                None => {
                    instances.push(instance.clone());
                    Event::Add
                }
            }
        };
        self.notify(Change::Instance(instance, event));
        Ok(())
    }

    pub fn remove_instance(&self, address: &str, port: u16) {
        let removed = {
            let mut instances = self.instances.write();
            let at = instances
                .iter()
                .position(|i| i.endpoint.address == address && i.endpoint.port == port);
            at.map(|at| instances.remove(at))
        };
        if let Some(instance) = removed {
            self.notify(Change::Instance(instance, Event::Delete));
        }
    }

    /// Loads a seed into the registry. Events for the seeded objects are
    /// delivered once `run` starts.
    pub fn apply_seed(&self, seed: Seed) -> Result<(), Error> {
        for service in seed.services {
            self.add_service(service)?;
        }
        for instance in seed.instances {
            self.add_instance(instance)?;
        }
        for rule in seed.rules {
            let key = Key {
                kind: rule.value.kind().to_string(),
                name: rule.name,
                namespace: rule.namespace,
            };
            self.post(key, rule.value)?;
        }
        Ok(())
    }

    fn notify(&self, change: Change) {
        // The receiver lives as long as the registry; a send can only fail
        // after `run` has consumed it and returned.
        let _ = self.events_tx.send(change);
    }

    fn dispatch(&self, change: Change) {
        match change {
            Change::Service(service, event) => {
                debug!(hostname = %service.hostname, %event, "service changed");
                for handler in self.service_handlers.read().iter() {
                    handler(&service, event);
                }
            }
            Change::Instance(instance, event) => {
                debug!(
                    address = %instance.endpoint.address,
                    port = instance.endpoint.port,
                    %event,
                    "instance changed"
                );
                for handler in self.instance_handlers.read().iter() {
                    handler(&instance, event);
                }
            }
            Change::Config(key, value, event) => {
                debug!(%key, %event, "config changed");
                if let Some(handlers) = self.config_handlers.read().get(&key.kind) {
                    for handler in handlers {
                        handler(&key, &value, event);
                    }
                }
            }
        }
    }
}

impl ServiceDiscovery for Registry {
    fn services(&self) -> Vec<Service> {
        self.services.read().values().cloned().collect()
    }

    fn get_service(&self, hostname: &str) -> Option<Service> {
        self.services.read().get(hostname).cloned()
    }

    fn instances(
        &self,
        hostname: &str,
        port_names: &[String],
        tags: &TagsList,
    ) -> Vec<ServiceInstance> {
        let mut out = self
            .instances
            .read()
            .iter()
            .filter(|i| i.service.hostname == hostname)
            .filter(|i| {
                port_names.is_empty()
                    || port_names.iter().any(|n| *n == i.endpoint.service_port.name)
            })
            .filter(|i| tags.is_empty() || tags.iter().any(|t| t.subset_of(&i.tags)))
            .cloned()
            .collect::<Vec<_>>();
        sort_instances(&mut out);
        out
    }

    fn host_instances(&self, addrs: &AHashSet<String>) -> Vec<ServiceInstance> {
        let mut out = self
            .instances
            .read()
            .iter()
            .filter(|i| addrs.contains(&i.endpoint.address))
            .cloned()
            .collect::<Vec<_>>();
        sort_instances(&mut out);
        out
    }
}

impl ConfigStore for Registry {
    fn get(&self, key: &Key) -> Option<ConfigValue> {
        self.configs.read().get(key).cloned()
    }

    fn list(&self, kind: &str) -> Vec<(Key, ConfigValue)> {
        self.configs
            .read()
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn post(&self, key: Key, value: ConfigValue) -> Result<(), Error> {
        self.kinds.validate_config(&key, &value)?;
        {
            let mut configs = self.configs.write();
            if configs.contains_key(&key) {
                return Err(Error::AlreadyExists(key));
            }
            configs.insert(key.clone(), value.clone());
        }
        self.notify(Change::Config(key, value, Event::Add));
        Ok(())
    }

    fn put(&self, key: Key, value: ConfigValue) -> Result<(), Error> {
        self.kinds.validate_config(&key, &value)?;
        {
            let mut configs = self.configs.write();
            if !configs.contains_key(&key) {
                return Err(Error::NotFound(key));
            }
            configs.insert(key.clone(), value.clone());
        }
        self.notify(Change::Config(key, value, Event::Update));
        Ok(())
    }

    fn delete(&self, key: &Key) -> Result<(), Error> {
        let removed = self.configs.write().remove(key);
        match removed {
            Some(value) => {
                self.notify(Change::Config(key.clone(), value, Event::Delete));
                Ok(())
            }
            None => Err(Error::NotFound(key.clone())),
        }
    }
}

#[async_trait::async_trait]
impl Controller for Registry {
    fn append_service_handler(&self, handler: ServiceHandler) -> Result<(), Error> {
        self.service_handlers.write().push(handler);
        Ok(())
    }

    fn append_instance_handler(&self, handler: InstanceHandler) -> Result<(), Error> {
        self.instance_handlers.write().push(handler);
        Ok(())
    }

    fn append_config_handler(&self, kind: &str, handler: ConfigHandler) -> Result<(), Error> {
        if self.kinds.get(kind).is_none() {
            return Err(Error::UndeclaredKind(kind.to_string()));
        }
        self.config_handlers
            .write()
            .entry(kind.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    async fn run(&self, stop: drain::Watch) {
        let mut rx = match self.events_rx.lock().take() {
            Some(rx) => rx,
            None => {
                warn!("controller is already running");
                return;
            }
        };

        let stopped = stop.signaled();
        tokio::pin!(stopped);

        loop {
            tokio::select! {
                change = rx.recv() => match change {
                    Some(change) => self.dispatch(change),
                    None => break,
                },
                _ = &mut stopped => break,
            }
        }
    }
}

fn sort_instances(instances: &mut [ServiceInstance]) {
    instances.sort_by(|a, b| {
        (&a.service.hostname, &a.endpoint.address, a.endpoint.port).cmp(&(
            &b.service.hostname,
            &b.endpoint.address,
            b.endpoint.port,
        ))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::default_kind_map,
        rules::RouteRule,
        service::{NetworkEndpoint, Port, Protocol, Tags},
    };
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn hello_service() -> Service {
        Service {
            hostname: "hello.default.svc.cluster.local".into(),
            address: Some("10.0.0.1".into()),
            ports: vec![Port {
                name: "http".into(),
                port: 80,
                protocol: Protocol::Http,
            }],
        }
    }

    fn hello_instance(address: &str, version: &str) -> ServiceInstance {
        let service = hello_service();
        ServiceInstance {
            endpoint: NetworkEndpoint {
                address: address.into(),
                port: 8080,
                service_port: service.ports[0].clone(),
            },
            service,
            tags: format!("version={}", version).parse().unwrap(),
        }
    }

    #[test]
    fn seeded_objects_validate() {
        let registry = Registry::new(default_kind_map());
        registry.add_service(hello_service()).unwrap();
        registry.add_instance(hello_instance("10.1.1.0", "v0")).unwrap();
        registry.add_instance(hello_instance("10.1.1.1", "v1")).unwrap();

        for svc in registry.services() {
            assert!(svc.validate().is_ok());
            let instances = registry.instances(&svc.hostname, &svc.port_names(), &vec![]);
            assert!(!instances.is_empty());
            for instance in instances {
                assert!(instance.validate().is_ok());
            }
        }
    }

    #[test]
    fn instances_filter_by_tags() {
        let registry = Registry::new(default_kind_map());
        registry.add_service(hello_service()).unwrap();
        registry.add_instance(hello_instance("10.1.1.0", "v0")).unwrap();
        registry.add_instance(hello_instance("10.1.1.1", "v1")).unwrap();

        let v1: Tags = "version=v1".parse().unwrap();
        let selected = registry.instances(
            "hello.default.svc.cluster.local",
            &["http".to_string()],
            &vec![v1],
        );
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].endpoint.address, "10.1.1.1");
    }

    #[test]
    fn host_instances_select_by_address() {
        let registry = Registry::new(default_kind_map());
        registry.add_service(hello_service()).unwrap();
        registry.add_instance(hello_instance("10.1.1.0", "v0")).unwrap();
        registry.add_instance(hello_instance("10.1.1.1", "v1")).unwrap();

        let addrs = ["10.1.1.0".to_string()].into_iter().collect();
        let local = registry.host_instances(&addrs);
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].endpoint.address, "10.1.1.0");
    }

    #[test]
    fn store_gates_on_validation() {
        let registry = Registry::new(default_kind_map());
        let key = Key {
            kind: "route-rule".into(),
            name: "bad".into(),
            namespace: "default".into(),
        };
        let invalid = ConfigValue::RouteRule(RouteRule::default());
        assert!(matches!(
            registry.post(key, invalid),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn post_then_put_then_delete() {
        let registry = Registry::new(default_kind_map());
        let key = Key {
            kind: "route-rule".into(),
            name: "reroute".into(),
            namespace: "default".into(),
        };
        let rule = ConfigValue::RouteRule(RouteRule {
            destination: "hello.default.svc.cluster.local".into(),
            ..Default::default()
        });

        registry.post(key.clone(), rule.clone()).unwrap();
        assert!(matches!(
            registry.post(key.clone(), rule.clone()),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(registry.get(&key), Some(rule.clone()));

        registry.put(key.clone(), rule.clone()).unwrap();
        registry.delete(&key).unwrap();
        assert!(matches!(registry.delete(&key), Err(Error::NotFound(_))));
        assert!(registry.get(&key).is_none());
    }

    #[tokio::test]
    async fn events_are_delivered_serially() {
        let registry = Arc::new(Registry::new(default_kind_map()));
        let seen = Arc::new(AtomicUsize::new(0));

        {
            let seen = seen.clone();
            registry
                .append_service_handler(Box::new(move |_, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        {
            let seen = seen.clone();
            registry
                .append_instance_handler(Box::new(move |_, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        registry.add_service(hello_service()).unwrap();
        registry.add_instance(hello_instance("10.1.1.0", "v0")).unwrap();
        registry.remove_instance("10.1.1.0", 8080);

        let (signal, watch) = drain::channel();
        let ctl = registry.clone();
        let task = tokio::spawn(async move { ctl.run(watch).await });

        // Three events were queued before the controller started.
        tokio::task::yield_now().await;
        while seen.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }

        signal.drain().await;
        task.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn config_handler_requires_declared_kind() {
        let registry = Registry::new(default_kind_map());
        assert!(registry
            .append_config_handler("quota", Box::new(|_, _, _| ()))
            .is_err());
        assert!(registry
            .append_config_handler("route-rule", Box::new(|_, _, _| ()))
            .is_ok());
    }
}
