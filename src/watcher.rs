use mesh_controller_agent::{Agent, AgentHandle, Proxy};
use mesh_controller_core::{
    config::{DESTINATION_POLICY, ROUTE_RULE},
    Controller,
};
use mesh_controller_discovery::{generate, ProxyConfig, ProxyContext};
use std::sync::Arc;

/// Observes the registry and rule store and schedules a configuration
/// update with the agent on every change.
pub struct Watcher {
    context: ProxyContext,
    controller: Arc<dyn Controller>,
    handle: AgentHandle<ProxyConfig>,
}

// === impl Watcher ===

impl Watcher {
    /// Subscribes to service, instance, and rule changes. Whatever the
    /// event, the generated configuration reflects the latest registry
    /// view.
    pub fn new(
        context: ProxyContext,
        controller: Arc<dyn Controller>,
        handle: AgentHandle<ProxyConfig>,
    ) -> Result<Self, mesh_controller_core::Error> {
        let watcher = Self {
            context,
            controller,
            handle,
        };

        {
            let reload = watcher.reloader();
            watcher
                .controller
                .append_service_handler(Box::new(move |_, _| reload()))?;
        }
        {
            let reload = watcher.reloader();
            watcher
                .controller
                .append_instance_handler(Box::new(move |_, _| reload()))?;
        }
        for kind in [ROUTE_RULE, DESTINATION_POLICY] {
            let reload = watcher.reloader();
            watcher
                .controller
                .append_config_handler(kind, Box::new(move |_, _, _| reload()))?;
        }

        Ok(watcher)
    }

    /// Recomputes the proxy configuration and submits it to the agent.
    pub fn reload(&self) {
        self.reloader()()
    }

    fn reloader(&self) -> impl Fn() + Send + Sync + 'static {
        let context = self.context.clone();
        let handle = self.handle.clone();
        move || {
            let config = generate(&context);
            handle.schedule_config_update(config);
        }
    }

    /// Runs the agent and the controller until `stop` is signaled.
    ///
    /// The agent consumer starts before the controller producer so that no
    /// initial event is dropped; one reload runs up front rather than
    /// waiting for the first event.
    pub async fn run<P>(self, agent: Agent<P>, stop: drain::Watch)
    where
        P: Proxy<Config = ProxyConfig>,
    {
        let agent_task = tokio::spawn(agent.run(stop.clone()));
        self.reload();
        self.controller.run(stop).await;
        let _ = agent_task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_controller_agent::Error;
    use mesh_controller_core::{
        config::default_kind_map, memory::Registry, MeshConfig, NetworkEndpoint, Port, Protocol,
        RuleRegistry, Service, ServiceInstance, Tags,
    };
    use parking_lot::Mutex;

    struct RecordingProxy {
        configs: Arc<Mutex<Vec<ProxyConfig>>>,
    }

    #[async_trait::async_trait]
    impl Proxy for RecordingProxy {
        type Config = ProxyConfig;

        async fn run(&self, config: &ProxyConfig, _epoch: u32) -> Result<(), Error> {
            self.configs.lock().push(config.clone());
            futures::future::pending().await
        }

        fn cleanup(&self, _epoch: u32) {}
    }

    fn http_port() -> Port {
        Port {
            name: "http".into(),
            port: 80,
            protocol: Protocol::Http,
        }
    }

    fn hello_service() -> Service {
        Service {
            hostname: "hello.default.svc.cluster.local".into(),
            address: None,
            ports: vec![http_port()],
        }
    }

    fn hello_instance(address: &str) -> ServiceInstance {
        ServiceInstance {
            endpoint: NetworkEndpoint {
                address: address.into(),
                port: 80,
                service_port: http_port(),
            },
            service: hello_service(),
            tags: Tags::default(),
        }
    }

    #[tokio::test]
    async fn events_drive_config_updates() {
        let registry = Arc::new(Registry::new(default_kind_map()));
        registry.add_service(hello_service()).unwrap();
        registry.add_instance(hello_instance("10.1.1.0")).unwrap();

        let context = ProxyContext {
            discovery: registry.clone(),
            config: RuleRegistry::new(registry.clone()),
            mesh: Arc::new(MeshConfig::default()),
            ip_address: "10.1.1.0".to_string(),
        };

        let configs = Arc::new(Mutex::new(Vec::new()));
        let (agent, handle) = Agent::new(
            RecordingProxy {
                configs: configs.clone(),
            },
            10,
            std::time::Duration::from_millis(100),
        );
        let watcher = Watcher::new(context, registry.clone(), handle).unwrap();

        let (signal, watch) = drain::channel();
        let registry2 = registry.clone();
        let task = tokio::spawn(watcher.run(agent, watch));

        // The initial reload launches the first epoch; the seeded events
        // regenerate an identical config, which coalesces away.
        while configs.lock().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        // A registry change yields a structurally different config and a
        // new epoch.
        registry2
            .add_service(Service {
                hostname: "world.default.svc.cluster.local".into(),
                address: None,
                ports: vec![http_port()],
            })
            .unwrap();
        while configs.lock().len() < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        {
            let configs = configs.lock();
            assert_eq!(configs.len(), 2);
            assert_ne!(configs[0], configs[1]);
        }

        signal.drain().await;
        task.await.unwrap();
    }
}
