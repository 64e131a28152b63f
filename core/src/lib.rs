#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Core model of the mesh control plane: the service registry and config
//! store contracts consumed by the discovery service and the sidecar
//! watcher, the typed rule payloads, and their validators.

pub mod config;
pub mod memory;
mod mesh;
mod registry;
pub mod rules;
mod service;
pub mod validation;

pub use self::{
    config::{ConfigStore, ConfigValue, Key, KindMap, KindSpec, RuleRegistry},
    mesh::{AuthPolicy, MeshConfig},
    registry::{
        ConfigHandler, Controller, Event, InstanceHandler, ServiceDiscovery, ServiceHandler,
    },
    service::{
        parse_service_key, service_key, NetworkEndpoint, Port, Protocol, Service, ServiceInstance,
        Tags, TagsList,
    },
    validation::ValidationErrors,
};

/// Errors surfaced by the registry and config store contracts.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A rule failed structural validation. Reported to the submitter and
    /// never propagated into the discovery or watcher paths.
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationErrors),

    /// The object's kind was never declared in the kind map.
    #[error("kind {0:?} is not defined")]
    UndeclaredKind(String),

    /// The payload's message type does not match the declared kind.
    #[error("mismatched message type {actual:?} for kind {kind:?}")]
    TypeMismatch { kind: String, actual: &'static str },

    #[error("config object {0} not found")]
    NotFound(Key),

    #[error("config object {0} already exists")]
    AlreadyExists(Key),
}
