#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Wires the control plane together: the discovery service over the
//! in-memory registry, and the sidecar watcher that supervises a proxy
//! through hot-restart epochs.

pub use mesh_controller_agent as agent;
pub use mesh_controller_core as core;
pub use mesh_controller_discovery as discovery;

mod envoy;
mod watcher;

pub use self::{envoy::Envoy, watcher::Watcher};
