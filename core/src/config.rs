//! The config-store contract: typed objects addressed by
//! `(kind, name, namespace)` keys, with a process-wide declaration of known
//! kinds and their validators.

use crate::{
    rules::{DestinationPolicy, RouteRule},
    service::{ServiceInstance, Tags},
    validation::ValidationErrors,
    Error,
};
use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Kind name for L7 route rules.
pub const ROUTE_RULE: &str = "route-rule";

/// Kind name for ingress rules. Structurally identical to route rules.
pub const INGRESS_RULE: &str = "ingress-rule";

/// Kind name for destination policies.
pub const DESTINATION_POLICY: &str = "destination-policy";

/// Identifies a config object. Each component is a DNS-1123 label.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

/// The opaque typed payload carried by the store. Each variant corresponds
/// to one declared message type; `type_tag` stands in for runtime
/// reflection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "spec", rename_all = "kebab-case")]
pub enum ConfigValue {
    RouteRule(RouteRule),
    IngressRule(RouteRule),
    DestinationPolicy(DestinationPolicy),
}

/// What the process knows about one config kind.
#[derive(Clone)]
pub struct KindSpec {
    /// Expected payload type tag.
    pub message_type: &'static str,

    /// Structural validator applied before the object is admitted.
    pub validate: fn(&ConfigValue) -> Result<(), ValidationErrors>,
}

/// Process-wide registry of declared config kinds.
#[derive(Clone, Default)]
pub struct KindMap(HashMap<String, KindSpec>);

/// Typed CRUD over config objects.
///
/// Implementations own the objects; the core holds read-only snapshots.
/// Mutations are gated by [`KindMap::validate_config`].
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &Key) -> Option<ConfigValue>;

    /// All objects of one kind, in stable key order.
    fn list(&self, kind: &str) -> Vec<(Key, ConfigValue)>;

    fn post(&self, key: Key, value: ConfigValue) -> Result<(), Error>;

    fn put(&self, key: Key, value: ConfigValue) -> Result<(), Error>;

    fn delete(&self, key: &Key) -> Result<(), Error>;
}

/// Typed read view over a [`ConfigStore`], shared by the discovery service
/// and the watcher.
#[derive(Clone)]
pub struct RuleRegistry {
    store: Arc<dyn ConfigStore>,
}

// === impl Key ===

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

// === impl ConfigValue ===

impl ConfigValue {
    /// The payload's message type tag, matched against the declared kind.
    pub fn type_tag(&self) -> &'static str {
        match self {
            ConfigValue::RouteRule(_) => "RouteRule",
            ConfigValue::IngressRule(_) => "IngressRule",
            ConfigValue::DestinationPolicy(_) => "DestinationPolicy",
        }
    }

    /// The kind under which this payload is stored.
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigValue::RouteRule(_) => ROUTE_RULE,
            ConfigValue::IngressRule(_) => INGRESS_RULE,
            ConfigValue::DestinationPolicy(_) => DESTINATION_POLICY,
        }
    }
}

// === impl KindSpec ===

impl fmt::Debug for KindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindSpec")
            .field("message_type", &self.message_type)
            .finish()
    }
}

// === impl KindMap ===

impl KindMap {
    pub fn insert(&mut self, kind: impl Into<String>, spec: KindSpec) {
        self.0.insert(kind.into(), spec);
    }

    pub fn get(&self, kind: &str) -> Option<&KindSpec> {
        self.0.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }
}

impl fmt::Debug for KindMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

fn validate_route_rule(value: &ConfigValue) -> Result<(), ValidationErrors> {
    match value {
        ConfigValue::RouteRule(rule) | ConfigValue::IngressRule(rule) => rule.validate(),
        _ => {
            let mut errs = ValidationErrors::new();
            errs.push("cannot cast to routing rule");
            Err(errs)
        }
    }
}

fn validate_destination_policy(value: &ConfigValue) -> Result<(), ValidationErrors> {
    match value {
        ConfigValue::DestinationPolicy(policy) => policy.validate(),
        _ => {
            let mut errs = ValidationErrors::new();
            errs.push("cannot cast to destination policy");
            Err(errs)
        }
    }
}

/// The kinds this control plane understands.
pub fn default_kind_map() -> KindMap {
    let mut kinds = KindMap::default();
    kinds.insert(
        ROUTE_RULE,
        KindSpec {
            message_type: "RouteRule",
            validate: validate_route_rule,
        },
    );
    kinds.insert(
        INGRESS_RULE,
        KindSpec {
            message_type: "IngressRule",
            validate: validate_route_rule,
        },
    );
    kinds.insert(
        DESTINATION_POLICY,
        KindSpec {
            message_type: "DestinationPolicy",
            validate: validate_destination_policy,
        },
    );
    kinds
}

// === impl RuleRegistry ===

impl RuleRegistry {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    /// All route rules in stable key order.
    pub fn route_rules(&self) -> Vec<(Key, RouteRule)> {
        self.store
            .list(ROUTE_RULE)
            .into_iter()
            .filter_map(|(key, value)| match value {
                ConfigValue::RouteRule(rule) => Some((key, rule)),
                _ => None,
            })
            .collect()
    }

    /// All ingress rules in stable key order.
    pub fn ingress_rules(&self) -> Vec<(Key, RouteRule)> {
        self.store
            .list(INGRESS_RULE)
            .into_iter()
            .filter_map(|(key, value)| match value {
                ConfigValue::IngressRule(rule) => Some((key, rule)),
                _ => None,
            })
            .collect()
    }

    /// Route rules whose match condition admits one of the given source
    /// instances, ordered by precedence (highest first) and then by key so
    /// that the result is deterministic.
    pub fn route_rules_by_source(&self, instances: &[ServiceInstance]) -> Vec<RouteRule> {
        let mut rules = self.route_rules();
        rules.sort_by(|(ka, a), (kb, b)| b.precedence.cmp(&a.precedence).then_with(|| ka.cmp(kb)));
        rules
            .into_iter()
            .filter(|(_, rule)| rule_matches_source(rule, instances))
            .map(|(_, rule)| rule)
            .collect()
    }

    /// All destination policies in stable key order.
    pub fn policies(&self) -> Vec<(Key, DestinationPolicy)> {
        self.store
            .list(DESTINATION_POLICY)
            .into_iter()
            .filter_map(|(key, value)| match value {
                ConfigValue::DestinationPolicy(policy) => Some((key, policy)),
                _ => None,
            })
            .collect()
    }

    /// Destination policies selecting exactly this destination and tag set,
    /// in rule (key) order.
    pub fn destination_policies(&self, destination: &str, tags: &Tags) -> Vec<DestinationPolicy> {
        self.store
            .list(DESTINATION_POLICY)
            .into_iter()
            .filter_map(|(_, value)| match value {
                ConfigValue::DestinationPolicy(policy)
                    if policy.destination == destination && policy.tags == *tags =>
                {
                    Some(policy)
                }
                _ => None,
            })
            .collect()
    }
}

impl fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleRegistry").finish_non_exhaustive()
    }
}

fn rule_matches_source(rule: &RouteRule, instances: &[ServiceInstance]) -> bool {
    let Some(m) = &rule.match_condition else {
        return true;
    };
    if m.source.is_empty() && m.source_tags.is_empty() {
        return true;
    }
    instances.iter().any(|instance| {
        (m.source.is_empty() || m.source == instance.service.hostname)
            && m.source_tags.subset_of(&instance.tags)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_map_declares_defaults() {
        let kinds = default_kind_map();
        assert!(kinds.get(ROUTE_RULE).is_some());
        assert!(kinds.get(INGRESS_RULE).is_some());
        assert!(kinds.get(DESTINATION_POLICY).is_some());
        assert!(kinds.validate().is_ok());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let kinds = default_kind_map();
        let key = Key {
            kind: ROUTE_RULE.to_string(),
            name: "example".to_string(),
            namespace: "default".to_string(),
        };
        let value = ConfigValue::DestinationPolicy(DestinationPolicy {
            destination: "hello.default.svc.cluster.local".into(),
            ..Default::default()
        });
        match kinds.validate_config(&key, &value) {
            Err(Error::TypeMismatch { kind, actual }) => {
                assert_eq!(kind, ROUTE_RULE);
                assert_eq!(actual, "DestinationPolicy");
            }
            other => panic!("expected type mismatch, got {:?}", other),
        }
    }

    #[test]
    fn undeclared_kind_is_rejected() {
        let kinds = default_kind_map();
        let key = Key {
            kind: "quota".to_string(),
            name: "example".to_string(),
            namespace: "default".to_string(),
        };
        let value = ConfigValue::RouteRule(RouteRule {
            destination: "hello.default.svc.cluster.local".into(),
            ..Default::default()
        });
        assert!(matches!(
            kinds.validate_config(&key, &value),
            Err(Error::UndeclaredKind(_))
        ));
    }

    #[test]
    fn carrier_round_trips_as_json() {
        let value = ConfigValue::RouteRule(RouteRule {
            destination: "hello.default.svc.cluster.local".into(),
            precedence: 2,
            ..Default::default()
        });
        let json = serde_json::to_string(&value).unwrap();
        assert!(json.contains("\"type\":\"route-rule\""));
        let back: ConfigValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
        assert_eq!(back.kind(), ROUTE_RULE);
        assert_eq!(back.type_tag(), "RouteRule");
    }
}
