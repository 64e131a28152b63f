use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Application protocol spoken on a service port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Http2,
    Grpc,
    #[default]
    Tcp,
    Udp,
}

/// A named port exposed by a service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Unique within the service. May be empty only when the service exposes
    /// a single port.
    #[serde(default)]
    pub name: String,

    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,
}

/// A unit of the registry: a hostname with its declared ports and an
/// optional virtual address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Fully qualified domain name, e.g. `hello.default.svc.cluster.local`.
    pub hostname: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    pub ports: Vec<Port>,
}

/// An endpoint backing one of a service's ports.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    /// Endpoint IP address, also the identity of the co-located proxy.
    pub address: String,

    pub port: u16,

    /// The service port this endpoint implements. Must agree with one of the
    /// declared ports of the owning service by name, port, and protocol.
    pub service_port: Port,
}

/// A snapshot of a single endpoint of a service, as observed from the
/// platform registry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub endpoint: NetworkEndpoint,
    pub service: Service,
    #[serde(default)]
    pub tags: Tags,
}

/// A set of `key=value` tags attached to a service instance. Ordered so that
/// rendering is canonical.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tags(pub BTreeMap<String, String>);

/// Alternative tag selectors: an instance matches a list if any one selector
/// is a subset of the instance's tags.
pub type TagsList = Vec<Tags>;

// === impl Protocol ===

impl Protocol {
    /// Whether L7 HTTP routes are derived for ports speaking this protocol.
    pub fn is_http(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Http2 | Protocol::Grpc)
    }
}

// === impl Service ===

impl Service {
    pub fn get_port(&self, name: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.name == name)
    }

    pub fn port_names(&self) -> Vec<String> {
        self.ports.iter().map(|p| p.name.clone()).collect()
    }
}

// === impl Tags ===

impl Tags {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if every one of these tags appears, with an equal value, in
    /// `other`.
    pub fn subset_of(&self, other: &Tags) -> bool {
        self.0.iter().all(|(k, v)| other.0.get(k) == Some(v))
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}

impl FromStr for Tags {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tags = BTreeMap::new();
        for part in s.split(',') {
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((k, v)) => tags.insert(k.to_string(), v.to_string()),
                None => tags.insert(part.to_string(), String::new()),
            };
        }
        Ok(Tags(tags))
    }
}

impl FromIterator<(String, String)> for Tags {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Tags(iter.into_iter().collect())
    }
}

/// Formats the canonical key for a set of service instances:
/// `hostname|port-name,port-name|k=v,k=v;k=v`.
///
/// The port section is omitted when the only port is unnamed; the tag section
/// is omitted when no selector is given. Port names and selectors are sorted
/// so that equal inputs render identically.
pub fn service_key(hostname: &str, ports: &[&Port], tags: &TagsList) -> String {
    let mut names = ports
        .iter()
        .map(|p| p.name.as_str())
        .collect::<Vec<_>>();
    names.sort_unstable();
    names.dedup();
    if names == [""] {
        names.clear();
    }

    let mut selectors = tags
        .iter()
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect::<Vec<_>>();
    selectors.sort_unstable();
    selectors.dedup();

    let mut out = hostname.to_string();
    if !names.is_empty() || !selectors.is_empty() {
        out.push('|');
        out.push_str(&names.join(","));
    }
    if !selectors.is_empty() {
        out.push('|');
        out.push_str(&selectors.join(";"));
    }
    out
}

/// Splits a service key into its hostname, port names, and tag selectors.
/// Total: malformed sections simply yield empty components.
pub fn parse_service_key(key: &str) -> (String, Vec<String>, TagsList) {
    let mut parts = key.splitn(3, '|');
    let hostname = parts.next().unwrap_or_default().to_string();

    let ports = parts
        .next()
        .map(|s| {
            s.split(',')
                .filter(|n| !n.is_empty())
                .map(|n| n.to_string())
                .collect()
        })
        .unwrap_or_default();

    let tags = parts
        .next()
        .map(|s| {
            s.split(';')
                .filter(|t| !t.is_empty())
                .map(|t| t.parse().unwrap_or_default())
                .collect()
        })
        .unwrap_or_default();

    (hostname, ports, tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn http_port(name: &str, port: u16) -> Port {
        Port {
            name: name.to_string(),
            port,
            protocol: Protocol::Http,
        }
    }

    #[test]
    fn key_round_trip() {
        let svc = Service {
            hostname: "hello.default.svc.cluster.local".into(),
            address: None,
            ports: vec![http_port("http", 80), http_port("http-alt", 8080)],
        };
        let tags = Tags(btreemap! {
            "version".to_string() => "v1".to_string(),
            "env".to_string() => "prod".to_string(),
        });

        let key = service_key(
            &svc.hostname,
            &svc.ports.iter().collect::<Vec<_>>(),
            &vec![tags.clone()],
        );
        assert_eq!(
            key,
            "hello.default.svc.cluster.local|http,http-alt|env=prod,version=v1"
        );

        let (hostname, ports, parsed) = parse_service_key(&key);
        assert_eq!(hostname, svc.hostname);
        assert_eq!(ports, vec!["http".to_string(), "http-alt".to_string()]);
        assert_eq!(parsed, vec![tags]);
    }

    #[test]
    fn key_omits_empty_sections() {
        let port = Port {
            name: String::new(),
            port: 80,
            protocol: Protocol::Http,
        };
        assert_eq!(service_key("hello", &[&port], &vec![]), "hello");

        let (hostname, ports, tags) = parse_service_key("hello");
        assert_eq!(hostname, "hello");
        assert!(ports.is_empty());
        assert!(tags.is_empty());
    }

    #[test]
    fn key_with_tags_but_single_unnamed_port() {
        let port = Port {
            name: String::new(),
            port: 80,
            protocol: Protocol::Http,
        };
        let tags = vec!["version=v0".parse::<Tags>().unwrap()];
        assert_eq!(service_key("hello", &[&port], &tags), "hello||version=v0");

        let (hostname, ports, parsed) = parse_service_key("hello||version=v0");
        assert_eq!(hostname, "hello");
        assert!(ports.is_empty());
        assert_eq!(parsed, tags);
    }

    #[test]
    fn tags_subset() {
        let all: Tags = "env=prod,version=v1".parse().unwrap();
        let sub: Tags = "version=v1".parse().unwrap();
        let other: Tags = "version=v2".parse().unwrap();
        assert!(sub.subset_of(&all));
        assert!(!other.subset_of(&all));
        assert!(Tags::default().subset_of(&all));
    }
}
