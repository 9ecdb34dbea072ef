//! Fan-in of per-instance partial configurations.
//!
//! Entities are bucketed by (protocol, kind, name). A bucket with a single
//! contributor is kept as is. With several contributors, services must agree
//! on everything but their servers, which are concatenated in contributor
//! order; routers and middlewares must be identical. A bucket whose
//! contributors disagree is dropped entirely and reported.

use crate::metrics_defs::MERGE_CONFLICTS;
use crate::{EntityKind, Protocol};
use dynamic::{
    Configuration, HttpConfiguration, Middleware, Router, Service, TcpConfiguration,
    TcpMiddleware, TcpRouter, TcpService, UdpConfiguration, UdpRouter, UdpService,
};
use shared::counter;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;

/// An entity definition that can be contributed by several instances.
pub trait Mergeable: Sized {
    /// Whether two contributions describe the same entity.
    fn agrees_with(&self, other: &Self) -> bool;

    /// Folds an agreeing contribution into this one.
    fn absorb(&mut self, _other: Self) {}
}

macro_rules! mergeable_by_equality {
    ($($entity:ty),+ $(,)?) => {
        $(
            impl Mergeable for $entity {
                fn agrees_with(&self, other: &Self) -> bool {
                    self == other
                }
            }
        )+
    };
}

mergeable_by_equality!(Router, Middleware, TcpRouter, TcpMiddleware, UdpRouter);

impl Mergeable for Service {
    fn agrees_with(&self, other: &Self) -> bool {
        match (&self.load_balancer, &other.load_balancer) {
            (Some(a), Some(b)) => a.eq_ignoring_servers(b),
            (None, None) => true,
            _ => false,
        }
    }

    fn absorb(&mut self, other: Self) {
        if let (Some(lb), Some(other)) = (self.load_balancer.as_mut(), other.load_balancer) {
            lb.servers.extend(other.servers);
        }
    }
}

impl Mergeable for TcpService {
    fn agrees_with(&self, other: &Self) -> bool {
        match (&self.load_balancer, &other.load_balancer) {
            (Some(a), Some(b)) => a.eq_ignoring_servers(b),
            (None, None) => true,
            _ => false,
        }
    }

    fn absorb(&mut self, other: Self) {
        if let (Some(lb), Some(other)) = (self.load_balancer.as_mut(), other.load_balancer) {
            lb.servers.extend(other.servers);
        }
    }
}

impl Mergeable for UdpService {
    // A UDP load balancer has nothing but servers.
    fn agrees_with(&self, other: &Self) -> bool {
        self.load_balancer.is_some() == other.load_balancer.is_some()
    }

    fn absorb(&mut self, other: Self) {
        if let (Some(lb), Some(other)) = (self.load_balancer.as_mut(), other.load_balancer) {
            lb.servers.extend(other.servers);
        }
    }
}

/// An entity dropped because its contributors disagreed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeConflict {
    pub protocol: Protocol,
    pub kind: EntityKind,
    pub name: String,
    /// Keys of every instance that defined the entity, in merge order.
    pub contributors: Vec<String>,
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {:?} defined differently by {}",
            self.protocol,
            self.kind,
            self.name,
            self.contributors.join(", ")
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Merged {
    pub configuration: Configuration,
    pub conflicts: Vec<MergeConflict>,
}

struct Bucket<E> {
    entity: E,
    contributors: Vec<String>,
    conflict: bool,
}

struct Section<E> {
    protocol: Protocol,
    kind: EntityKind,
    buckets: BTreeMap<String, Bucket<E>>,
}

impl<E: Mergeable> Section<E> {
    fn new(protocol: Protocol, kind: EntityKind) -> Self {
        Section {
            protocol,
            kind,
            buckets: BTreeMap::new(),
        }
    }

    fn add(&mut self, contributor: &str, entities: BTreeMap<String, E>) {
        for (name, entity) in entities {
            match self.buckets.entry(name) {
                Entry::Vacant(vacant) => {
                    vacant.insert(Bucket {
                        entity,
                        contributors: vec![contributor.to_string()],
                        conflict: false,
                    });
                }
                Entry::Occupied(mut occupied) => {
                    let bucket = occupied.get_mut();
                    bucket.contributors.push(contributor.to_string());
                    if bucket.conflict {
                        continue;
                    }
                    if bucket.entity.agrees_with(&entity) {
                        bucket.entity.absorb(entity);
                    } else {
                        bucket.conflict = true;
                    }
                }
            }
        }
    }

    fn finish(self, conflicts: &mut Vec<MergeConflict>) -> BTreeMap<String, E> {
        let mut merged = BTreeMap::new();

        for (name, bucket) in self.buckets {
            if !bucket.conflict {
                merged.insert(name, bucket.entity);
                continue;
            }

            let conflict = MergeConflict {
                protocol: self.protocol,
                kind: self.kind,
                name,
                contributors: bucket.contributors,
            };
            tracing::warn!(
                protocol = %conflict.protocol,
                kind = %conflict.kind,
                name = %conflict.name,
                contributors = %conflict.contributors.join(","),
                "Dropping entity defined differently by several instances"
            );
            counter!(
                MERGE_CONFLICTS,
                "protocol" => self.protocol.as_str(),
                "kind" => self.kind.as_str()
            )
            .increment(1);
            conflicts.push(conflict);
        }

        merged
    }
}

/// Merges the partial configurations of one cycle, keyed by instance. Key
/// order is the contributor order.
pub fn merge(partials: BTreeMap<String, Configuration>) -> Merged {
    let mut http_routers = Section::<Router>::new(Protocol::Http, EntityKind::Router);
    let mut http_middlewares = Section::<Middleware>::new(Protocol::Http, EntityKind::Middleware);
    let mut http_services = Section::<Service>::new(Protocol::Http, EntityKind::Service);
    let mut tcp_routers = Section::<TcpRouter>::new(Protocol::Tcp, EntityKind::Router);
    let mut tcp_middlewares = Section::<TcpMiddleware>::new(Protocol::Tcp, EntityKind::Middleware);
    let mut tcp_services = Section::<TcpService>::new(Protocol::Tcp, EntityKind::Service);
    let mut udp_routers = Section::<UdpRouter>::new(Protocol::Udp, EntityKind::Router);
    let mut udp_services = Section::<UdpService>::new(Protocol::Udp, EntityKind::Service);

    for (key, partial) in partials {
        let Configuration { http, tcp, udp } = partial;
        http_routers.add(&key, http.routers);
        http_middlewares.add(&key, http.middlewares);
        http_services.add(&key, http.services);
        tcp_routers.add(&key, tcp.routers);
        tcp_middlewares.add(&key, tcp.middlewares);
        tcp_services.add(&key, tcp.services);
        udp_routers.add(&key, udp.routers);
        udp_services.add(&key, udp.services);
    }

    let mut conflicts = Vec::new();
    let configuration = Configuration {
        http: HttpConfiguration {
            routers: http_routers.finish(&mut conflicts),
            middlewares: http_middlewares.finish(&mut conflicts),
            services: http_services.finish(&mut conflicts),
        },
        tcp: TcpConfiguration {
            routers: tcp_routers.finish(&mut conflicts),
            middlewares: tcp_middlewares.finish(&mut conflicts),
            services: tcp_services.finish(&mut conflicts),
        },
        udp: UdpConfiguration {
            routers: udp_routers.finish(&mut conflicts),
            services: udp_services.finish(&mut conflicts),
        },
    };

    Merged {
        configuration,
        conflicts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynamic::{ServersLoadBalancer, Server, TcpServer, TcpServersLoadBalancer};

    fn http_service(url: &str, pass_host_header: bool) -> Service {
        Service {
            load_balancer: Some(ServersLoadBalancer {
                servers: vec![Server {
                    url: url.into(),
                    ..Default::default()
                }],
                pass_host_header: Some(pass_host_header),
                ..Default::default()
            }),
        }
    }

    fn partial_with_service(name: &str, service: Service) -> Configuration {
        let mut config = Configuration::default();
        config.http.services.insert(name.into(), service);
        config
    }

    fn urls(service: &Service) -> Vec<&str> {
        service
            .load_balancer
            .as_ref()
            .map(|lb| lb.servers.iter().map(|s| s.url.as_str()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_single_contributor_is_kept() {
        let partials = BTreeMap::from([(
            "a-1".to_string(),
            partial_with_service("web", http_service("http://10.0.0.1:80", true)),
        )]);
        let merged = merge(partials.clone());
        assert_eq!(merged.configuration, partials["a-1"]);
        assert!(merged.conflicts.is_empty());
    }

    #[test]
    fn test_agreeing_services_concatenate_servers() {
        let partials = BTreeMap::from([
            (
                "a-2".to_string(),
                partial_with_service("web", http_service("http://10.0.0.2:80", true)),
            ),
            (
                "a-1".to_string(),
                partial_with_service("web", http_service("http://10.0.0.1:80", true)),
            ),
            (
                "a-3".to_string(),
                partial_with_service("web", http_service("http://10.0.0.1:80", true)),
            ),
        ]);
        let merged = merge(partials);
        // Key order, duplicates kept.
        assert_eq!(
            urls(&merged.configuration.http.services["web"]),
            vec!["http://10.0.0.1:80", "http://10.0.0.2:80", "http://10.0.0.1:80"]
        );
        assert!(merged.conflicts.is_empty());
    }

    #[test]
    fn test_disagreeing_services_are_dropped() {
        let mut second = partial_with_service("web", http_service("http://10.0.0.2:80", false));
        second.http.services.insert("other".into(), http_service("http://10.0.0.2:81", true));
        let partials = BTreeMap::from([
            (
                "a-1".to_string(),
                partial_with_service("web", http_service("http://10.0.0.1:80", true)),
            ),
            ("a-2".to_string(), second),
            (
                "a-3".to_string(),
                partial_with_service("web", http_service("http://10.0.0.3:80", true)),
            ),
        ]);
        let merged = merge(partials);

        assert!(!merged.configuration.http.services.contains_key("web"));
        assert!(merged.configuration.http.services.contains_key("other"));
        assert_eq!(
            merged.conflicts,
            vec![MergeConflict {
                protocol: Protocol::Http,
                kind: EntityKind::Service,
                name: "web".into(),
                contributors: vec!["a-1".into(), "a-2".into(), "a-3".into()],
            }]
        );
    }

    #[test]
    fn test_routers_must_be_identical() {
        let router = |rule: &str| Router {
            rule: rule.into(),
            service: "web".into(),
            ..Default::default()
        };
        let mut a = Configuration::default();
        a.http.routers.insert("same".into(), router("Host(`a`)"));
        a.http.routers.insert("differs".into(), router("Host(`a`)"));
        let mut b = Configuration::default();
        b.http.routers.insert("same".into(), router("Host(`a`)"));
        b.http.routers.insert("differs".into(), router("Host(`b`)"));

        let merged = merge(BTreeMap::from([("a".to_string(), a), ("b".to_string(), b)]));
        assert_eq!(merged.configuration.http.routers.len(), 1);
        assert_eq!(merged.configuration.http.routers["same"], router("Host(`a`)"));
        assert_eq!(merged.conflicts.len(), 1);
        assert_eq!(merged.conflicts[0].kind, EntityKind::Router);
        // Routers pointing at a dropped entity are untouched.
        assert_eq!(merged.configuration.http.routers["same"].service, "web");
    }

    #[test]
    fn test_tcp_and_udp_buckets() {
        let tcp_service = |address: &str, transport: Option<&str>| TcpService {
            load_balancer: Some(TcpServersLoadBalancer {
                servers: vec![TcpServer {
                    address: address.into(),
                    ..Default::default()
                }],
                servers_transport: transport.map(str::to_string),
            }),
        };
        let mut a = Configuration::default();
        a.tcp.services.insert("db".into(), tcp_service("10.0.0.1:5432", None));
        a.tcp.services.insert("cache".into(), tcp_service("10.0.0.1:6379", None));
        a.udp.services.insert("dns".into(), UdpService::default());
        let mut b = Configuration::default();
        b.tcp.services.insert("db".into(), tcp_service("10.0.0.2:5432", None));
        b.tcp.services.insert("cache".into(), tcp_service("10.0.0.2:6379", Some("tls")));
        b.udp.services.insert(
            "dns".into(),
            UdpService {
                load_balancer: Some(Default::default()),
            },
        );

        let merged = merge(BTreeMap::from([("a".to_string(), a), ("b".to_string(), b)]));
        let db = &merged.configuration.tcp.services["db"];
        assert_eq!(db.load_balancer.as_ref().unwrap().servers.len(), 2);
        assert!(!merged.configuration.tcp.services.contains_key("cache"));
        assert!(merged.configuration.udp.services.is_empty());
        assert_eq!(merged.conflicts.len(), 2);
        assert_eq!(merged.conflicts[0].protocol, Protocol::Tcp);
        assert_eq!(merged.conflicts[1].protocol, Protocol::Udp);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let partials = BTreeMap::from([
            (
                "a-1".to_string(),
                partial_with_service("web", http_service("http://10.0.0.1:80", true)),
            ),
            (
                "a-2".to_string(),
                partial_with_service("web", http_service("http://10.0.0.2:80", false)),
            ),
        ]);
        assert_eq!(merge(partials.clone()), merge(partials));
    }
}
