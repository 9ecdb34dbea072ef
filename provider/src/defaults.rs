//! Defaults for what labels leave out.

use crate::Protocol;
use crate::endpoint::LoadBalanced;
use crate::metrics_defs::BUILD_ROUTER_ERRORS;
use dynamic::{ResponseForwarding, Router, Service, ServersLoadBalancer, TcpRouter, UdpRouter};
use shared::counter;
use std::collections::BTreeMap;

pub const DEFAULT_STRATEGY: &str = "wrr";
pub const DEFAULT_FLUSH_INTERVAL: &str = "100ms";

/// Sets the baseline values of every field the load balancer leaves unset.
pub fn fill_defaults(lb: ServersLoadBalancer) -> ServersLoadBalancer {
    let flush_interval = lb
        .response_forwarding
        .and_then(|rf| rf.flush_interval)
        .unwrap_or_else(|| DEFAULT_FLUSH_INTERVAL.to_string());

    ServersLoadBalancer {
        pass_host_header: lb.pass_host_header.or(Some(true)),
        strategy: lb.strategy.or_else(|| Some(DEFAULT_STRATEGY.to_string())),
        response_forwarding: Some(ResponseForwarding {
            flush_interval: Some(flush_interval),
        }),
        ..lb
    }
}

pub fn fill_service_defaults(service: Service) -> Service {
    Service {
        load_balancer: service.load_balancer.map(fill_defaults),
    }
}

/// A router of any protocol.
pub trait Routed {
    fn service(&self) -> &str;
    fn set_service(&mut self, service: String);
    /// `None` for protocols routed without rules.
    fn rule(&self) -> Option<&str>;
    fn set_rule(&mut self, rule: String);
}

impl Routed for Router {
    fn service(&self) -> &str {
        &self.service
    }

    fn set_service(&mut self, service: String) {
        self.service = service;
    }

    fn rule(&self) -> Option<&str> {
        Some(&self.rule)
    }

    fn set_rule(&mut self, rule: String) {
        self.rule = rule;
    }
}

impl Routed for TcpRouter {
    fn service(&self) -> &str {
        &self.service
    }

    fn set_service(&mut self, service: String) {
        self.service = service;
    }

    fn rule(&self) -> Option<&str> {
        Some(&self.rule)
    }

    fn set_rule(&mut self, rule: String) {
        self.rule = rule;
    }
}

impl Routed for UdpRouter {
    fn service(&self) -> &str {
        &self.service
    }

    fn set_service(&mut self, service: String) {
        self.service = service;
    }

    fn rule(&self) -> Option<&str> {
        None
    }

    fn set_rule(&mut self, _rule: String) {}
}

/// Adds a service named `name` when labels define none.
pub fn with_default_service<S: LoadBalanced>(
    mut services: BTreeMap<String, S>,
    name: &str,
) -> BTreeMap<String, S> {
    if services.is_empty() {
        services.insert(name.to_string(), S::synthesized());
    }
    services
}

/// Adds a HTTP router named `name` when labels define none and the instance
/// has exactly one service for it to route to. Its rule is left empty for the
/// default rule.
pub fn with_default_router(
    mut routers: BTreeMap<String, Router>,
    services: &BTreeMap<String, Service>,
    name: &str,
    instance: &str,
) -> BTreeMap<String, Router> {
    if !routers.is_empty() {
        return routers;
    }

    match services.len() {
        0 => {}
        1 => {
            routers.insert(name.to_string(), Router::default());
        }
        count => {
            tracing::info!(
                instance = %instance,
                services = count,
                "Could not create a router for the instance: too many services"
            );
        }
    }

    routers
}

/// Points every router that names no service at the sole service of its
/// protocol. Routers left without a service are dropped.
pub fn bind_routers<R: Routed, S>(
    routers: BTreeMap<String, R>,
    services: &BTreeMap<String, S>,
    protocol: Protocol,
    instance: &str,
) -> BTreeMap<String, R> {
    let sole = match services.len() {
        1 => services.keys().next(),
        _ => None,
    };

    routers
        .into_iter()
        .filter_map(|(name, mut router)| {
            if !router.service().is_empty() {
                return Some((name, router));
            }
            if let Some(service) = sole {
                router.set_service(service.clone());
                return Some((name, router));
            }

            tracing::error!(
                instance = %instance,
                %protocol,
                router = %name,
                services = services.len(),
                "Dropping router without a service: the instance does not have exactly one"
            );
            counter!(BUILD_ROUTER_ERRORS, "protocol" => protocol.as_str()).increment(1);
            None
        })
        .collect()
}
