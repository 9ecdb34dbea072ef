//! Dynamic routing configuration.
//!
//! This is the shape consumed by the serving engine: routers, middlewares and
//! load-balanced services, split by protocol. The same types are used for the
//! per-instance partial configurations produced from labels and for the merged
//! configuration published once per cycle.
//!
//! All maps are ordered so that serialization is deterministic across cycles.

mod http;
mod tcp;
mod udp;

pub use http::{
    AddPrefix, BasicAuth, Cookie, Headers, HttpConfiguration, Middleware, RateLimit,
    RedirectScheme, ResponseForwarding, Retry, Router, RouterTls, Server, ServerHealthCheck,
    Service, ServersLoadBalancer, Sticky, StripPrefix,
};
pub use tcp::{
    RouterTcpTls, TcpConfiguration, TcpInFlightConn, TcpIpAllowList, TcpMiddleware, TcpRouter,
    TcpServer, TcpServersLoadBalancer, TcpService,
};
pub use udp::{UdpConfiguration, UdpRouter, UdpServer, UdpServersLoadBalancer, UdpService};

use serde::{Deserialize, Serialize};

/// A complete or partial routing configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Configuration {
    #[serde(skip_serializing_if = "HttpConfiguration::is_empty")]
    pub http: HttpConfiguration,
    #[serde(skip_serializing_if = "TcpConfiguration::is_empty")]
    pub tcp: TcpConfiguration,
    #[serde(skip_serializing_if = "UdpConfiguration::is_empty")]
    pub udp: UdpConfiguration,
}

impl Configuration {
    pub fn is_empty(&self) -> bool {
        self.http.is_empty() && self.tcp.is_empty() && self.udp.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_configuration_serializes_to_empty_object() {
        let json = serde_json::to_value(Configuration::default()).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }

    #[test]
    fn test_json_roundtrip_keeps_servers() {
        let json = serde_json::json!({
            "http": {
                "services": {
                    "whoami": {
                        "loadBalancer": {
                            "servers": [{"url": "http://10.0.0.1:80"}],
                            "passHostHeader": true
                        }
                    }
                }
            }
        });
        let config: Configuration = serde_json::from_value(json.clone()).unwrap();
        let lb = config.http.services["whoami"].load_balancer.as_ref().unwrap();
        assert_eq!(lb.servers.len(), 1);
        assert_eq!(lb.servers[0].url, "http://10.0.0.1:80");
        assert_eq!(serde_json::to_value(&config).unwrap(), json);
    }
}
