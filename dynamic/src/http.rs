use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Not;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfiguration {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: BTreeMap<String, Router>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub middlewares: BTreeMap<String, Middleware>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, Service>,
}

impl HttpConfiguration {
    pub fn is_empty(&self) -> bool {
        self.routers.is_empty() && self.middlewares.is_empty() && self.services.is_empty()
    }
}

/// Binds requests matching `rule` to `service`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Router {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entry_points: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTls>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouterTls {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cert_resolver: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub options: String,
}

/// A named request transformation. Exactly one variant is expected to be set;
/// the serving engine rejects middlewares that set none or several.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Middleware {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_prefix: Option<AddPrefix>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strip_prefix: Option<StripPrefix>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_scheme: Option<RedirectScheme>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<Retry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AddPrefix {
    pub prefix: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StripPrefix {
    pub prefixes: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RedirectScheme {
    pub scheme: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub port: String,
    #[serde(skip_serializing_if = "Not::not")]
    pub permanent: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Headers {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_request_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_response_headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BasicAuth {
    pub users: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub realm: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimit {
    pub average: i64,
    pub burst: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Retry {
    pub attempts: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub initial_interval: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Service {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<ServersLoadBalancer>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServersLoadBalancer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sticky: Option<Sticky>,
    // Labels describe a single `server`; the merged configuration carries the list.
    #[serde(
        rename(serialize = "servers", deserialize = "server"),
        alias = "servers",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub servers: Vec<Server>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<ServerHealthCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_host_header: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_forwarding: Option<ResponseForwarding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub servers_transport: Option<String>,
}

impl ServersLoadBalancer {
    /// Compares every field except the server list.
    pub fn eq_ignoring_servers(&self, other: &Self) -> bool {
        let Self {
            sticky,
            servers: _,
            strategy,
            health_check,
            pass_host_header,
            response_forwarding,
            servers_transport,
        } = self;

        *sticky == other.sticky
            && *strategy == other.strategy
            && *health_check == other.health_check
            && *pass_host_header == other.pass_host_header
            && *response_forwarding == other.response_forwarding
            && *servers_transport == other.servers_transport
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Sticky {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<Cookie>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Cookie {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "Not::not")]
    pub secure: bool,
    #[serde(skip_serializing_if = "Not::not")]
    pub http_only: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub same_site: String,
}

/// One backend endpoint of a HTTP service.
///
/// `scheme` and `port` only exist on the label side: they are folded into `url`
/// when the endpoint is built and are never serialized.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Server {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing)]
    pub scheme: Option<String>,
    #[serde(skip_serializing)]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preserve_path: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerHealthCheck {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scheme: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub interval: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResponseForwarding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush_interval: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lb(url: &str, pass_host_header: Option<bool>) -> ServersLoadBalancer {
        ServersLoadBalancer {
            servers: vec![Server {
                url: url.to_string(),
                ..Default::default()
            }],
            pass_host_header,
            ..Default::default()
        }
    }

    #[test]
    fn test_eq_ignoring_servers() {
        let a = lb("http://10.0.0.1:80", Some(true));
        let b = lb("http://10.0.0.2:80", Some(true));
        let c = lb("http://10.0.0.1:80", Some(false));

        assert!(a.eq_ignoring_servers(&b));
        assert_ne!(a, b);
        assert!(!a.eq_ignoring_servers(&c));
    }

    #[test]
    fn test_label_only_fields_are_not_serialized() {
        let server = Server {
            url: "http://10.0.0.1:8080".into(),
            scheme: Some("https".into()),
            port: Some("8080".into()),
            preserve_path: None,
        };
        let json = serde_json::to_value(&server).unwrap();
        assert_eq!(json, serde_json::json!({"url": "http://10.0.0.1:8080"}));
    }
}
