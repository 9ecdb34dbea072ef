use crate::Protocol;
use crate::cache::MetadataCache;
use crate::config::{ProviderConfig, ValidationError};
use crate::defaults::{
    Routed, bind_routers, fill_service_defaults, with_default_router, with_default_service,
};
use crate::endpoint::{EndpointContext, LoadBalanced};
use crate::filter::{Eligibility, FilterError, InstanceFilter};
use crate::instance::{Instance, normalize};
use crate::metrics_defs::{BUILD_ROUTER_ERRORS, BUILD_SERVICE_ERRORS};
use crate::port::PortPolicy;
use crate::rule::{RuleContext, RuleTemplate, TemplateFunctions};
use dynamic::{Configuration, HttpConfiguration, Service, TcpConfiguration, UdpConfiguration};
use labels::DecodeError;
use shared::counter;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Failure that skips an instance's whole contribution.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("could not decode labels: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Per-instance state shared by the protocol builders.
struct InstanceScope<'a> {
    key: &'a str,
    name: String,
    endpoints: EndpointContext<'a>,
    rules: RuleContext<'a>,
}

/// Turns one instance into its partial configuration.
pub struct ConfigurationBuilder {
    source: String,
    label_prefix: String,
    filters: Vec<String>,
    filter: InstanceFilter,
    default_rule: RuleTemplate,
    functions: TemplateFunctions,
    cache: Arc<MetadataCache>,
}

impl ConfigurationBuilder {
    pub fn new(
        source: impl Into<String>,
        config: &ProviderConfig,
        functions: TemplateFunctions,
        cache: Arc<MetadataCache>,
    ) -> Result<Self, ValidationError> {
        config.validate_with(&functions)?;
        let default_rule = RuleTemplate::compile(&config.default_rule, &functions)?;
        let prefix = &config.label_prefix;

        Ok(ConfigurationBuilder {
            source: source.into(),
            label_prefix: prefix.clone(),
            filters: vec![
                format!("{prefix}.http"),
                format!("{prefix}.tcp"),
                format!("{prefix}.udp"),
            ],
            filter: InstanceFilter::new(
                prefix,
                config.exposed_by_default,
                config.constraints.as_deref(),
            )?,
            default_rule,
            functions,
            cache,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Builds the partial configuration of `instance`, or `None` when the
    /// instance is not eligible. Failures of a single service or router only
    /// remove that entity.
    pub fn build(
        &self,
        instance: &Instance,
        policy: &PortPolicy,
    ) -> Result<Option<Configuration>, BuildError> {
        let key = instance.key();

        match self.filter.eligibility(instance)? {
            Eligibility::Eligible => {}
            reason => {
                tracing::debug!(instance = %key, ?reason, "Filtering instance");
                return Ok(None);
            }
        }

        let decoded = self
            .cache
            .get_or_decode(&self.source, &key, &instance.labels, || {
                self.decode(instance)
            })?;
        let Configuration { http, tcp, udp } = decoded.as_ref().clone();

        let scope = InstanceScope {
            key: &key,
            name: normalize(&instance.name),
            endpoints: EndpointContext { instance, policy },
            rules: RuleContext {
                name: &instance.name,
                labels: &instance.labels,
            },
        };

        // Middlewares alone do not make an instance a TCP/UDP backend.
        let tcp_routed = !tcp.routers.is_empty() || !tcp.services.is_empty();
        let udp_routed = !udp.routers.is_empty() || !udp.services.is_empty();

        let tcp = if tcp_routed {
            self.build_tcp(tcp, &scope)
        } else {
            tcp
        };
        let udp = if udp_routed {
            self.build_udp(udp, &scope)
        } else {
            udp
        };
        let http = if http.is_empty() && (tcp_routed || udp_routed) {
            http
        } else {
            self.build_http(http, &scope)
        };

        Ok(Some(Configuration { http, tcp, udp }))
    }

    fn decode(&self, instance: &Instance) -> Result<Configuration, DecodeError> {
        let filters: Vec<&str> = self.filters.iter().map(String::as_str).collect();
        labels::decode(&instance.labels, &self.label_prefix, &filters)
    }

    fn build_http(&self, http: HttpConfiguration, scope: &InstanceScope<'_>) -> HttpConfiguration {
        let HttpConfiguration {
            routers,
            middlewares,
            services,
        } = http;

        let services: BTreeMap<String, Service> = with_default_service(services, &scope.name)
            .into_iter()
            .map(|(name, service)| (name, fill_service_defaults(service)))
            .collect();
        let services = resolve_services(services, scope, Protocol::Http);

        let routers = with_default_router(routers, &services, &scope.name, scope.key);
        let routers = self.render_rules(routers, Some(&self.default_rule), scope, Protocol::Http);
        let routers = bind_routers(routers, &services, Protocol::Http, scope.key);

        HttpConfiguration {
            routers,
            middlewares,
            services,
        }
    }

    fn build_tcp(&self, tcp: TcpConfiguration, scope: &InstanceScope<'_>) -> TcpConfiguration {
        let TcpConfiguration {
            routers,
            middlewares,
            services,
        } = tcp;

        let services = resolve_services(
            with_default_service(services, &scope.name),
            scope,
            Protocol::Tcp,
        );
        let routers = self.render_rules(routers, None, scope, Protocol::Tcp);
        let routers = bind_routers(routers, &services, Protocol::Tcp, scope.key);

        TcpConfiguration {
            routers,
            middlewares,
            services,
        }
    }

    fn build_udp(&self, udp: UdpConfiguration, scope: &InstanceScope<'_>) -> UdpConfiguration {
        let UdpConfiguration { routers, services } = udp;

        let services = resolve_services(
            with_default_service(services, &scope.name),
            scope,
            Protocol::Udp,
        );
        let routers = bind_routers(routers, &services, Protocol::Udp, scope.key);

        UdpConfiguration { routers, services }
    }

    /// Renders every router rule as a template. Routers with an empty rule get
    /// `default_rule`; a router whose rule fails to render or renders empty is
    /// dropped.
    fn render_rules<R: Routed>(
        &self,
        routers: BTreeMap<String, R>,
        default_rule: Option<&RuleTemplate>,
        scope: &InstanceScope<'_>,
        protocol: Protocol,
    ) -> BTreeMap<String, R> {
        routers
            .into_iter()
            .filter_map(|(name, mut router)| {
                let rendered = match router.rule() {
                    None => return Some((name, router)),
                    Some("") => default_rule.map_or(Ok(String::new()), |template| {
                        template.render(&scope.rules)
                    }),
                    Some(rule) => RuleTemplate::compile(rule, &self.functions)
                        .and_then(|template| template.render(&scope.rules)),
                };

                match rendered {
                    Ok(rule) if !rule.trim().is_empty() => {
                        router.set_rule(rule);
                        Some((name, router))
                    }
                    Ok(_) => {
                        tracing::error!(
                            instance = %scope.key,
                            %protocol,
                            router = %name,
                            "Dropping router with an empty rule"
                        );
                        counter!(BUILD_ROUTER_ERRORS, "protocol" => protocol.as_str()).increment(1);
                        None
                    }
                    Err(error) => {
                        tracing::error!(
                            instance = %scope.key,
                            %protocol,
                            router = %name,
                            %error,
                            "Dropping router whose rule could not be rendered"
                        );
                        counter!(BUILD_ROUTER_ERRORS, "protocol" => protocol.as_str()).increment(1);
                        None
                    }
                }
            })
            .collect()
    }
}

fn resolve_services<S: LoadBalanced>(
    services: BTreeMap<String, S>,
    scope: &InstanceScope<'_>,
    protocol: Protocol,
) -> BTreeMap<String, S> {
    services
        .into_iter()
        .filter_map(|(name, service)| match service.resolve_servers(&scope.endpoints) {
            Ok(service) => Some((name, service)),
            Err(error) => {
                tracing::error!(
                    instance = %scope.key,
                    %protocol,
                    service = %name,
                    %error,
                    "Abandoning service"
                );
                counter!(BUILD_SERVICE_ERRORS, "protocol" => protocol.as_str()).increment(1);
                None
            }
        })
        .collect()
}
