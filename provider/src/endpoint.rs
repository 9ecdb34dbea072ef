use crate::instance::{Instance, Transport};
use crate::port::{PortPolicy, PortResolutionError, PortSpecifier, resolve_port};
use dynamic::{
    Server, Service, ServersLoadBalancer, TcpServer, TcpService, TcpServersLoadBalancer,
    UdpServer, UdpService, UdpServersLoadBalancer,
};
use url::Url;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointBuildError {
    #[error("defining scheme or port is not allowed when url is defined")]
    UrlWithPortOrScheme,

    #[error("preservePath can only be set together with url")]
    PreservePathWithoutUrl,

    #[error("defining port is not allowed when address is defined")]
    AddressWithPort,

    #[error("instance has no address")]
    MissingAddress,

    #[error("invalid server url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Failure that abandons a single service of an instance.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("load-balancer is not defined")]
    MissingLoadBalancer,

    #[error(transparent)]
    Port(#[from] PortResolutionError),

    #[error(transparent)]
    Endpoint(#[from] EndpointBuildError),
}

/// `host:port`, with IPv6 hosts in brackets.
pub fn join_host_port(address: &str, port: u16) -> Result<String, EndpointBuildError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(EndpointBuildError::MissingAddress);
    }
    if address.contains(':') && !address.starts_with('[') {
        Ok(format!("[{address}]:{port}"))
    } else {
        Ok(format!("{address}:{port}"))
    }
}

/// `scheme://host:port`, the scheme defaulting to `http`.
pub fn http_url(
    address: &str,
    port: u16,
    scheme: Option<&str>,
) -> Result<String, EndpointBuildError> {
    let scheme = scheme.map(str::trim).filter(|s| !s.is_empty()).unwrap_or("http");
    let url = format!("{scheme}://{}", join_host_port(address, port)?);
    parse_url(&url)?;
    Ok(url)
}

fn parse_url(url: &str) -> Result<Url, EndpointBuildError> {
    Url::parse(url).map_err(|e| EndpointBuildError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// What a server needs from its instance to become a concrete endpoint.
pub struct EndpointContext<'a> {
    pub instance: &'a Instance,
    pub policy: &'a PortPolicy,
}

impl EndpointContext<'_> {
    fn port(&self, label: Option<&str>, transport: Transport) -> Result<u16, PortResolutionError> {
        let specifier: PortSpecifier = label.unwrap_or_default().parse()?;
        resolve_port(
            &self.instance.ports,
            &self.instance.port_definitions,
            &specifier,
            self.policy,
            transport,
        )
    }
}

/// A server as decoded from labels, possibly only partially specified.
pub trait Endpoint: Default + Sized {
    /// Returns the server with its final address and label-only fields cleared.
    fn resolve(self, ctx: &EndpointContext<'_>) -> Result<Self, ServiceError>;
}

impl Endpoint for Server {
    fn resolve(self, ctx: &EndpointContext<'_>) -> Result<Self, ServiceError> {
        if !self.url.is_empty() {
            if self.port.is_some() || self.scheme.is_some() {
                return Err(EndpointBuildError::UrlWithPortOrScheme.into());
            }
            parse_url(&self.url)?;
            return Ok(self);
        }

        if self.preserve_path == Some(true) {
            return Err(EndpointBuildError::PreservePathWithoutUrl.into());
        }

        let port = ctx.port(self.port.as_deref(), Transport::Tcp)?;
        Ok(Server {
            url: http_url(&ctx.instance.address, port, self.scheme.as_deref())?,
            ..Default::default()
        })
    }
}

impl Endpoint for TcpServer {
    fn resolve(self, ctx: &EndpointContext<'_>) -> Result<Self, ServiceError> {
        if !self.address.is_empty() {
            if self.port.is_some() {
                return Err(EndpointBuildError::AddressWithPort.into());
            }
            return Ok(self);
        }

        let port = ctx.port(self.port.as_deref(), Transport::Tcp)?;
        Ok(TcpServer {
            address: join_host_port(&ctx.instance.address, port)?,
            port: None,
            tls: self.tls,
        })
    }
}

impl Endpoint for UdpServer {
    fn resolve(self, ctx: &EndpointContext<'_>) -> Result<Self, ServiceError> {
        if !self.address.is_empty() {
            if self.port.is_some() {
                return Err(EndpointBuildError::AddressWithPort.into());
            }
            return Ok(self);
        }

        let port = ctx.port(self.port.as_deref(), Transport::Udp)?;
        Ok(UdpServer {
            address: join_host_port(&ctx.instance.address, port)?,
            port: None,
        })
    }
}

/// A service of any protocol that balances over a list of servers.
pub trait LoadBalanced: Sized {
    type Server: Endpoint;

    /// A service with an empty load balancer, used when labels define none.
    fn synthesized() -> Self;

    /// `None` when the service has no load balancer section.
    fn servers_mut(&mut self) -> Option<&mut Vec<Self::Server>>;

    /// Resolves every server against the instance. A service without server
    /// labels gets exactly one server on the instance's default port.
    fn resolve_servers(mut self, ctx: &EndpointContext<'_>) -> Result<Self, ServiceError> {
        let servers = self.servers_mut().ok_or(ServiceError::MissingLoadBalancer)?;
        if servers.is_empty() {
            servers.push(Self::Server::default());
        }

        let resolved = std::mem::take(servers)
            .into_iter()
            .map(|server| server.resolve(ctx))
            .collect::<Result<Vec<_>, _>>()?;
        *servers = resolved;

        Ok(self)
    }
}

impl LoadBalanced for Service {
    type Server = Server;

    fn synthesized() -> Self {
        Service {
            load_balancer: Some(ServersLoadBalancer::default()),
        }
    }

    fn servers_mut(&mut self) -> Option<&mut Vec<Server>> {
        self.load_balancer.as_mut().map(|lb| &mut lb.servers)
    }
}

impl LoadBalanced for TcpService {
    type Server = TcpServer;

    fn synthesized() -> Self {
        TcpService {
            load_balancer: Some(TcpServersLoadBalancer::default()),
        }
    }

    fn servers_mut(&mut self) -> Option<&mut Vec<TcpServer>> {
        self.load_balancer.as_mut().map(|lb| &mut lb.servers)
    }
}

impl LoadBalanced for UdpService {
    type Server = UdpServer;

    fn synthesized() -> Self {
        UdpService {
            load_balancer: Some(UdpServersLoadBalancer::default()),
        }
    }

    fn servers_mut(&mut self) -> Option<&mut Vec<UdpServer>> {
        self.load_balancer.as_mut().map(|lb| &mut lb.servers)
    }
}
