//! Synthesis of routing configuration from instance labels.
//!
//! Each discovery cycle, every eligible [`Instance`] is turned into a partial
//! [`dynamic::Configuration`] by a [`ConfigurationBuilder`]: labels are decoded,
//! missing services and routers are synthesized, servers are resolved against
//! the instance's ports and rules are rendered. The partials of a cycle are
//! then combined by [`merge`] into the configuration published downstream.

pub mod builder;
pub mod cache;
pub mod config;
pub mod constraints;
pub mod defaults;
pub mod discovery;
pub mod endpoint;
pub mod filter;
pub mod instance;
pub mod merge;
pub mod metrics_defs;
pub mod port;
pub mod rule;

pub use builder::{BuildError, ConfigurationBuilder};
pub use cache::MetadataCache;
pub use config::{CacheConfig, ProviderConfig, ValidationError};
pub use discovery::{Discovery, DiscoveryError, Message, Provider, channel};
pub use instance::{HealthState, Instance, LifecycleState, PortDefinition, PortMapping, Transport};
pub use merge::{MergeConflict, Merged, merge};
pub use port::{DefaultPort, PortPolicy};
pub use rule::{RuleTemplate, TemplateFunctions};

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Http,
    Tcp,
    Udp,
}

impl Protocol {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    Router,
    Middleware,
    Service,
}

impl EntityKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Router => "router",
            EntityKind::Middleware => "middleware",
            EntityKind::Service => "service",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
