use crate::instance::{PortDefinition, PortMapping, Transport};
use serde::Deserialize;
use std::str::FromStr;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PortResolutionError {
    #[error("invalid port specifier {0:?}")]
    InvalidSpecifier(String),

    #[error("port must be positive, got {0}")]
    NonPositive(i64),

    #[error("port index {index} is out of range, {available} ports available")]
    IndexOutOfRange { index: usize, available: usize },

    #[error("no port named {0:?}")]
    UnknownName(String),

    #[error("port specifier {0:?} is not supported by this discovery source")]
    Unsupported(String),

    #[error("no port available")]
    NoPorts,
}

/// How a server label refers to a port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortSpecifier {
    /// No port label, the source policy picks one.
    Default,
    /// Logical port number.
    Number(u16),
    /// Position in the available ports.
    Index(usize),
    /// Name of a declared port definition.
    Name(String),
}

impl FromStr for PortSpecifier {
    type Err = PortResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(PortSpecifier::Default);
        }

        if let Some(index) = s.strip_prefix("index:") {
            return index
                .parse()
                .map(PortSpecifier::Index)
                .map_err(|_| PortResolutionError::InvalidSpecifier(s.into()));
        }

        if let Some(name) = s.strip_prefix("name:") {
            if name.is_empty() {
                return Err(PortResolutionError::InvalidSpecifier(s.into()));
            }
            return Ok(PortSpecifier::Name(name.into()));
        }

        match s.parse::<i64>() {
            Ok(value) if value <= 0 => Err(PortResolutionError::NonPositive(value)),
            Ok(value) => u16::try_from(value)
                .map(PortSpecifier::Number)
                .map_err(|_| PortResolutionError::InvalidSpecifier(s.into())),
            Err(_) => Err(PortResolutionError::InvalidSpecifier(s.into())),
        }
    }
}

/// Port selected when a server does not name one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPort {
    /// Sources exposing raw host/transport pairs: lowest reachable port.
    #[default]
    LowestReachable,
    /// Sources exposing an ordered list of discovery ports: the first one.
    FirstListed,
}

/// The port-related capabilities of a discovery source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PortPolicy {
    pub default: DefaultPort,
    /// Whether `index:N` specifiers are supported.
    pub index: bool,
    /// Whether `name:NAME` specifiers are supported.
    pub name: bool,
}

impl PortPolicy {
    /// Container runtimes reporting host port bindings.
    pub const HOST_MAPPINGS: PortPolicy = PortPolicy {
        default: DefaultPort::LowestReachable,
        index: false,
        name: false,
    };

    /// Orchestrators reporting an ordered list of allocated ports.
    pub const PORT_LIST: PortPolicy = PortPolicy {
        default: DefaultPort::FirstListed,
        index: true,
        name: true,
    };
}

/// Resolves `specifier` to the port the proxy should connect to.
pub fn resolve_port(
    mappings: &[PortMapping],
    definitions: &[PortDefinition],
    specifier: &PortSpecifier,
    policy: &PortPolicy,
    transport: Transport,
) -> Result<u16, PortResolutionError> {
    let mut available: Vec<&PortMapping> =
        mappings.iter().filter(|m| m.transport == transport).collect();
    if available.is_empty() {
        available = mappings.iter().collect();
    }

    match specifier {
        PortSpecifier::Default => {
            let port = match policy.default {
                DefaultPort::LowestReachable => available.iter().map(|m| m.reachable).min(),
                DefaultPort::FirstListed => available.first().map(|m| m.reachable),
            };
            port.ok_or(PortResolutionError::NoPorts)
        }
        PortSpecifier::Number(port) => Ok(available
            .iter()
            .find(|m| m.logical == *port)
            .map_or(*port, |m| m.reachable)),
        PortSpecifier::Index(index) => {
            if !policy.index {
                return Err(PortResolutionError::Unsupported(format!("index:{index}")));
            }
            available
                .get(*index)
                .map(|m| m.reachable)
                .ok_or(PortResolutionError::IndexOutOfRange {
                    index: *index,
                    available: available.len(),
                })
        }
        PortSpecifier::Name(name) => {
            if !policy.name {
                return Err(PortResolutionError::Unsupported(format!("name:{name}")));
            }
            let position = definitions
                .iter()
                .position(|d| d.name == *name)
                .ok_or_else(|| PortResolutionError::UnknownName(name.clone()))?;
            Ok(available
                .get(position)
                .map_or(definitions[position].port, |m| m.reachable))
        }
    }
}
