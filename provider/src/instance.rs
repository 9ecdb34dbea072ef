use serde::Deserialize;
use std::collections::BTreeMap;

/// One discovered backend, as reported by a discovery source for a single cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Instance {
    /// Platform-derived name, shared by replicas of the same workload.
    pub name: String,
    /// Disambiguates instances that share a name.
    pub id: String,
    pub labels: BTreeMap<String, String>,
    pub address: String,
    pub ports: Vec<PortMapping>,
    /// Named ports declared by the workload definition, positional with `ports`.
    pub port_definitions: Vec<PortDefinition>,
    pub health: HealthState,
    pub lifecycle: LifecycleState,
}

impl Instance {
    /// Key under which the instance's partial configuration is merged. Keys are
    /// merged in order, so this also fixes the server order across cycles.
    pub fn key(&self) -> String {
        let name = normalize(&self.name);
        if self.id.is_empty() {
            name
        } else {
            format!("{name}-{}", self.id)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct PortMapping {
    /// Container-facing port.
    pub logical: u16,
    /// Port reachable from the proxy (host port, mapped port...).
    pub reachable: u16,
    #[serde(default)]
    pub transport: Transport,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct PortDefinition {
    pub name: String,
    pub port: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// The platform reports no health check for the instance.
    #[default]
    None,
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Pending,
    #[default]
    Running,
    Stopping,
    Stopped,
}

/// Turns an arbitrary platform name into an entity name: every run of
/// characters that are not letters or digits becomes a single `-`.
pub fn normalize(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("Test"), "Test");
        assert_eq!(normalize("/my_app"), "my-app");
        assert_eq!(normalize("foo..bar--baz"), "foo-bar-baz");
        assert_eq!(normalize("stack_web.1"), "stack-web-1");
        assert_eq!(normalize(""), "");
    }

    #[test]
    fn test_instance_key() {
        let mut instance = Instance {
            name: "/web_app".into(),
            ..Default::default()
        };
        assert_eq!(instance.key(), "web-app");

        instance.id = "abc123".into();
        assert_eq!(instance.key(), "web-app-abc123");
    }

    #[test]
    fn test_instance_from_yaml() {
        let yaml = r#"
name: whoami
id: "1"
address: 10.0.0.5
labels:
    traefik.http.routers.whoami.rule: Host(`whoami.local`)
ports:
    - logical: 80
      reachable: 32768
    - logical: 53
      reachable: 5353
      transport: udp
health: healthy
"#;
        let instance: Instance = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(instance.ports[0].transport, Transport::Tcp);
        assert_eq!(instance.ports[1].transport, Transport::Udp);
        assert_eq!(instance.health, HealthState::Healthy);
        assert_eq!(instance.lifecycle, LifecycleState::Running);
        assert_eq!(instance.labels.len(), 1);
    }
}
