use async_trait::async_trait;
use provider::{Discovery, DiscoveryError, Instance, PortPolicy};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize)]
struct InstanceFile {
    #[serde(default)]
    instances: Vec<Instance>,
}

/// Discovery source backed by a YAML file listing instances. The file is read
/// again on every cycle, so edits are picked up at the next refresh.
pub struct FileDiscovery {
    name: String,
    path: PathBuf,
    port_policy: PortPolicy,
}

impl FileDiscovery {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, port_policy: PortPolicy) -> Self {
        FileDiscovery {
            name: name.into(),
            path: path.into(),
            port_policy,
        }
    }
}

#[async_trait]
impl Discovery for FileDiscovery {
    fn name(&self) -> &str {
        &self.name
    }

    fn port_policy(&self) -> PortPolicy {
        self.port_policy
    }

    async fn instances(&self) -> Result<Vec<Instance>, DiscoveryError> {
        let data = tokio::fs::read_to_string(&self.path).await?;
        let file: InstanceFile =
            serde_yaml::from_str(&data).map_err(|e| DiscoveryError::Parse(e.to_string()))?;

        tracing::debug!(
            source = %self.name,
            path = %self.path.display(),
            instances = file.instances.len(),
            "Read instance file"
        );
        Ok(file.instances)
    }
}
