use provider::{PortPolicy, ProviderConfig, ValidationError};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::path::PathBuf;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum SourceType {
    /// Instances listed in a YAML file, read again every cycle.
    File { path: PathBuf },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SourceConfig {
    pub name: String,
    #[serde(flatten)]
    pub r#type: SourceType,
    #[serde(default)]
    pub port_policy: PortPolicy,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    pub sources: Vec<SourceConfig>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.provider.validate()?;

        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.is_empty() {
                return Err(ConfigError::EmptySourceName);
            }
            if !names.insert(&source.name) {
                return Err(ConfigError::DuplicateSource(source.name.clone()));
            }
        }

        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid provider config: {0}")]
    Provider(#[from] ValidationError),
    #[error("at least one source must be configured")]
    NoSources,
    #[error("empty source name")]
    EmptySourceName,
    #[error("duplicate source name: {0}")]
    DuplicateSource(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use provider::DefaultPort;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                sentry_dsn: https://key@sentry.example/1
            provider:
                label_prefix: traefik
                exposed_by_default: false
                refresh_interval_secs: 5
            sources:
                - name: static
                  type: file
                  path: /etc/gantry/instances.yaml
                - name: nomad
                  type: file
                  path: /etc/gantry/nomad.yaml
                  port_policy:
                      default: first_listed
                      index: true
                      name: true
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");
        config.validate().expect("valid config");

        assert_eq!(
            config.common.metrics,
            Some(MetricsConfig {
                statsd_host: "127.0.0.1".into(),
                statsd_port: 8125,
            })
        );
        assert!(!config.provider.exposed_by_default);
        assert_eq!(config.provider.refresh_interval_secs, 5);
        assert_eq!(
            config.sources[0].r#type,
            SourceType::File {
                path: "/etc/gantry/instances.yaml".into()
            }
        );
        assert_eq!(config.sources[0].port_policy, PortPolicy::default());
        assert_eq!(config.sources[1].port_policy.default, DefaultPort::FirstListed);
        assert!(config.sources[1].port_policy.index);
    }

    #[test]
    fn test_minimal_config() {
        let yaml = r#"
            sources:
                - name: static
                  type: file
                  path: instances.yaml
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");
        config.validate().expect("valid config");
        assert_eq!(config.provider, ProviderConfig::default());
        assert!(config.common.metrics.is_none());
        assert!(config.common.logging.is_none());
    }

    #[test]
    fn test_invalid_configs() {
        let cases = [
            ("sources: []", "NoSources"),
            (
                "sources: [{name: a, type: file, path: x}, {name: a, type: file, path: y}]",
                "DuplicateSource",
            ),
            ("sources: [{name: '', type: file, path: x}]", "EmptySourceName"),
            (
                "provider: {refresh_interval_secs: 0}\nsources: [{name: a, type: file, path: x}]",
                "Provider",
            ),
        ];

        for (yaml, expected) in cases {
            let tmp = write_tmp_file(yaml);
            let config = Config::from_file(tmp.path()).expect("load config");
            let err = config.validate().expect_err(yaml);
            assert!(format!("{err:?}").starts_with(expected), "{yaml}: {err:?}");
        }
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/gantry.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::LoadError(_)));
    }

    #[test]
    fn test_unknown_source_type() {
        let tmp = write_tmp_file("sources: [{name: a, type: consul}]");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
