use crate::cache::{DEFAULT_MAX_CAPACITY, DEFAULT_TTL_SECS, MetadataCache};
use crate::constraints::{Constraint, ConstraintError};
use crate::rule::{RuleTemplate, TemplateError, TemplateFunctions};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_LABEL_PREFIX: &str = "traefik";
pub const DEFAULT_RULE: &str = "Host(`{{ normalize .Name }}`)";
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 15;

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("Label prefix cannot be empty")]
    EmptyLabelPrefix,

    #[error("Refresh interval cannot be 0")]
    ZeroRefreshInterval,

    #[error("Cache capacity cannot be 0")]
    ZeroCacheCapacity,

    #[error("Cache TTL cannot be 0")]
    ZeroCacheTtl,

    #[error("Invalid default rule: {0}")]
    DefaultRule(#[from] TemplateError),

    #[error("Invalid constraints: {0}")]
    Constraints(#[from] ConstraintError),
}

/// Settings shared by every discovery source.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Root of the labels the provider reads, e.g. `traefik.http...`.
    pub label_prefix: String,
    /// Whether instances without an enable label are exposed.
    pub exposed_by_default: bool,
    /// Rule template for routers that have none.
    pub default_rule: String,
    /// Constraint expression instances must satisfy.
    pub constraints: Option<String>,
    pub refresh_interval_secs: u64,
    pub cache: CacheConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
            exposed_by_default: true,
            default_rule: DEFAULT_RULE.to_string(),
            constraints: None,
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            cache: CacheConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_with(&TemplateFunctions::new())
    }

    /// Validates the configuration, compiling the default rule against
    /// `functions`.
    pub fn validate_with(&self, functions: &TemplateFunctions) -> Result<(), ValidationError> {
        if self.label_prefix.trim().is_empty() {
            return Err(ValidationError::EmptyLabelPrefix);
        }
        if self.refresh_interval_secs == 0 {
            return Err(ValidationError::ZeroRefreshInterval);
        }
        self.cache.validate()?;

        RuleTemplate::compile(&self.default_rule, functions)?;
        if let Some(constraints) = &self.constraints {
            Constraint::parse(constraints)?;
        }

        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub max_capacity: u64,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_capacity: DEFAULT_MAX_CAPACITY,
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_capacity == 0 {
            return Err(ValidationError::ZeroCacheCapacity);
        }
        if self.ttl_secs == 0 {
            return Err(ValidationError::ZeroCacheTtl);
        }
        Ok(())
    }

    pub fn build(&self) -> MetadataCache {
        MetadataCache::new(self.max_capacity, Duration::from_secs(self.ttl_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: ProviderConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, ProviderConfig::default());
        assert_eq!(config.label_prefix, "traefik");
        assert!(config.exposed_by_default);
        assert_eq!(config.refresh_interval(), Duration::from_secs(15));
        assert_eq!(config.cache.max_capacity, 10_000);
        assert_eq!(config.cache.ttl_secs, 60);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse() {
        let yaml = r#"
label_prefix: edge
exposed_by_default: false
default_rule: "Host(`{{ normalize .Name }}.internal`)"
constraints: 'Label("team", "payments")'
refresh_interval_secs: 5
cache:
    max_capacity: 100
    ttl_secs: 10
"#;
        let config: ProviderConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.label_prefix, "edge");
        assert!(!config.exposed_by_default);
        assert_eq!(config.constraints.as_deref(), Some(r#"Label("team", "payments")"#));
        assert_eq!(config.cache.max_capacity, 100);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate() {
        let invalid = |f: fn(&mut ProviderConfig)| {
            let mut config = ProviderConfig::default();
            f(&mut config);
            config.validate().unwrap_err()
        };

        assert!(matches!(
            invalid(|c| c.label_prefix = " ".into()),
            ValidationError::EmptyLabelPrefix
        ));
        assert!(matches!(
            invalid(|c| c.refresh_interval_secs = 0),
            ValidationError::ZeroRefreshInterval
        ));
        assert!(matches!(
            invalid(|c| c.cache.max_capacity = 0),
            ValidationError::ZeroCacheCapacity
        ));
        assert!(matches!(
            invalid(|c| c.cache.ttl_secs = 0),
            ValidationError::ZeroCacheTtl
        ));
        assert!(matches!(
            invalid(|c| c.default_rule = "Host(`{{ missing .Name }}`)".into()),
            ValidationError::DefaultRule(TemplateError::UnknownFunction(_))
        ));
        assert!(matches!(
            invalid(|c| c.constraints = Some("Label(".into())),
            ValidationError::Constraints(_)
        ));
    }

    #[test]
    fn test_validate_with_custom_functions() {
        let config = ProviderConfig {
            default_rule: "Host(`{{ .Name | domain }}`)".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let functions = TemplateFunctions::new().with("domain", |args: &[String]| {
            Ok(format!("{}.example.com", args.join("")))
        });
        config.validate_with(&functions).unwrap();
    }
}
