use crate::constraints::{Constraint, ConstraintError};
use crate::instance::{HealthState, Instance, LifecycleState};
use labels::DecodeError;
use serde::Deserialize;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid enable label: {0}")]
    Enable(#[from] DecodeError),
}

/// Whether an instance takes part in the cycle, and if not, why.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Disabled,
    NotRunning(LifecycleState),
    Unhealthy(HealthState),
    ConstraintMismatch,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExtraLabels {
    enable: Option<bool>,
}

#[derive(Clone, Debug)]
pub struct InstanceFilter {
    label_prefix: String,
    exposed_by_default: bool,
    constraint: Option<Constraint>,
}

impl InstanceFilter {
    /// Fails when `constraints` is not a valid expression.
    pub fn new(
        label_prefix: &str,
        exposed_by_default: bool,
        constraints: Option<&str>,
    ) -> Result<Self, ConstraintError> {
        let constraint = constraints.map(Constraint::parse).transpose()?;

        Ok(InstanceFilter {
            label_prefix: label_prefix.to_string(),
            exposed_by_default,
            constraint,
        })
    }

    pub fn eligibility(&self, instance: &Instance) -> Result<Eligibility, FilterError> {
        let enable_label = format!("{}.enable", self.label_prefix);
        let extra: ExtraLabels =
            labels::decode(&instance.labels, &self.label_prefix, &[enable_label.as_str()])?;
        if !extra.enable.unwrap_or(self.exposed_by_default) {
            return Ok(Eligibility::Disabled);
        }

        if instance.lifecycle != LifecycleState::Running {
            return Ok(Eligibility::NotRunning(instance.lifecycle));
        }

        match instance.health {
            HealthState::None | HealthState::Healthy => {}
            health => return Ok(Eligibility::Unhealthy(health)),
        }

        if let Some(constraint) = &self.constraint
            && !constraint.matches(&instance.labels)
        {
            return Ok(Eligibility::ConstraintMismatch);
        }

        Ok(Eligibility::Eligible)
    }
}
