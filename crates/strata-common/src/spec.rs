//! The container specification handed to the runtime by its callers.
//!
//! A [`ContainerSpec`] arrives fully populated; the runtime only checks it
//! with [`ContainerSpec::validate`] and never fills in defaults for limits
//! or facets.

use serde::{Deserialize, Serialize};

use crate::constants::{CPU_PERIOD_RANGE_US, CPU_WEIGHT_RANGE, MAX_HOSTNAME_LEN, MAX_LAYERS};
use crate::error::{Result, StrataError};
use crate::types::{CpuLimit, FacetPolicy, IsolationFacets, Layer, ResourceLimits, Stdio, UserMapping};

/// Immutable description of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Read-only layers, lowest precedence first.
    pub layers: Vec<Layer>,
    /// Entrypoint command followed by its arguments.
    pub command: Vec<String>,
    /// Environment variables for the entrypoint.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Private hostname; requires the hostname facet.
    pub hostname: Option<String>,
    /// Resource limits for the container's group.
    pub limits: ResourceLimits,
    /// Namespaces to create.
    pub isolation: IsolationFacets,
    /// What to do when the host cannot grant every requested facet.
    pub facet_policy: FacetPolicy,
    /// Identity mapping; required exactly when the user facet is requested.
    pub user_mapping: Option<UserMapping>,
    /// Where the entrypoint's standard streams go.
    #[serde(default)]
    pub stdio: Stdio,
}

impl ContainerSpec {
    /// Checks the spec for malformed or contradictory fields.
    ///
    /// Runs before any kernel resource is touched.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Validation`] describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        self.validate_layers()?;
        self.validate_command()?;
        self.validate_env()?;
        self.validate_hostname()?;
        self.validate_limits()?;
        self.validate_user_mapping()
    }

    fn validate_layers(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(invalid("at least one layer is required"));
        }
        if self.layers.len() > MAX_LAYERS {
            return Err(invalid(format!(
                "{} layers exceeds the maximum of {MAX_LAYERS}",
                self.layers.len()
            )));
        }
        for layer in &self.layers {
            if !layer.path.is_absolute() {
                return Err(invalid(format!(
                    "layer {} path must be absolute: {}",
                    layer.id,
                    layer.path.display()
                )));
            }
            let text = layer.path.to_string_lossy();
            // Overlay mount options use these as separators.
            if text.contains(':') || text.contains(',') {
                return Err(invalid(format!(
                    "layer {} path contains ':' or ',': {text}",
                    layer.id
                )));
            }
        }
        Ok(())
    }

    fn validate_command(&self) -> Result<()> {
        let Some(program) = self.command.first() else {
            return Err(invalid("entrypoint command is empty"));
        };
        if program.is_empty() {
            return Err(invalid("entrypoint program is an empty string"));
        }
        if self.command.iter().any(|arg| arg.contains('\0')) {
            return Err(invalid("entrypoint arguments must not contain NUL bytes"));
        }
        Ok(())
    }

    fn validate_env(&self) -> Result<()> {
        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(invalid(format!("invalid environment variable name: {key:?}")));
            }
            if value.contains('\0') {
                return Err(invalid(format!("environment variable {key} contains a NUL byte")));
            }
        }
        Ok(())
    }

    fn validate_hostname(&self) -> Result<()> {
        let Some(hostname) = &self.hostname else {
            return Ok(());
        };
        if !self.isolation.hostname {
            return Err(invalid(
                "a hostname is set but the hostname facet is not requested",
            ));
        }
        let well_formed = !hostname.is_empty()
            && hostname.len() <= MAX_HOSTNAME_LEN
            && !hostname.starts_with('-')
            && hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if !well_formed {
            return Err(invalid(format!("invalid hostname: {hostname:?}")));
        }
        Ok(())
    }

    fn validate_limits(&self) -> Result<()> {
        if self.limits.memory_bytes == Some(0) {
            return Err(invalid("memory ceiling must be greater than zero"));
        }
        if self.limits.max_processes == Some(0) {
            return Err(invalid("process-count ceiling must be greater than zero"));
        }
        match self.limits.cpu {
            Some(CpuLimit::Weight(w)) if !(CPU_WEIGHT_RANGE.0..=CPU_WEIGHT_RANGE.1).contains(&w) => {
                Err(invalid(format!(
                    "cpu weight {w} outside {}..={}",
                    CPU_WEIGHT_RANGE.0, CPU_WEIGHT_RANGE.1
                )))
            }
            Some(CpuLimit::Quota {
                quota_us,
                period_us,
            }) => {
                if !(CPU_PERIOD_RANGE_US.0..=CPU_PERIOD_RANGE_US.1).contains(&period_us) {
                    return Err(invalid(format!(
                        "cpu period {period_us}us outside {}..={}",
                        CPU_PERIOD_RANGE_US.0, CPU_PERIOD_RANGE_US.1
                    )));
                }
                if quota_us < CPU_PERIOD_RANGE_US.0 {
                    return Err(invalid(format!(
                        "cpu quota {quota_us}us below the {}us minimum",
                        CPU_PERIOD_RANGE_US.0
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn validate_user_mapping(&self) -> Result<()> {
        match (self.isolation.user, &self.user_mapping) {
            (true, None) => Err(invalid(
                "the user facet is requested but no identity mapping is given",
            )),
            (false, Some(_)) => Err(invalid(
                "an identity mapping is given but the user facet is not requested",
            )),
            (true, Some(mapping)) if mapping.uid.size == 0 || mapping.gid.size == 0 => {
                Err(invalid("identity mapping ranges must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

fn invalid(message: impl Into<String>) -> StrataError {
    StrataError::Validation {
        message: message.into(),
    }
}
