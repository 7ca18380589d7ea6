//! drover.toml application spec parser.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use drover_core::{ApplicationSpec, CheckSpec, PlacementPolicy, ResourceRequirement, epoch_secs};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroverConfig {
    pub application: ApplicationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub id: String,
    pub name: String,
    pub image: String,
    pub instances: u32,
    pub placement: Option<String>,
    pub max_per_host: Option<u32>,
    pub env: Option<HashMap<String, String>>,
    pub resources: Option<ResourcesConfig>,
    pub readiness: Option<CheckConfig>,
    pub health: Option<CheckConfig>,
    pub pre_stop_hooks: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub cpu_cores: Option<u32>,
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    pub endpoint: Option<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub max_attempts: Option<u32>,
    pub initial_delay: Option<String>,
}

impl DroverConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DroverConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Materialize the application spec the controller consumes.
    pub fn to_application_spec(&self) -> anyhow::Result<ApplicationSpec> {
        let app = &self.application;

        let placement = match app.placement.as_deref() {
            None | Some("any") => PlacementPolicy::Any,
            Some("one_per_host") => PlacementPolicy::OnePerHost,
            Some("max_per_host") => PlacementPolicy::MaxPerHost {
                max: app.max_per_host.unwrap_or(1),
            },
            Some(other) => anyhow::bail!("unknown placement policy: {other}"),
        };

        let mut resources = Vec::new();
        if let Some(r) = &app.resources {
            if let Some(cores) = r.cpu_cores {
                resources.push(ResourceRequirement::Cpu { count: cores });
            }
            if let Some(mb) = r.memory_mb {
                resources.push(ResourceRequirement::Memory { size_mb: mb });
            }
        }

        let now = epoch_secs();
        Ok(ApplicationSpec {
            id: app.id.clone(),
            name: app.name.clone(),
            image: app.image.clone(),
            env: app.env.clone().unwrap_or_default(),
            resources,
            placement,
            required_instances: app.instances,
            readiness: check_spec(app.readiness.as_ref()),
            health: check_spec(app.health.as_ref()),
            pre_stop_hooks: app.pre_stop_hooks.clone().unwrap_or_default(),
            created_at: now,
            updated_at: now,
        })
    }
}

fn check_spec(config: Option<&CheckConfig>) -> CheckSpec {
    let defaults = CheckSpec::default();
    let Some(config) = config else {
        return defaults;
    };
    CheckSpec {
        endpoint: config.endpoint.clone().unwrap_or(defaults.endpoint),
        interval: config.interval.clone().unwrap_or(defaults.interval),
        timeout: config.timeout.clone().unwrap_or(defaults.timeout),
        max_attempts: config.max_attempts.unwrap_or(defaults.max_attempts),
        initial_delay: config.initial_delay.clone().or(defaults.initial_delay),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let config: DroverConfig = toml::from_str(
            r#"
            [application]
            id = "web"
            name = "web"
            image = "registry/web:1.0"
            instances = 2
            placement = "one_per_host"

            [application.resources]
            cpu_cores = 1
            memory_mb = 256
            "#,
        )
        .unwrap();

        let spec = config.to_application_spec().unwrap();
        assert_eq!(spec.id, "web");
        assert_eq!(spec.required_instances, 2);
        assert_eq!(spec.placement, PlacementPolicy::OnePerHost);
        assert_eq!(spec.resources.len(), 2);
    }

    #[test]
    fn rejects_unknown_placement() {
        let config: DroverConfig = toml::from_str(
            r#"
            [application]
            id = "web"
            name = "web"
            image = "registry/web:1.0"
            instances = 1
            placement = "wat"
            "#,
        )
        .unwrap();
        assert!(config.to_application_spec().is_err());
    }
}
