//! Turning an app's declared configuration into the machine config applied
//! to every machine in a run.

use std::collections::BTreeMap;
use std::path::Path;

use fleet_common::{
    MachineConfig, MachineGuest, MachineImageRef, MachineMetrics, MachineMount, MachinePort,
    MachineRestart, MachineService,
};
use serde::Deserialize;

use crate::error::PlanError;

pub const DEFAULT_REGION: &str = "local";

/// Shorthand for a public HTTP(S) service on one internal port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HttpService {
    pub internal_port: u32,
    #[serde(default = "default_force_https")]
    pub force_https: bool,
}

fn default_force_https() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MountConfig {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub size_gb: u32,
    #[serde(default)]
    pub encrypted: bool,
}

/// Contents of an app's `fleet.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    pub app: String,
    #[serde(default)]
    pub primary_region: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub vm_size: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub http_service: Option<HttpService>,
    #[serde(default)]
    pub services: Vec<MachineService>,
    #[serde(default)]
    pub metrics: Option<MachineMetrics>,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    #[serde(default)]
    pub restart: Option<MachineRestart>,
}

impl AppConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, PlanError> {
        toml::from_str(raw).map_err(|e| PlanError::Parse(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let raw = std::fs::read_to_string(path).map_err(|e| PlanError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn region(&self) -> &str {
        self.primary_region.as_deref().unwrap_or(DEFAULT_REGION)
    }
}

/// Expand the `http_service` shorthand into a plain HTTP service on port 80
/// and a TLS-terminated one on port 443.
pub fn expand_http_service(http: &HttpService) -> [MachineService; 2] {
    [
        MachineService {
            protocol: "tcp".into(),
            internal_port: http.internal_port,
            ports: vec![MachinePort {
                port: 80,
                handlers: vec!["http".into()],
                force_https: http.force_https,
            }],
        },
        MachineService {
            protocol: "tcp".into(),
            internal_port: http.internal_port,
            ports: vec![MachinePort {
                port: 443,
                handlers: vec!["http".into(), "tls".into()],
                force_https: false,
            }],
        },
    ]
}

/// Build the Update Plan for a run. `image` overrides the config's own image.
pub fn desired_config(app: &AppConfig, image: Option<&str>) -> Result<MachineConfig, PlanError> {
    let image = image
        .or(app.image.as_deref())
        .filter(|i| !i.trim().is_empty())
        .ok_or(PlanError::MissingImage)?;

    let mut services = Vec::with_capacity(app.services.len() + 2);
    if let Some(http) = &app.http_service {
        services.extend(expand_http_service(http));
    }
    services.extend(app.services.iter().cloned());

    let guest = match &app.vm_size {
        Some(size) => Some(
            MachineGuest::preset(size).ok_or_else(|| PlanError::UnknownVmSize(size.clone()))?,
        ),
        None => None,
    };

    let mounts = app
        .mounts
        .iter()
        .map(|m| MachineMount {
            volume: m.source.clone(),
            path: m.destination.clone(),
            size_gb: m.size_gb,
            encrypted: m.encrypted,
        })
        .collect();

    let mut metadata = BTreeMap::new();
    metadata.insert("fleet_app".to_string(), app.app.clone());

    let config = MachineConfig {
        image: image.to_string(),
        env: app.env.clone(),
        init: Default::default(),
        metadata,
        mounts,
        restart: app.restart.clone().unwrap_or_default(),
        services,
        guest,
        metrics: app.metrics.clone(),
    };
    config.validate().map_err(PlanError::Invalid)?;
    Ok(config)
}

/// Plan that keeps everything about `base` except the image.
pub fn image_update_plan(base: &MachineConfig, image: &str) -> Result<MachineConfig, PlanError> {
    if image.trim().is_empty() {
        return Err(PlanError::MissingImage);
    }
    let mut config = base.clone();
    config.image = image.to_string();
    config.validate().map_err(PlanError::Invalid)?;
    Ok(config)
}

/// Short label used in progress output.
pub fn describe_image(config: &MachineConfig) -> String {
    MachineImageRef::parse(&config.image).full_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::RestartPolicy;

    const APP_TOML: &str = r#"
app = "web"
primary_region = "ams"
image = "web:v1"
vm_size = "shared-cpu-2x"

[env]
LOG_LEVEL = "debug"

[http_service]
internal_port = 8080

[[services]]
protocol = "udp"
internal_port = 5353
ports = [{ port = 53 }]

[metrics]
port = 9091
path = "/metrics"

[[mounts]]
source = "data"
destination = "/data"

[restart]
policy = "on-failure"
max_retries = 5
"#;

    #[test]
    fn http_shorthand_expands_before_explicit_services() {
        let app = AppConfig::from_toml_str(APP_TOML).unwrap();
        let config = desired_config(&app, None).unwrap();

        assert_eq!(config.services.len(), 3);
        assert_eq!(config.services[0].ports[0].port, 80);
        assert!(config.services[0].ports[0].force_https);
        assert_eq!(config.services[1].ports[0].handlers, vec!["http", "tls"]);
        assert_eq!(config.services[1].internal_port, 8080);
        assert_eq!(config.services[2].protocol, "udp");
    }

    #[test]
    fn overlays_env_metrics_mounts_and_guest() {
        let app = AppConfig::from_toml_str(APP_TOML).unwrap();
        let config = desired_config(&app, Some("web:v2")).unwrap();

        assert_eq!(config.image, "web:v2");
        assert_eq!(config.env.get("LOG_LEVEL").map(String::as_str), Some("debug"));
        assert_eq!(config.metrics.as_ref().map(|m| m.port), Some(9091));
        assert_eq!(config.mounts[0].volume, "data");
        assert_eq!(config.mounts[0].path, "/data");
        assert_eq!(config.guest.as_ref().map(|g| g.memory_mb), Some(512));
        assert_eq!(config.restart.policy, RestartPolicy::OnFailure);
        assert_eq!(app.region(), "ams");
    }

    #[test]
    fn missing_image_and_bad_size_are_rejected() {
        let app = AppConfig {
            app: "web".into(),
            ..Default::default()
        };
        assert_eq!(desired_config(&app, None), Err(PlanError::MissingImage));

        let app = AppConfig {
            app: "web".into(),
            vm_size: Some("gigantic".into()),
            ..Default::default()
        };
        assert_eq!(
            desired_config(&app, Some("web:v1")),
            Err(PlanError::UnknownVmSize("gigantic".into()))
        );
    }

    #[test]
    fn service_without_ports_fails_validation() {
        let app = AppConfig::from_toml_str(
            r#"
app = "web"
[[services]]
protocol = "tcp"
internal_port = 8080
"#,
        )
        .unwrap();
        assert!(matches!(
            desired_config(&app, Some("web:v1")),
            Err(PlanError::Invalid(_))
        ));
    }

    #[test]
    fn image_update_keeps_everything_else() {
        let app = AppConfig::from_toml_str(APP_TOML).unwrap();
        let base = desired_config(&app, None).unwrap();
        let next = image_update_plan(&base, "registry.example.com/web:v3").unwrap();
        assert_eq!(next.services, base.services);
        assert_eq!(next.image, "registry.example.com/web:v3");
        assert_eq!(describe_image(&next), "web:v3");
    }
}
