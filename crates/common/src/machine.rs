use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lease::Lease;

pub const MEMORY_MB_PER_SHARED_CPU: u32 = 256;
pub const MEMORY_MB_PER_CPU: u32 = 2048;

/// Lifecycle state of a machine, owned by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Replacing,
    Destroying,
    Destroyed,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Created => "created",
            MachineState::Starting => "starting",
            MachineState::Started => "started",
            MachineState::Stopping => "stopping",
            MachineState::Stopped => "stopped",
            MachineState::Replacing => "replacing",
            MachineState::Destroying => "destroying",
            MachineState::Destroyed => "destroyed",
        }
    }

    /// States an update may legitimately settle in.
    pub fn is_converged(&self) -> bool {
        matches!(self, MachineState::Started | MachineState::Stopped)
    }

    pub fn is_gone(&self) -> bool {
        matches!(self, MachineState::Destroying | MachineState::Destroyed)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => MachineState::Created,
            "starting" => MachineState::Starting,
            "started" => MachineState::Started,
            "stopping" => MachineState::Stopping,
            "stopped" => MachineState::Stopped,
            "replacing" => MachineState::Replacing,
            "destroying" => MachineState::Destroying,
            "destroyed" => MachineState::Destroyed,
            other => return Err(format!("unknown machine state `{other}`")),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineImageRef {
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl MachineImageRef {
    /// Split an image reference such as `registry.example/app:v2` into its parts.
    pub fn parse(image: &str) -> Self {
        let (name, digest) = match image.split_once('@') {
            Some((name, digest)) => (name, digest.to_string()),
            None => (image, String::new()),
        };
        // A colon after the last slash is a tag, anything before is a registry port.
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (path, tag) = match name[last_slash..].rfind(':') {
            Some(i) => (&name[..last_slash + i], name[last_slash + i + 1..].to_string()),
            None => (name, String::from("latest")),
        };
        let (registry, repository) = match path.split_once('/') {
            Some((head, rest)) if head.contains('.') || head.contains(':') || head == "localhost" => {
                (head.to_string(), rest.to_string())
            }
            _ => (String::new(), path.to_string()),
        };
        Self {
            registry,
            repository,
            tag,
            digest,
            labels: BTreeMap::new(),
        }
    }

    pub fn full_ref(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineGuest {
    pub cpu_kind: String,
    pub cpus: u32,
    pub memory_mb: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kernel_args: Vec<String>,
}

impl MachineGuest {
    /// Resolve a named size such as `shared-cpu-2x` to guest resources.
    pub fn preset(name: &str) -> Option<Self> {
        let (kind, rest) = if let Some(rest) = name.strip_prefix("shared-cpu-") {
            ("shared", rest)
        } else if let Some(rest) = name.strip_prefix("dedicated-cpu-") {
            ("dedicated", rest)
        } else {
            return None;
        };
        let cpus: u32 = rest.strip_suffix('x')?.parse().ok()?;
        if !matches!(cpus, 1 | 2 | 4 | 8) {
            return None;
        }
        let per_cpu = if kind == "shared" {
            MEMORY_MB_PER_SHARED_CPU
        } else {
            MEMORY_MB_PER_CPU
        };
        Some(Self {
            cpu_kind: kind.to_string(),
            cpus,
            memory_mb: cpus * per_cpu,
            kernel_args: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachinePort {
    pub port: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_https: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineService {
    pub protocol: String,
    pub internal_port: u32,
    #[serde(default)]
    pub ports: Vec<MachinePort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineMount {
    pub volume: String,
    pub path: String,
    #[serde(default)]
    pub size_gb: u32,
    #[serde(default)]
    pub encrypted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    OnFailure,
    #[default]
    Always,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRestart {
    #[serde(default)]
    pub policy: RestartPolicy,
    /// Only meaningful with [`RestartPolicy::OnFailure`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineMetrics {
    pub port: u32,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInit {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exec: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub tty: bool,
}

/// Desired state of a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub init: MachineInit,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MachineMount>,
    #[serde(default)]
    pub restart: MachineRestart,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<MachineService>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest: Option<MachineGuest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MachineMetrics>,
}

impl MachineConfig {
    /// Structural checks that need no knowledge of the fleet.
    ///
    /// Returns a human readable reason on the first violation. Region checks
    /// on mounts are left to the control plane, which knows where volumes live.
    pub fn validate(&self) -> Result<(), String> {
        if self.image.trim().is_empty() {
            return Err("image reference is empty".into());
        }
        if let Some(key) = self.env.keys().find(|k| k.trim().is_empty()) {
            return Err(format!("environment variable name `{key}` is empty"));
        }
        for service in &self.services {
            if service.internal_port == 0 || service.internal_port > 65535 {
                return Err(format!(
                    "service internal port {} is out of range",
                    service.internal_port
                ));
            }
            if service.ports.is_empty() {
                return Err(format!(
                    "service on internal port {} declares no exposed ports",
                    service.internal_port
                ));
            }
            if let Some(port) = service
                .ports
                .iter()
                .find(|p| p.port == 0 || p.port > 65535)
            {
                return Err(format!("exposed port {} is out of range", port.port));
            }
        }
        if self.restart.max_retries.is_some() && self.restart.policy != RestartPolicy::OnFailure {
            return Err("restart max_retries requires the on-failure policy".into());
        }
        for mount in &self.mounts {
            if mount.volume.trim().is_empty() {
                return Err(format!("mount at {} names no volume", mount.path));
            }
            if !mount.path.starts_with('/') {
                return Err(format!("mount path `{}` must be absolute", mount.path));
            }
        }
        if let Some(guest) = &self.guest {
            if guest.cpus == 0 || guest.memory_mb == 0 {
                return Err("guest must have at least one cpu and some memory".into());
            }
        }
        Ok(())
    }
}

/// One VM instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub app_id: String,
    /// Changes every time the underlying instance is replaced.
    pub instance_id: String,
    pub state: MachineState,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub image_ref: MachineImageRef,
    pub config: MachineConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Only set on a copy held by the party that owns the lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}
