use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::machine::{MachineConfig, MachineState};

/// Header carrying the lease nonce on mutating calls.
pub const LEASE_NONCE_HEADER: &str = "fleet-lease-nonce";

/// Longest single wait the control plane serves; longer budgets are split by the caller.
pub const MAX_WAIT_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireLeaseRequest {
    pub ttl_seconds: Option<u64>,
    pub owner: Option<String>,
    /// Present when renewing a lease this caller already holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMachineRequest {
    pub config: MachineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchMachineInput {
    pub app_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub region: String,
    pub config: MachineConfig,
}

/// In-flight change returned by an accepted update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateHandle {
    pub machine_id: String,
    /// Instance that will carry the new config once converged.
    pub instance_id: String,
    /// State the machine is expected to settle in.
    pub target_state: MachineState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitQuery {
    pub instance_id: String,
    pub state: MachineState,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitResponse {
    pub machine_id: String,
    pub instance_id: String,
    pub state: MachineState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub app_id: String,
    pub name: String,
    pub region: String,
    pub size_gb: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub region: String,
    #[serde(default)]
    pub size_gb: Option<u32>,
}
