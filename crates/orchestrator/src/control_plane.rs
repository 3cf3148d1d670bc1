use std::time::Duration;

use async_trait::async_trait;
use fleet_common::{
    ControlPlaneError, LaunchMachineInput, Lease, Machine, MachineConfig, MachineState,
    UpdateHandle,
};

/// What the orchestrator needs from the remote machine control plane.
///
/// Implementations are the single source of truth for machine existence and
/// state, and the only arbiter of lease exclusivity.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Current machines of an app. Ordering is not guaranteed across calls.
    async fn list(&self, app_id: &str) -> Result<Vec<Machine>, ControlPlaneError>;

    async fn get(&self, machine_id: &str) -> Result<Machine, ControlPlaneError>;

    /// Fails with `Conflict` if another holder has a valid lease.
    async fn acquire_lease(&self, machine_id: &str, ttl: Duration)
        -> Result<Lease, ControlPlaneError>;

    /// Extend a lease this caller holds. Fails with `Conflict` if someone
    /// else took the machine after our lease lapsed.
    async fn renew_lease(
        &self,
        machine_id: &str,
        nonce: &str,
        ttl: Duration,
    ) -> Result<Lease, ControlPlaneError>;

    /// Submit a config change. Fails with `Unauthorized` on a stale or
    /// missing nonce and `InvalidConfig` when the control plane rejects it.
    async fn update(
        &self,
        machine_id: &str,
        config: &MachineConfig,
        nonce: &str,
    ) -> Result<UpdateHandle, ControlPlaneError>;

    /// Block until the change in `handle` settles or `timeout` elapses.
    async fn wait(
        &self,
        handle: &UpdateHandle,
        timeout: Duration,
    ) -> Result<MachineState, ControlPlaneError>;

    /// Idempotent: releasing a released, expired or foreign lease is not an error.
    async fn release_lease(&self, machine_id: &str, nonce: &str) -> Result<(), ControlPlaneError>;

    /// Not idempotent; a retried launch creates a second machine.
    async fn launch(&self, input: &LaunchMachineInput) -> Result<Machine, ControlPlaneError>;
}
