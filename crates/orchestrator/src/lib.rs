//! Lease-coordinated fleet updates.
//!
//! [`FleetOrchestrator::apply_fleet_update`] takes an Update Plan (see
//! [`plan::desired_config`]), snapshots the app's machines through a
//! [`ControlPlane`], and either launches the first machine or walks every
//! existing one through lease, update, wait and release.

pub mod control_plane;
pub mod error;
pub mod lease;
pub mod orchestrator;
pub mod plan;
pub mod snapshot;
#[cfg(feature = "testing")]
pub mod testing;

pub use control_plane::ControlPlane;
pub use error::{ErrorScope, FleetError, PlanError};
pub use lease::{HeldLease, HoldError};
pub use orchestrator::{
    FleetOrchestrator, MachineFailure, MachineStage, OrchestratorConfig, RunResult,
    DEFAULT_WAIT_TIMEOUT,
};
pub use plan::{desired_config, image_update_plan, AppConfig, HttpService};
pub use snapshot::FleetSnapshot;
pub use tokio_util::sync::CancellationToken;
