//! Operator side of the fleet control plane: the HTTP [`ControlPlane`]
//! implementation used by `fleetctl`, and run reporting.
//!
//! [`ControlPlane`]: fleet_orchestrator::ControlPlane

pub mod api;
pub mod report;

pub use api::HttpControlPlane;
pub use report::RunReport;
