use fleet_common::{ControlPlaneError, ErrorKind};
use thiserror::Error;

use crate::orchestrator::MachineStage;

/// Problems with the Update Plan found before anything touches the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("no image given on the command line or in the app config")]
    MissingImage,
    #[error("unknown vm size `{0}`")]
    UnknownVmSize(String),
    #[error("failed to read app config {path}: {message}")]
    Read { path: String, message: String },
    #[error("failed to parse app config: {0}")]
    Parse(String),
    #[error("{0}")]
    Invalid(String),
}

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Stops only the machine it happened on (and, fail-fast, the rest of the queue).
    Machine,
    /// Would fail identically on every machine.
    Run,
}

#[derive(Debug, Clone, Error)]
pub enum FleetError {
    #[error("invalid update plan: {0}")]
    InvalidPlan(#[from] PlanError),
    #[error("failed to fetch machines for app {app_id}: {source}")]
    Snapshot {
        app_id: String,
        #[source]
        source: ControlPlaneError,
    },
    #[error("machine {machine_id} failed while {stage}: {source}")]
    Machine {
        machine_id: String,
        stage: MachineStage,
        #[source]
        source: ControlPlaneError,
    },
    #[error("failed to launch the first machine: {0}")]
    Launch(#[source] ControlPlaneError),
    #[error("run cancelled{}", .machine_id.as_deref().map(|m| format!(" while working on {m}")).unwrap_or_default())]
    Cancelled { machine_id: Option<String> },
}

impl FleetError {
    pub(crate) fn machine(machine_id: &str, stage: MachineStage, source: ControlPlaneError) -> Self {
        FleetError::Machine {
            machine_id: machine_id.to_string(),
            stage,
            source,
        }
    }

    /// The control-plane error kind behind this failure, if there is one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            FleetError::Snapshot { source, .. }
            | FleetError::Machine { source, .. }
            | FleetError::Launch(source) => Some(source.kind()),
            FleetError::InvalidPlan(_) => Some(ErrorKind::InvalidConfig),
            FleetError::Cancelled { .. } => None,
        }
    }

    pub fn scope(&self) -> ErrorScope {
        match self {
            FleetError::Machine { source, .. } => match source {
                ControlPlaneError::InvalidConfig(_) | ControlPlaneError::Transport(_) => {
                    ErrorScope::Run
                }
                _ => ErrorScope::Machine,
            },
            _ => ErrorScope::Run,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FleetError::Cancelled { .. })
    }
}
