//! Types shared by the fleet control plane, its clients and the orchestrator.

pub mod api;
pub mod error;
pub mod lease;
pub mod machine;

pub use api::{
    AcquireLeaseRequest, CreateVolumeRequest, LaunchMachineInput, UpdateHandle,
    UpdateMachineRequest, Volume, WaitQuery, WaitResponse, LEASE_NONCE_HEADER, MAX_WAIT_SECS,
};
pub use error::{ControlPlaneError, ErrorBody, ErrorKind};
pub use lease::{Lease, DEFAULT_LEASE_TTL_SECS};
pub use machine::{
    Machine, MachineConfig, MachineGuest, MachineImageRef, MachineInit, MachineMetrics,
    MachineMount, MachinePort, MachineRestart, MachineService, MachineState, RestartPolicy,
};
