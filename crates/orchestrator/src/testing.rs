//! In-memory control plane for exercising the orchestrator without a network.
//!
//! Enforces the same lease rules as the real control plane and records every
//! call so tests can assert on ordering.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleet_common::{
    ControlPlaneError, LaunchMachineInput, Lease, Machine, MachineConfig, MachineImageRef,
    MachineState, UpdateHandle,
};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::control_plane::ControlPlane;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    List(String),
    Get(String),
    Acquire(String),
    Renew(String),
    Update(String),
    Wait(String),
    Release(String),
    Launch(String),
}

impl Call {
    pub fn machine_id(&self) -> &str {
        match self {
            Call::List(id)
            | Call::Get(id)
            | Call::Acquire(id)
            | Call::Renew(id)
            | Call::Update(id)
            | Call::Wait(id)
            | Call::Release(id)
            | Call::Launch(id) => id,
        }
    }
}

#[derive(Default)]
struct MockState {
    machines: Vec<Machine>,
    leases: HashMap<String, Lease>,
    calls: Vec<Call>,
    list_failure: Option<ControlPlaneError>,
    launch_failure: Option<ControlPlaneError>,
    get_failures: HashMap<String, ControlPlaneError>,
    update_failures: HashMap<String, ControlPlaneError>,
    wait_failures: HashMap<String, ControlPlaneError>,
    release_failures: HashMap<String, ControlPlaneError>,
    settle_states: HashMap<String, MachineState>,
    wait_delay: Option<Duration>,
}

#[derive(Default)]
pub struct MockControlPlane {
    state: Mutex<MockState>,
}

impl std::fmt::Debug for MockControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockControlPlane").finish_non_exhaustive()
    }
}

pub fn machine(app_id: &str, id: &str, state: MachineState) -> Machine {
    let now = Utc::now();
    Machine {
        id: id.to_string(),
        name: id.to_string(),
        app_id: app_id.to_string(),
        instance_id: Uuid::new_v4().to_string(),
        state,
        region: "local".to_string(),
        image_ref: MachineImageRef::parse("app:v1"),
        config: MachineConfig {
            image: "app:v1".to_string(),
            ..Default::default()
        },
        created_at: now,
        updated_at: now,
        lease: None,
    }
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock with started machines `ids` belonging to `app_id`.
    pub fn with_machines(app_id: &str, ids: &[&str]) -> Self {
        let mock = Self::new();
        for id in ids {
            mock.add_machine(machine(app_id, id, MachineState::Started));
        }
        mock
    }

    pub fn add_machine(&self, machine: Machine) {
        self.state.lock().machines.push(machine);
    }

    /// Simulate another operator holding a valid lease on `machine_id`.
    pub fn lease_to_other(&self, machine_id: &str, owner: &str) {
        let lease = Lease::new(machine_id, Uuid::new_v4().to_string(), owner, 300, Utc::now());
        self.state.lock().leases.insert(machine_id.to_string(), lease);
    }

    /// Drop a held lease as if its TTL ran out and someone else took over.
    pub fn steal_lease(&self, machine_id: &str) {
        self.lease_to_other(machine_id, "intruder");
    }

    pub fn remove_machine(&self, machine_id: &str) {
        self.state.lock().machines.retain(|m| m.id != machine_id);
    }

    pub fn fail_list(&self, err: ControlPlaneError) {
        self.state.lock().list_failure = Some(err);
    }

    pub fn fail_launch(&self, err: ControlPlaneError) {
        self.state.lock().launch_failure = Some(err);
    }

    pub fn fail_get(&self, machine_id: &str, err: ControlPlaneError) {
        self.state.lock().get_failures.insert(machine_id.to_string(), err);
    }

    pub fn fail_update(&self, machine_id: &str, err: ControlPlaneError) {
        self.state.lock().update_failures.insert(machine_id.to_string(), err);
    }

    pub fn fail_wait(&self, machine_id: &str, err: ControlPlaneError) {
        self.state.lock().wait_failures.insert(machine_id.to_string(), err);
    }

    pub fn fail_release(&self, machine_id: &str, err: ControlPlaneError) {
        self.state.lock().release_failures.insert(machine_id.to_string(), err);
    }

    /// State reported by `wait` for `machine_id` instead of the handle's target.
    pub fn settle_as(&self, machine_id: &str, state: MachineState) {
        self.state.lock().settle_states.insert(machine_id.to_string(), state);
    }

    /// Make every `wait` take this long to converge.
    pub fn set_wait_delay(&self, delay: Duration) {
        self.state.lock().wait_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn calls_for(&self, machine_id: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.machine_id() == machine_id)
            .collect()
    }

    pub fn machine(&self, machine_id: &str) -> Option<Machine> {
        self.state
            .lock()
            .machines
            .iter()
            .find(|m| m.id == machine_id)
            .cloned()
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.state.lock().machines.clone()
    }

    /// Leases still valid right now.
    pub fn active_leases(&self) -> Vec<Lease> {
        let now = Utc::now();
        self.state
            .lock()
            .leases
            .values()
            .filter(|l| l.is_valid_at(now))
            .cloned()
            .collect()
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn list(&self, app_id: &str) -> Result<Vec<Machine>, ControlPlaneError> {
        self.record(Call::List(app_id.to_string()));
        let state = self.state.lock();
        if let Some(err) = &state.list_failure {
            return Err(err.clone());
        }
        Ok(state
            .machines
            .iter()
            .filter(|m| m.app_id == app_id)
            .cloned()
            .collect())
    }

    async fn get(&self, machine_id: &str) -> Result<Machine, ControlPlaneError> {
        self.record(Call::Get(machine_id.to_string()));
        let state = self.state.lock();
        if let Some(err) = state.get_failures.get(machine_id) {
            return Err(err.clone());
        }
        state
            .machines
            .iter()
            .find(|m| m.id == machine_id)
            .cloned()
            .ok_or_else(|| ControlPlaneError::NotFound(machine_id.to_string()))
    }

    async fn acquire_lease(
        &self,
        machine_id: &str,
        ttl: Duration,
    ) -> Result<Lease, ControlPlaneError> {
        self.record(Call::Acquire(machine_id.to_string()));
        let now = Utc::now();
        let mut state = self.state.lock();
        if !state.machines.iter().any(|m| m.id == machine_id) {
            return Err(ControlPlaneError::NotFound(machine_id.to_string()));
        }
        if let Some(held) = state.leases.get(machine_id) {
            if held.is_valid_at(now) {
                return Err(ControlPlaneError::Conflict {
                    machine_id: machine_id.to_string(),
                    owner: Some(held.owner.clone()),
                });
            }
        }
        let lease = Lease::new(
            machine_id,
            Uuid::new_v4().to_string(),
            "mock",
            ttl.as_secs(),
            now,
        );
        state.leases.insert(machine_id.to_string(), lease.clone());
        Ok(lease)
    }

    async fn renew_lease(
        &self,
        machine_id: &str,
        nonce: &str,
        ttl: Duration,
    ) -> Result<Lease, ControlPlaneError> {
        self.record(Call::Renew(machine_id.to_string()));
        let mut state = self.state.lock();
        match state.leases.get_mut(machine_id) {
            Some(lease) if lease.held_by(nonce) => {
                lease.extend(ttl.as_secs(), Utc::now());
                Ok(lease.clone())
            }
            Some(lease) => Err(ControlPlaneError::Conflict {
                machine_id: machine_id.to_string(),
                owner: Some(lease.owner.clone()),
            }),
            None => Err(ControlPlaneError::Unauthorized {
                machine_id: machine_id.to_string(),
                reason: "no lease to renew".to_string(),
            }),
        }
    }

    async fn update(
        &self,
        machine_id: &str,
        config: &MachineConfig,
        nonce: &str,
    ) -> Result<UpdateHandle, ControlPlaneError> {
        self.record(Call::Update(machine_id.to_string()));
        let now = Utc::now();
        let mut state = self.state.lock();
        if let Some(err) = state.update_failures.get(machine_id) {
            return Err(err.clone());
        }
        let authorized = state
            .leases
            .get(machine_id)
            .is_some_and(|l| l.held_by(nonce) && l.is_valid_at(now));
        if !authorized {
            return Err(ControlPlaneError::Unauthorized {
                machine_id: machine_id.to_string(),
                reason: "nonce does not match the current lease".to_string(),
            });
        }
        config.validate().map_err(ControlPlaneError::InvalidConfig)?;

        let machine = state
            .machines
            .iter_mut()
            .find(|m| m.id == machine_id)
            .ok_or_else(|| ControlPlaneError::NotFound(machine_id.to_string()))?;
        let target_state = if machine.state == MachineState::Stopped {
            MachineState::Stopped
        } else {
            MachineState::Started
        };
        machine.config = config.clone();
        machine.image_ref = MachineImageRef::parse(&config.image);
        machine.instance_id = Uuid::new_v4().to_string();
        machine.state = MachineState::Replacing;
        machine.updated_at = now;

        Ok(UpdateHandle {
            machine_id: machine_id.to_string(),
            instance_id: machine.instance_id.clone(),
            target_state,
        })
    }

    async fn wait(
        &self,
        handle: &UpdateHandle,
        timeout: Duration,
    ) -> Result<MachineState, ControlPlaneError> {
        self.record(Call::Wait(handle.machine_id.clone()));
        let (failure, delay) = {
            let state = self.state.lock();
            (
                state.wait_failures.get(&handle.machine_id).cloned(),
                state.wait_delay,
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay.min(timeout)).await;
            if delay > timeout {
                return Err(ControlPlaneError::TimedOut {
                    machine_id: handle.machine_id.clone(),
                    target: handle.target_state.to_string(),
                });
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let mut state = self.state.lock();
        let settled = state
            .settle_states
            .get(&handle.machine_id)
            .copied()
            .unwrap_or(handle.target_state);
        if let Some(machine) = state.machines.iter_mut().find(|m| m.id == handle.machine_id) {
            machine.state = settled;
        }
        Ok(settled)
    }

    async fn release_lease(&self, machine_id: &str, nonce: &str) -> Result<(), ControlPlaneError> {
        self.record(Call::Release(machine_id.to_string()));
        let mut state = self.state.lock();
        if let Some(err) = state.release_failures.get(machine_id) {
            return Err(err.clone());
        }
        if state.leases.get(machine_id).is_some_and(|l| l.held_by(nonce)) {
            state.leases.remove(machine_id);
        }
        Ok(())
    }

    async fn launch(&self, input: &LaunchMachineInput) -> Result<Machine, ControlPlaneError> {
        self.record(Call::Launch(input.config.image.clone()));
        let mut state = self.state.lock();
        if let Some(err) = &state.launch_failure {
            return Err(err.clone());
        }
        input
            .config
            .validate()
            .map_err(ControlPlaneError::InvalidConfig)?;
        let id = format!("m-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let mut machine = machine(&input.app_id, &id, MachineState::Started);
        machine.region = input.region.clone();
        machine.config = input.config.clone();
        machine.image_ref = MachineImageRef::parse(&input.config.image);
        state.machines.push(machine.clone());
        Ok(machine)
    }
}
