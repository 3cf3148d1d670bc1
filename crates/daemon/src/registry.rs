//! In-memory view of the control plane: machines, their leases and volumes.
//!
//! All lease rules live here so they can be tested without HTTP or SQLite.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fleet_common::{
    AcquireLeaseRequest, ControlPlaneError, CreateVolumeRequest, LaunchMachineInput, Lease,
    Machine, MachineConfig, MachineImageRef, MachineState, UpdateHandle, Volume,
    DEFAULT_LEASE_TTL_SECS,
};
use uuid::Uuid;

pub const MAX_LEASE_TTL_SECS: u64 = 3600;
const DEFAULT_OWNER: &str = "anonymous";
const DEFAULT_VOLUME_SIZE_GB: u32 = 1;

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..14].to_string()
}

#[derive(Debug, Default)]
pub struct Registry {
    machines: HashMap<String, Machine>,
    leases: HashMap<String, Lease>,
    volumes: HashMap<String, Volume>,
}

impl Registry {
    pub fn from_parts(machines: Vec<Machine>, leases: Vec<Lease>, volumes: Vec<Volume>) -> Self {
        Self {
            machines: machines.into_iter().map(|m| (m.id.clone(), m)).collect(),
            leases: leases
                .into_iter()
                .map(|l| (l.machine_id.clone(), l))
                .collect(),
            volumes: volumes.into_iter().map(|v| (v.id.clone(), v)).collect(),
        }
    }

    /// Machines of `app_id`, oldest first.
    pub fn list(&self, app_id: &str) -> Vec<Machine> {
        let mut machines: Vec<Machine> = self
            .machines
            .values()
            .filter(|m| m.app_id == app_id)
            .cloned()
            .collect();
        machines.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        machines
    }

    pub fn get(&self, machine_id: &str) -> Result<&Machine, ControlPlaneError> {
        self.machines
            .get(machine_id)
            .ok_or_else(|| ControlPlaneError::NotFound(machine_id.to_string()))
    }

    /// Valid leases, nonces included.
    pub fn active_leases(&self, now: DateTime<Utc>) -> Vec<Lease> {
        let mut leases: Vec<Lease> = self
            .leases
            .values()
            .filter(|l| l.is_valid_at(now))
            .cloned()
            .collect();
        leases.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        leases
    }

    /// Grant or renew a lease.
    ///
    /// Without a nonce this is a fresh acquire and fails while any valid
    /// lease exists. With a nonce it renews, which works as long as nobody
    /// else has taken the machine since, even if our term already lapsed.
    pub fn acquire(
        &mut self,
        machine_id: &str,
        request: &AcquireLeaseRequest,
        now: DateTime<Utc>,
    ) -> Result<Lease, ControlPlaneError> {
        self.get(machine_id)?;
        let ttl = request
            .ttl_seconds
            .unwrap_or(DEFAULT_LEASE_TTL_SECS)
            .clamp(1, MAX_LEASE_TTL_SECS);

        if let Some(held) = self.leases.get_mut(machine_id) {
            let ours = request.nonce.as_deref().is_some_and(|n| held.held_by(n));
            if ours {
                held.extend(ttl, now);
                return Ok(held.clone());
            }
            if held.is_valid_at(now) {
                return Err(ControlPlaneError::Conflict {
                    machine_id: machine_id.to_string(),
                    owner: Some(held.owner.clone()),
                });
            }
        }
        if request.nonce.is_some() {
            // Renewal of a lease that expired and was swept, or never existed.
            return Err(ControlPlaneError::Unauthorized {
                machine_id: machine_id.to_string(),
                reason: "no lease with that nonce to renew".to_string(),
            });
        }

        let owner = request
            .owner
            .clone()
            .filter(|o| !o.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_OWNER.to_string());
        let lease = Lease::new(machine_id, Uuid::new_v4().simple().to_string(), owner, ttl, now);
        self.leases.insert(machine_id.to_string(), lease.clone());
        Ok(lease)
    }

    /// Returns whether a lease was actually dropped. Unknown, expired or
    /// foreign nonces are a successful no-op.
    pub fn release(&mut self, machine_id: &str, nonce: &str) -> Result<bool, ControlPlaneError> {
        self.get(machine_id)?;
        match self.leases.get(machine_id) {
            Some(lease) if lease.held_by(nonce) => {
                self.leases.remove(machine_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn authorize(
        &self,
        machine_id: &str,
        nonce: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), ControlPlaneError> {
        let unauthorized = |reason: &str| ControlPlaneError::Unauthorized {
            machine_id: machine_id.to_string(),
            reason: reason.to_string(),
        };
        let nonce = nonce.ok_or_else(|| unauthorized("missing lease nonce"))?;
        match self.leases.get(machine_id) {
            None => Err(unauthorized("machine is not leased")),
            Some(lease) if !lease.held_by(nonce) => Err(unauthorized("nonce does not match")),
            Some(lease) if !lease.is_valid_at(now) => Err(unauthorized("lease expired")),
            Some(_) => Ok(()),
        }
    }

    /// Every mount must name a volume of the same app in the machine's region.
    fn check_mounts(
        &self,
        app_id: &str,
        region: &str,
        config: &MachineConfig,
    ) -> Result<(), ControlPlaneError> {
        for mount in &config.mounts {
            let found = self.volumes.values().any(|v| {
                v.app_id == app_id
                    && (v.name == mount.volume || v.id == mount.volume)
                    && v.region == region
            });
            if !found {
                return Err(ControlPlaneError::InvalidConfig(format!(
                    "volume `{}` does not exist in region {region}",
                    mount.volume
                )));
            }
        }
        Ok(())
    }

    /// Accept a config change and start replacing the instance. The machine
    /// settles once [`Registry::settle`] is called with the returned handle.
    pub fn begin_update(
        &mut self,
        machine_id: &str,
        nonce: Option<&str>,
        config: MachineConfig,
        now: DateTime<Utc>,
    ) -> Result<(UpdateHandle, Machine), ControlPlaneError> {
        let (app_id, region) = {
            let machine = self.get(machine_id)?;
            (machine.app_id.clone(), machine.region.clone())
        };
        self.authorize(machine_id, nonce, now)?;
        config.validate().map_err(ControlPlaneError::InvalidConfig)?;
        self.check_mounts(&app_id, &region, &config)?;

        let machine = self
            .machines
            .get_mut(machine_id)
            .ok_or_else(|| ControlPlaneError::NotFound(machine_id.to_string()))?;
        let target_state = match machine.state {
            MachineState::Stopped | MachineState::Stopping => MachineState::Stopped,
            _ => MachineState::Started,
        };
        machine.image_ref = MachineImageRef::parse(&config.image);
        machine.config = config;
        machine.instance_id = Uuid::new_v4().to_string();
        machine.state = MachineState::Replacing;
        machine.updated_at = now;

        let handle = UpdateHandle {
            machine_id: machine_id.to_string(),
            instance_id: machine.instance_id.clone(),
            target_state,
        };
        Ok((handle, machine.clone()))
    }

    /// Finish a replacement. Ignored if the instance was replaced again since.
    pub fn settle(
        &mut self,
        machine_id: &str,
        instance_id: &str,
        state: MachineState,
        now: DateTime<Utc>,
    ) -> Option<Machine> {
        let machine = self.machines.get_mut(machine_id)?;
        if machine.instance_id != instance_id {
            return None;
        }
        machine.state = state;
        machine.updated_at = now;
        Some(machine.clone())
    }

    pub fn launch(
        &mut self,
        input: LaunchMachineInput,
        now: DateTime<Utc>,
    ) -> Result<Machine, ControlPlaneError> {
        input
            .config
            .validate()
            .map_err(ControlPlaneError::InvalidConfig)?;
        self.check_mounts(&input.app_id, &input.region, &input.config)?;

        let id = short_id();
        let machine = Machine {
            name: input.name.unwrap_or_else(|| format!("{}-{}", input.app_id, &id[..6])),
            id: id.clone(),
            app_id: input.app_id,
            instance_id: Uuid::new_v4().to_string(),
            state: MachineState::Created,
            region: input.region,
            image_ref: MachineImageRef::parse(&input.config.image),
            config: input.config,
            created_at: now,
            updated_at: now,
            lease: None,
        };
        self.machines.insert(id, machine.clone());
        Ok(machine)
    }

    pub fn create_volume(
        &mut self,
        app_id: &str,
        request: CreateVolumeRequest,
        now: DateTime<Utc>,
    ) -> Result<Volume, ControlPlaneError> {
        if request.name.trim().is_empty() || request.region.trim().is_empty() {
            return Err(ControlPlaneError::InvalidConfig(
                "volume needs a name and a region".to_string(),
            ));
        }
        let duplicate = self
            .volumes
            .values()
            .any(|v| v.app_id == app_id && v.name == request.name && v.region == request.region);
        if duplicate {
            return Err(ControlPlaneError::InvalidConfig(format!(
                "volume `{}` already exists in {}",
                request.name, request.region
            )));
        }
        let volume = Volume {
            id: format!("vol_{}", short_id()),
            app_id: app_id.to_string(),
            name: request.name,
            region: request.region,
            size_gb: request.size_gb.unwrap_or(DEFAULT_VOLUME_SIZE_GB),
            created_at: now,
        };
        self.volumes.insert(volume.id.clone(), volume.clone());
        Ok(volume)
    }

    pub fn volumes(&self, app_id: &str) -> Vec<Volume> {
        let mut volumes: Vec<Volume> = self
            .volumes
            .values()
            .filter(|v| v.app_id == app_id)
            .cloned()
            .collect();
        volumes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        volumes
    }

    /// Drop leases past their expiry. Returns the affected machine ids.
    pub fn expire_leases(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .leases
            .values()
            .filter(|l| !l.is_valid_at(now))
            .map(|l| l.machine_id.clone())
            .collect();
        for id in &expired {
            self.leases.remove(id);
        }
        expired
    }

    /// Machines left mid-transition by a previous run of the daemon.
    pub fn transient_machines(&self) -> Vec<(String, String, MachineState)> {
        self.machines
            .values()
            .filter_map(|m| {
                let target = match m.state {
                    MachineState::Created | MachineState::Starting | MachineState::Replacing => {
                        MachineState::Started
                    }
                    MachineState::Stopping => MachineState::Stopped,
                    _ => return None,
                };
                Some((m.id.clone(), m.instance_id.clone(), target))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fleet_common::MachineMount;

    fn config(image: &str) -> MachineConfig {
        MachineConfig {
            image: image.to_string(),
            ..Default::default()
        }
    }

    fn launched(registry: &mut Registry, now: DateTime<Utc>) -> String {
        registry
            .launch(
                LaunchMachineInput {
                    app_id: "web".into(),
                    name: None,
                    region: "ams".into(),
                    config: config("web:v1"),
                },
                now,
            )
            .unwrap()
            .id
    }

    fn acquire(owner: &str) -> AcquireLeaseRequest {
        AcquireLeaseRequest {
            ttl_seconds: Some(30),
            owner: Some(owner.into()),
            nonce: None,
        }
    }

    #[test]
    fn second_holder_conflicts_until_expiry() {
        let now = Utc::now();
        let mut registry = Registry::default();
        let id = launched(&mut registry, now);

        let first = registry.acquire(&id, &acquire("alice"), now).unwrap();
        let err = registry.acquire(&id, &acquire("bob"), now).unwrap_err();
        assert!(matches!(err, ControlPlaneError::Conflict { owner: Some(ref o), .. } if o == "alice"));

        let later = now + Duration::seconds(31);
        let second = registry.acquire(&id, &acquire("bob"), later).unwrap();
        assert_ne!(first.nonce, second.nonce);
    }

    #[test]
    fn renewal_requires_the_current_nonce() {
        let now = Utc::now();
        let mut registry = Registry::default();
        let id = launched(&mut registry, now);
        let lease = registry.acquire(&id, &acquire("alice"), now).unwrap();

        let renew = AcquireLeaseRequest {
            nonce: Some(lease.nonce.clone()),
            ..acquire("alice")
        };
        let renewed = registry.acquire(&id, &renew, now + Duration::seconds(20)).unwrap();
        assert_eq!(renewed.nonce, lease.nonce);
        assert!(renewed.is_valid_at(now + Duration::seconds(45)));

        let forged = AcquireLeaseRequest {
            nonce: Some("forged".into()),
            ..acquire("mallory")
        };
        assert!(matches!(
            registry.acquire(&id, &forged, now),
            Err(ControlPlaneError::Conflict { .. })
        ));
    }

    #[test]
    fn release_is_idempotent_and_never_drops_foreign_leases() {
        let now = Utc::now();
        let mut registry = Registry::default();
        let id = launched(&mut registry, now);
        let lease = registry.acquire(&id, &acquire("alice"), now).unwrap();

        assert!(!registry.release(&id, "someone-else").unwrap());
        assert_eq!(registry.active_leases(now).len(), 1);
        assert!(registry.release(&id, &lease.nonce).unwrap());
        assert!(!registry.release(&id, &lease.nonce).unwrap());
        assert!(registry.release("nope", &lease.nonce).is_err());
    }

    #[test]
    fn release_after_expiry_is_not_an_error() {
        let now = Utc::now();
        let mut registry = Registry::default();
        let id = launched(&mut registry, now);
        let lease = registry.acquire(&id, &acquire("alice"), now).unwrap();

        assert_eq!(registry.expire_leases(now + Duration::seconds(60)), vec![id.clone()]);
        assert!(!registry.release(&id, &lease.nonce).unwrap());
        assert!(registry.active_leases(now).is_empty());
    }

    #[test]
    fn update_needs_a_valid_matching_nonce() {
        let now = Utc::now();
        let mut registry = Registry::default();
        let id = launched(&mut registry, now);

        let err = registry.begin_update(&id, None, config("web:v2"), now).unwrap_err();
        assert!(matches!(err, ControlPlaneError::Unauthorized { .. }));

        let lease = registry.acquire(&id, &acquire("alice"), now).unwrap();
        let err = registry
            .begin_update(&id, Some("wrong"), config("web:v2"), now)
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::Unauthorized { .. }));

        let expired = now + Duration::seconds(31);
        let err = registry
            .begin_update(&id, Some(&lease.nonce), config("web:v2"), expired)
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::Unauthorized { .. }));

        let before = registry.get(&id).unwrap().instance_id.clone();
        let (handle, machine) = registry
            .begin_update(&id, Some(&lease.nonce), config("web:v2"), now)
            .unwrap();
        assert_ne!(handle.instance_id, before);
        assert_eq!(machine.id, id);
        assert_eq!(machine.state, MachineState::Replacing);

        let settled = registry
            .settle(&id, &handle.instance_id, handle.target_state, now)
            .unwrap();
        assert_eq!(settled.state, MachineState::Started);
        assert!(registry.settle(&id, &before, MachineState::Stopped, now).is_none());
    }

    #[test]
    fn mounts_must_reference_volumes_in_the_same_region() {
        let now = Utc::now();
        let mut registry = Registry::default();
        let id = launched(&mut registry, now);
        let lease = registry.acquire(&id, &acquire("alice"), now).unwrap();

        let mut with_mount = config("web:v2");
        with_mount.mounts.push(MachineMount {
            volume: "data".into(),
            path: "/data".into(),
            size_gb: 1,
            encrypted: false,
        });

        registry
            .create_volume(
                "web",
                CreateVolumeRequest {
                    name: "data".into(),
                    region: "fra".into(),
                    size_gb: None,
                },
                now,
            )
            .unwrap();
        let err = registry
            .begin_update(&id, Some(&lease.nonce), with_mount.clone(), now)
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::InvalidConfig(_)));

        registry
            .create_volume(
                "web",
                CreateVolumeRequest {
                    name: "data".into(),
                    region: "ams".into(),
                    size_gb: Some(3),
                },
                now,
            )
            .unwrap();
        assert!(registry
            .begin_update(&id, Some(&lease.nonce), with_mount, now)
            .is_ok());
    }

    #[test]
    fn expired_leases_are_swept() {
        let now = Utc::now();
        let mut registry = Registry::default();
        let id = launched(&mut registry, now);
        registry.acquire(&id, &acquire("alice"), now).unwrap();

        assert!(registry.expire_leases(now).is_empty());
        assert_eq!(registry.expire_leases(now + Duration::seconds(60)), vec![id]);
    }

    #[test]
    fn launched_machines_start_in_created() {
        let now = Utc::now();
        let mut registry = Registry::default();
        let id = launched(&mut registry, now);
        assert_eq!(registry.get(&id).unwrap().state, MachineState::Created);
        assert_eq!(registry.list("web").len(), 1);
        assert_eq!(registry.transient_machines().len(), 1);
    }
}
