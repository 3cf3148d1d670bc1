use chrono::{DateTime, Utc};
use fleet_common::Machine;

use crate::control_plane::ControlPlane;
use crate::error::FleetError;

/// The machines of one app as seen at the start of a run.
///
/// Never refreshed mid-run: machines created or destroyed by someone else
/// after `taken_at` are not reconciled in the same pass.
#[derive(Debug, Clone)]
pub struct FleetSnapshot {
    pub app_id: String,
    pub machines: Vec<Machine>,
    pub taken_at: DateTime<Utc>,
}

impl FleetSnapshot {
    pub async fn fetch(control_plane: &dyn ControlPlane, app_id: &str) -> Result<Self, FleetError> {
        let machines = control_plane
            .list(app_id)
            .await
            .map_err(|source| FleetError::Snapshot {
                app_id: app_id.to_string(),
                source,
            })?;
        Ok(Self::from_machines(app_id, machines))
    }

    /// Machines already on their way out are not update targets.
    pub fn from_machines(app_id: &str, machines: Vec<Machine>) -> Self {
        let machines = machines
            .into_iter()
            .filter(|m| m.app_id == app_id && !m.state.is_gone())
            .collect();
        Self {
            app_id: app_id.to_string(),
            machines,
            taken_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::{MachineConfig, MachineState};

    fn machine(id: &str, app: &str, state: MachineState) -> Machine {
        let now = Utc::now();
        Machine {
            id: id.into(),
            name: id.into(),
            app_id: app.into(),
            instance_id: format!("{id}-i1"),
            state,
            region: "local".into(),
            image_ref: Default::default(),
            config: MachineConfig::default(),
            created_at: now,
            updated_at: now,
            lease: None,
        }
    }

    #[test]
    fn keeps_order_and_drops_departing_machines() {
        let snapshot = FleetSnapshot::from_machines(
            "web",
            vec![
                machine("m2", "web", MachineState::Started),
                machine("m9", "web", MachineState::Destroying),
                machine("m1", "web", MachineState::Stopped),
                machine("x1", "other", MachineState::Started),
            ],
        );
        let ids: Vec<&str> = snapshot.machines.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
        assert_eq!(snapshot.machines[1].state, MachineState::Stopped);
    }
}
