//! Lease-coordinated rollout of one machine config across an app's fleet.
//!
//! Every existing machine goes through
//! `Pending -> Leased -> Updating -> Converged -> Released`, or ends in
//! `Failed`. A lease that was granted is released exactly once on every path.
//! An empty fleet is bootstrapped with a single launch and no lease.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use fleet_common::{
    ControlPlaneError, LaunchMachineInput, Machine, MachineConfig, DEFAULT_LEASE_TTL_SECS,
};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::control_plane::ControlPlane;
use crate::error::FleetError;
use crate::lease::{HeldLease, HoldError};
use crate::snapshot::FleetSnapshot;

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStage {
    Pending,
    Leased,
    Updating,
    Converged,
    Released,
    Failed,
}

impl fmt::Display for MachineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MachineStage::Pending => "pending",
            MachineStage::Leased => "leased",
            MachineStage::Updating => "updating",
            MachineStage::Converged => "converged",
            MachineStage::Released => "released",
            MachineStage::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub lease_ttl: Duration,
    pub wait_timeout: Duration,
    /// Per-machine state machines allowed in flight. 1 is the sequential rollout.
    pub concurrency: usize,
    /// Re-check that a machine still exists right before leasing it.
    pub revalidate_membership: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            concurrency: 1,
            revalidate_membership: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MachineFailure {
    pub machine_id: String,
    /// Last stage the machine reached before failing.
    pub stage: MachineStage,
    pub cause: FleetError,
}

/// Outcome of one `apply_fleet_update` call.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    /// Machines now running the plan, in snapshot order.
    pub updated: Vec<String>,
    pub failed_at: Option<String>,
    pub failed_stage: Option<MachineStage>,
    pub cause: Option<FleetError>,
    /// Every failure seen. More than one only with concurrency above 1.
    pub failures: Vec<MachineFailure>,
    /// Machines never reached because the run stopped early.
    pub untouched: Vec<String>,
    /// Set when the run bootstrapped an empty fleet.
    pub launched: Option<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.cause.is_none()
    }

    fn record_failure(&mut self, failure: MachineFailure) {
        if self.cause.is_none() {
            self.failed_at = Some(failure.machine_id.clone());
            self.failed_stage = Some(failure.stage);
            self.cause = Some(failure.cause.clone());
        }
        self.failures.push(failure);
    }
}

struct MachineOutcome {
    index: usize,
    machine_id: String,
    stage: MachineStage,
    error: Option<FleetError>,
}

/// Everything one per-machine state machine needs. Owns no shared mutable state.
#[derive(Clone)]
struct MachineRun {
    control_plane: Arc<dyn ControlPlane>,
    plan: Arc<MachineConfig>,
    config: OrchestratorConfig,
    cancel: CancellationToken,
}

impl MachineRun {
    async fn execute(self, index: usize, mut machine: Machine) -> MachineOutcome {
        let machine_id = machine.id.clone();
        let mut stage = MachineStage::Pending;
        let result = self.drive(&mut machine, &mut stage).await;
        if let Err(err) = &result {
            error!(machine_id = %machine_id, stage = %stage, error = %err, "machine update failed");
        }
        MachineOutcome {
            index,
            machine_id,
            stage,
            error: result.err(),
        }
    }

    async fn drive(&self, machine: &mut Machine, stage: &mut MachineStage) -> Result<(), FleetError> {
        let machine_id = machine.id.clone();
        if self.cancel.is_cancelled() {
            return Err(FleetError::Cancelled {
                machine_id: Some(machine_id),
            });
        }

        if self.config.revalidate_membership {
            let current = self
                .control_plane
                .get(&machine_id)
                .await
                .map_err(|e| FleetError::machine(&machine_id, *stage, e))?;
            if current.state.is_gone() {
                return Err(FleetError::machine(
                    &machine_id,
                    *stage,
                    ControlPlaneError::NotFound(machine_id.clone()),
                ));
            }
        }

        let mut lease = HeldLease::acquire(
            Arc::clone(&self.control_plane),
            &machine_id,
            self.config.lease_ttl,
        )
        .await
        .map_err(|e| FleetError::machine(&machine_id, *stage, e))?;
        *stage = MachineStage::Leased;
        machine.lease = Some(lease.lease().clone());

        if self.cancel.is_cancelled() {
            lease.release().await;
            machine.lease = None;
            return Err(FleetError::Cancelled {
                machine_id: Some(machine_id),
            });
        }

        let result = self.update_and_wait(&mut lease, stage).await;

        // Released on every path once acquired; the outcome of the update wins.
        lease.release().await;
        machine.lease = None;
        result?;
        *stage = MachineStage::Released;
        info!(machine_id = %machine_id, "machine updated");
        Ok(())
    }

    async fn update_and_wait(
        &self,
        lease: &mut HeldLease,
        stage: &mut MachineStage,
    ) -> Result<(), FleetError> {
        let machine_id = lease.machine_id().to_string();
        info!(machine_id = %machine_id, image = %self.plan.image, "updating machine");
        let handle = self
            .control_plane
            .update(&machine_id, &self.plan, lease.nonce())
            .await
            .map_err(|e| FleetError::machine(&machine_id, *stage, e))?;
        *stage = MachineStage::Updating;

        info!(
            machine_id = %machine_id,
            instance_id = %handle.instance_id,
            target = %handle.target_state,
            "waiting for machine to converge"
        );
        let wait = self.control_plane.wait(&handle, self.config.wait_timeout);
        let state = match lease.hold_while(wait, &self.cancel).await {
            Ok(state) => state,
            Err(HoldError::Operation(e)) | Err(HoldError::Renewal(e)) => {
                return Err(FleetError::machine(&machine_id, *stage, e));
            }
            Err(HoldError::Cancelled) => {
                return Err(FleetError::Cancelled {
                    machine_id: Some(machine_id),
                });
            }
        };
        if !state.is_converged() {
            return Err(FleetError::machine(
                &machine_id,
                *stage,
                ControlPlaneError::UnexpectedState {
                    machine_id: machine_id.clone(),
                    state: state.to_string(),
                },
            ));
        }
        *stage = MachineStage::Converged;
        Ok(())
    }
}

/// Applies an Update Plan to every machine of an app.
pub struct FleetOrchestrator {
    control_plane: Arc<dyn ControlPlane>,
    config: OrchestratorConfig,
}

impl fmt::Debug for FleetOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FleetOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FleetOrchestrator {
    pub fn new(control_plane: Arc<dyn ControlPlane>, config: OrchestratorConfig) -> Self {
        Self {
            control_plane,
            config,
        }
    }

    /// Roll `plan` out to `app_id`.
    ///
    /// `Err` is returned only for failures that happen before any machine is
    /// touched: an invalid plan or a failed snapshot fetch. Everything else,
    /// including cancellation, is reported in the [`RunResult`].
    #[instrument(skip(self, plan, cancel), fields(image = %plan.image))]
    pub async fn apply_fleet_update(
        &self,
        app_id: &str,
        region: &str,
        plan: MachineConfig,
        cancel: CancellationToken,
    ) -> Result<RunResult, FleetError> {
        plan.validate()
            .map_err(|reason| FleetError::InvalidPlan(crate::error::PlanError::Invalid(reason)))?;

        let snapshot = FleetSnapshot::fetch(self.control_plane.as_ref(), app_id).await?;
        info!(machines = snapshot.len(), "fetched fleet snapshot");

        if snapshot.is_empty() {
            return Ok(self.bootstrap(app_id, region, plan, &cancel).await);
        }
        Ok(self.roll(snapshot, plan, cancel).await)
    }

    async fn bootstrap(
        &self,
        app_id: &str,
        region: &str,
        plan: MachineConfig,
        cancel: &CancellationToken,
    ) -> RunResult {
        let mut result = RunResult::default();
        if cancel.is_cancelled() {
            result.cause = Some(FleetError::Cancelled { machine_id: None });
            return result;
        }

        info!(image = %plan.image, region, "no machines yet, launching the first one");
        let input = LaunchMachineInput {
            app_id: app_id.to_string(),
            name: None,
            region: region.to_string(),
            config: plan,
        };
        match self.control_plane.launch(&input).await {
            Ok(machine) => {
                info!(machine_id = %machine.id, "launched machine");
                result.updated.push(machine.id.clone());
                result.launched = Some(machine.id);
            }
            Err(err) => {
                error!(error = %err, "launch failed");
                result.cause = Some(FleetError::Launch(err));
            }
        }
        result
    }

    /// Dispatch per-machine state machines in snapshot order, at most
    /// `concurrency` at a time. The first failure (or cancellation) stops
    /// dispatch; whatever is already in flight runs to completion.
    async fn roll(
        &self,
        snapshot: FleetSnapshot,
        plan: MachineConfig,
        cancel: CancellationToken,
    ) -> RunResult {
        let run = MachineRun {
            control_plane: Arc::clone(&self.control_plane),
            plan: Arc::new(plan),
            config: self.config.clone(),
            cancel: cancel.clone(),
        };
        let limit = self.config.concurrency.max(1);
        let total = snapshot.len();

        let mut queue = snapshot.machines.into_iter().enumerate();
        let mut in_flight = FuturesUnordered::new();
        let mut updated: Vec<(usize, String)> = Vec::with_capacity(total);
        let mut result = RunResult::default();
        let mut aborted = false;

        loop {
            while !aborted && in_flight.len() < limit {
                if cancel.is_cancelled() {
                    aborted = true;
                    break;
                }
                let Some((index, machine)) = queue.next() else {
                    break;
                };
                info!(machine_id = %machine.id, position = index + 1, total, "starting machine");
                in_flight.push(run.clone().execute(index, machine));
            }

            let Some(outcome) = in_flight.next().await else {
                break;
            };
            match outcome.error {
                None => updated.push((outcome.index, outcome.machine_id)),
                Some(cause) => {
                    if !aborted {
                        warn!(machine_id = %outcome.machine_id, "stopping rollout after failure");
                    }
                    aborted = true;
                    result.record_failure(MachineFailure {
                        machine_id: outcome.machine_id,
                        stage: outcome.stage,
                        cause,
                    });
                }
            }
        }

        updated.sort_by_key(|(index, _)| *index);
        result.updated = updated.into_iter().map(|(_, id)| id).collect();
        result.untouched = queue.map(|(_, m)| m.id).collect();
        if result.cause.is_none() && !result.untouched.is_empty() {
            result.cause = Some(FleetError::Cancelled { machine_id: None });
        }

        if result.is_success() {
            info!(updated = result.updated.len(), "rollout complete");
        } else {
            warn!(
                updated = result.updated.len(),
                untouched = result.untouched.len(),
                failed_at = result.failed_at.as_deref().unwrap_or("-"),
                "rollout stopped"
            );
        }
        result
    }
}
