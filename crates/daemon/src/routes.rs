use std::time::Duration;

use axum::extract::{Json, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;
use fleet_common::{
    AcquireLeaseRequest, ControlPlaneError, CreateVolumeRequest, LaunchMachineInput, Lease,
    Machine, MachineState, UpdateHandle, UpdateMachineRequest, Volume, WaitQuery, WaitResponse,
    LEASE_NONCE_HEADER, MAX_WAIT_SECS,
};
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::db;
use crate::error::ApiError;
use crate::AppState;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_WAIT_SECS: u64 = 60;

fn nonce_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(LEASE_NONCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

pub async fn list_machines(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Json<Vec<Machine>> {
    Json(state.registry().read().list(&app_id))
}

pub async fn get_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
) -> Result<Json<Machine>, ApiError> {
    let machine = state.registry().read().get(&machine_id)?.clone();
    Ok(Json(machine))
}

pub async fn launch_machine(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    Json(mut input): Json<LaunchMachineInput>,
) -> Result<Json<Machine>, ApiError> {
    input.app_id = app_id;
    let machine = state.registry().write().launch(input, Utc::now())?;
    db::save_machine(&state.db().lock(), &machine)?;
    info!(machine_id = %machine.id, app = %machine.app_id, image = %machine.config.image, "launched machine");

    state.schedule_settle(
        machine.id.clone(),
        machine.instance_id.clone(),
        MachineState::Started,
    );
    Ok(Json(machine))
}

pub async fn acquire_lease(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Json(request): Json<AcquireLeaseRequest>,
) -> Result<Json<Lease>, ApiError> {
    let renewing = request.nonce.is_some();
    let lease = state
        .registry()
        .write()
        .acquire(&machine_id, &request, Utc::now())?;
    db::save_lease(&state.db().lock(), &lease)?;
    if renewing {
        debug!(machine_id = %machine_id, expires_at = %lease.expires_at, "lease renewed");
    } else {
        info!(machine_id = %machine_id, owner = %lease.owner, ttl = lease.ttl_seconds, "lease granted");
    }
    Ok(Json(lease))
}

pub async fn release_lease(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let Some(nonce) = nonce_header(&headers) else {
        return Ok(StatusCode::OK);
    };
    let released = state.registry().write().release(&machine_id, nonce)?;
    if released {
        db::delete_lease(&state.db().lock(), &machine_id)?;
        info!(machine_id = %machine_id, "lease released");
    }
    Ok(StatusCode::OK)
}

pub async fn update_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<UpdateMachineRequest>,
) -> Result<Json<UpdateHandle>, ApiError> {
    let (handle, machine) = state.registry().write().begin_update(
        &machine_id,
        nonce_header(&headers),
        request.config,
        Utc::now(),
    )?;
    db::save_machine(&state.db().lock(), &machine)?;
    info!(
        machine_id = %machine_id,
        instance_id = %handle.instance_id,
        image = %machine.config.image,
        "replacing machine"
    );

    state.schedule_settle(
        handle.machine_id.clone(),
        handle.instance_id.clone(),
        handle.target_state,
    );
    Ok(Json(handle))
}

pub async fn wait_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<WaitResponse>, ApiError> {
    let timeout = Duration::from_secs(
        query
            .timeout_secs
            .unwrap_or(DEFAULT_WAIT_SECS)
            .min(MAX_WAIT_SECS),
    );
    let deadline = Instant::now() + timeout;
    let mut interval = time::interval(WAIT_POLL_INTERVAL);

    loop {
        interval.tick().await;
        let (instance_id, current) = {
            let registry = state.registry().read();
            let machine = registry.get(&machine_id)?;
            (machine.instance_id.clone(), machine.state)
        };
        if instance_id == query.instance_id {
            if current == query.state {
                return Ok(Json(WaitResponse {
                    machine_id,
                    instance_id,
                    state: current,
                }));
            }
            if current.is_gone() {
                return Err(ControlPlaneError::UnexpectedState {
                    machine_id,
                    state: current.to_string(),
                }
                .into());
            }
        }
        if Instant::now() >= deadline {
            return Err(ControlPlaneError::TimedOut {
                machine_id,
                target: query.state.to_string(),
            }
            .into());
        }
    }
}

pub async fn create_volume(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    Json(request): Json<CreateVolumeRequest>,
) -> Result<Json<Volume>, ApiError> {
    let volume = state
        .registry()
        .write()
        .create_volume(&app_id, request, Utc::now())?;
    db::save_volume(&state.db().lock(), &volume)?;
    info!(volume = %volume.id, name = %volume.name, region = %volume.region, "created volume");
    Ok(Json(volume))
}

pub async fn list_volumes(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Json<Vec<Volume>> {
    Json(state.registry().read().volumes(&app_id))
}

/// Active leases with nonces withheld.
pub async fn list_leases(State(state): State<AppState>) -> Json<Vec<Lease>> {
    let leases = state
        .registry()
        .read()
        .active_leases(Utc::now())
        .into_iter()
        .map(|mut lease| {
            lease.nonce.clear();
            lease
        })
        .collect();
    Json(leases)
}
