//! Local machine control plane.
//!
//! Serves the list/lease/update/wait/release/launch contract over HTTP,
//! keeps state in memory mirrored to SQLite, and simulates instance
//! replacement with a configurable convergence delay.

pub mod db;
pub mod error;
pub mod registry;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use fleet_common::MachineState;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use tokio::time;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::registry::Registry;

pub const DEFAULT_CONVERGENCE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct Settings {
    /// How long a replaced or launched instance takes to reach its target state.
    pub convergence_delay: Duration,
    /// Cadence of the expired-lease sweeper.
    pub sweep_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            convergence_delay: DEFAULT_CONVERGENCE_DELAY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    registry: Arc<RwLock<Registry>>,
    db: Arc<Mutex<Connection>>,
    settings: Settings,
}

impl AppState {
    /// Load persisted machines, leases and volumes from `conn`.
    pub fn load(conn: Connection, settings: Settings) -> rusqlite::Result<Self> {
        let expired = db::delete_expired(&conn, Utc::now())?;
        if !expired.is_empty() {
            info!(count = expired.len(), "cleaned up expired leases on startup");
        }
        let machines = db::load_machines(&conn)?;
        let leases = db::load_leases(&conn)?;
        let volumes = db::load_volumes(&conn)?;
        info!(
            machines = machines.len(),
            leases = leases.len(),
            volumes = volumes.len(),
            "loaded control plane state"
        );

        Ok(Self {
            registry: Arc::new(RwLock::new(Registry::from_parts(machines, leases, volumes))),
            db: Arc::new(Mutex::new(conn)),
            settings,
        })
    }

    pub(crate) fn registry(&self) -> &RwLock<Registry> {
        &self.registry
    }

    pub(crate) fn db(&self) -> &Mutex<Connection> {
        &self.db
    }

    /// Move a machine to `state` once the convergence delay has passed.
    pub(crate) fn schedule_settle(&self, machine_id: String, instance_id: String, state: MachineState) {
        let app = self.clone();
        tokio::spawn(async move {
            time::sleep(app.settings.convergence_delay).await;
            let settled = app
                .registry
                .write()
                .settle(&machine_id, &instance_id, state, Utc::now());
            match settled {
                Some(machine) => {
                    info!(machine_id = %machine.id, state = %machine.state, "machine converged");
                    if let Err(e) = db::save_machine(&app.db.lock(), &machine) {
                        error!(machine_id = %machine.id, error = %e, "failed to persist machine");
                    }
                }
                None => info!(machine_id = %machine_id, "instance replaced again before converging"),
            }
        });
    }

    /// Finish transitions interrupted by a previous shutdown.
    pub fn resume_transitions(&self) {
        let pending = self.registry.read().transient_machines();
        for (machine_id, instance_id, target) in pending {
            self.schedule_settle(machine_id, instance_id, target);
        }
    }
}

/// Periodically drop expired leases from memory and disk.
pub fn spawn_lease_sweeper(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(state.settings.sweep_interval);
        loop {
            interval.tick().await;
            let expired = state.registry.write().expire_leases(Utc::now());
            if expired.is_empty() {
                continue;
            }
            let db = state.db.lock();
            for machine_id in expired {
                info!(machine_id = %machine_id, "releasing expired lease");
                if let Err(e) = db::delete_lease(&db, &machine_id) {
                    warn!(machine_id = %machine_id, error = %e, "failed to delete expired lease");
                }
            }
        }
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/apps/{app_id}/machines",
            get(routes::list_machines).post(routes::launch_machine),
        )
        .route(
            "/apps/{app_id}/volumes",
            get(routes::list_volumes).post(routes::create_volume),
        )
        .route(
            "/machines/{machine_id}",
            get(routes::get_machine).post(routes::update_machine),
        )
        .route(
            "/machines/{machine_id}/lease",
            post(routes::acquire_lease).delete(routes::release_lease),
        )
        .route("/machines/{machine_id}/wait", get(routes::wait_machine))
        .route("/leases", get(routes::list_leases))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the listener fails. Starts the lease sweeper and resumes any
/// interrupted transitions first.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    state.resume_transitions();
    let sweeper = spawn_lease_sweeper(state.clone());
    let result = axum::serve(listener, router(state)).await;
    sweeper.abort();
    result
}
