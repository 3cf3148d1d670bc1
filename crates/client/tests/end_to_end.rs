use std::sync::Arc;
use std::time::Duration;

use fleet_client::HttpControlPlane;
use fleet_common::{ControlPlaneError, ErrorKind, LaunchMachineInput, MachineConfig, MachineState};
use fleet_daemon::{db, AppState, Settings};
use fleet_orchestrator::{
    CancellationToken, ControlPlane, FleetOrchestrator, MachineStage, OrchestratorConfig,
};

async fn spawn_daemon() -> String {
    spawn_daemon_converging_after(Duration::from_millis(50)).await
}

async fn spawn_daemon_converging_after(convergence_delay: Duration) -> String {
    let conn = db::init_memory_db().expect("in-memory database");
    let settings = Settings {
        convergence_delay,
        sweep_interval: Duration::from_secs(1),
    };
    let state = AppState::load(conn, settings).expect("load state");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(fleet_daemon::serve(listener, state));
    format!("http://{addr}")
}

fn plan(image: &str) -> MachineConfig {
    MachineConfig {
        image: image.to_string(),
        ..Default::default()
    }
}

fn orchestrator(control_plane: Arc<HttpControlPlane>) -> FleetOrchestrator {
    FleetOrchestrator::new(
        control_plane,
        OrchestratorConfig {
            lease_ttl: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(5),
            ..Default::default()
        },
    )
}

async fn launch_fleet(control_plane: &HttpControlPlane, count: usize) -> Vec<String> {
    for _ in 0..count {
        control_plane
            .launch(&LaunchMachineInput {
                app_id: "web".into(),
                name: None,
                region: "ams".into(),
                config: plan("web:v1"),
            })
            .await
            .unwrap();
    }
    control_plane
        .list("web")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect()
}

#[tokio::test]
async fn empty_app_is_bootstrapped_with_one_machine() {
    let base = spawn_daemon().await;
    let control_plane = Arc::new(HttpControlPlane::new(&base, "deployer"));

    let result = orchestrator(control_plane.clone())
        .apply_fleet_update("web", "ams", plan("web:v1"), CancellationToken::new())
        .await
        .unwrap();

    assert!(result.is_success());
    let launched = result.launched.expect("a machine was launched");
    assert_eq!(result.updated, vec![launched.clone()]);
    let machines = control_plane.list("web").await.unwrap();
    assert_eq!(machines.len(), 1);
    assert_eq!(machines[0].id, launched);
    assert_eq!(machines[0].region, "ams");
}

#[tokio::test]
async fn rollout_updates_every_machine_and_releases_leases() {
    let base = spawn_daemon().await;
    let control_plane = Arc::new(HttpControlPlane::new(&base, "deployer"));
    let ids = launch_fleet(&control_plane, 3).await;

    let result = orchestrator(control_plane.clone())
        .apply_fleet_update("web", "ams", plan("web:v2"), CancellationToken::new())
        .await
        .unwrap();

    assert!(result.is_success(), "{:?}", result.cause);
    assert_eq!(result.updated, ids);
    for machine in control_plane.list("web").await.unwrap() {
        assert_eq!(machine.config.image, "web:v2");
        assert_eq!(machine.state, MachineState::Started);
    }
    assert!(control_plane.list_leases().await.unwrap().is_empty());
}

#[tokio::test]
async fn foreign_lease_stops_the_rollout_at_that_machine() {
    let base = spawn_daemon().await;
    let control_plane = Arc::new(HttpControlPlane::new(&base, "deployer"));
    let ids = launch_fleet(&control_plane, 3).await;

    let other = HttpControlPlane::new(&base, "someone-else");
    other
        .acquire_lease(&ids[1], Duration::from_secs(60))
        .await
        .unwrap();

    let result = orchestrator(control_plane.clone())
        .apply_fleet_update("web", "ams", plan("web:v2"), CancellationToken::new())
        .await
        .unwrap();

    assert!(!result.is_success());
    assert_eq!(result.updated, vec![ids[0].clone()]);
    assert_eq!(result.failed_at.as_deref(), Some(ids[1].as_str()));
    assert_eq!(result.failed_stage, Some(MachineStage::Pending));
    assert_eq!(
        result.cause.as_ref().and_then(|c| c.kind()),
        Some(ErrorKind::Conflict)
    );
    assert_eq!(result.untouched, vec![ids[2].clone()]);

    let third = control_plane.get(&ids[2]).await.unwrap();
    assert_eq!(third.config.image, "web:v1");

    let leases = control_plane.list_leases().await.unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].owner, "someone-else");
}

#[tokio::test]
async fn wait_budget_longer_than_one_poll_is_honoured() {
    let base = spawn_daemon_converging_after(Duration::from_millis(2500)).await;
    let control_plane =
        HttpControlPlane::new(&base, "deployer").with_max_wait(Duration::from_secs(1));
    let id = launch_fleet(&control_plane, 1).await.remove(0);

    let lease = control_plane
        .acquire_lease(&id, Duration::from_secs(30))
        .await
        .unwrap();
    let handle = control_plane
        .update(&id, &plan("web:v2"), &lease.nonce)
        .await
        .unwrap();

    let err = control_plane
        .wait(&handle, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlPlaneError::TimedOut { .. }), "{err}");

    let state = control_plane
        .wait(&handle, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(state, MachineState::Started);
}
