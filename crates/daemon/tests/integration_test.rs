use std::time::Duration;

use fleet_common::{
    AcquireLeaseRequest, CreateVolumeRequest, ErrorBody, ErrorKind, LaunchMachineInput, Lease,
    Machine, MachineConfig, MachineMount, MachineState, UpdateHandle, UpdateMachineRequest,
    WaitResponse, LEASE_NONCE_HEADER,
};
use fleet_daemon::{db, AppState, Settings};
use reqwest::{Client, StatusCode};

// Each test gets its own in-memory daemon on an ephemeral port.
async fn spawn_daemon() -> String {
    let conn = db::init_memory_db().expect("in-memory database");
    let settings = Settings {
        convergence_delay: Duration::from_millis(50),
        sweep_interval: Duration::from_secs(1),
    };
    let state = AppState::load(conn, settings).expect("load state");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(fleet_daemon::serve(listener, state));
    format!("http://{addr}")
}

fn config(image: &str) -> MachineConfig {
    MachineConfig {
        image: image.to_string(),
        ..Default::default()
    }
}

async fn launch(client: &Client, base: &str, image: &str) -> Machine {
    let input = LaunchMachineInput {
        app_id: "web".into(),
        name: None,
        region: "ams".into(),
        config: config(image),
    };
    let resp = client
        .post(format!("{base}/apps/web/machines"))
        .json(&input)
        .send()
        .await
        .expect("Failed to send launch request");
    assert!(resp.status().is_success());
    resp.json().await.unwrap()
}

async fn acquire(client: &Client, base: &str, machine_id: &str, owner: &str) -> reqwest::Response {
    let req = AcquireLeaseRequest {
        ttl_seconds: Some(30),
        owner: Some(owner.into()),
        nonce: None,
    };
    client
        .post(format!("{base}/machines/{machine_id}/lease"))
        .json(&req)
        .send()
        .await
        .expect("Failed to send lease request")
}

async fn error_kind(resp: reqwest::Response) -> ErrorKind {
    let body: ErrorBody = resp.json().await.unwrap();
    body.kind
}

#[tokio::test]
async fn test_full_lifecycle() {
    let base = spawn_daemon().await;
    let client = Client::new();

    // 1. Launch and list
    let machine = launch(&client, &base, "web:v1").await;
    let listed: Vec<Machine> = client
        .get(format!("{base}/apps/web/machines"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, machine.id);

    // 2. Lease
    let resp = acquire(&client, &base, &machine.id, "alice").await;
    assert!(resp.status().is_success());
    let lease: Lease = resp.json().await.unwrap();
    assert_eq!(lease.owner, "alice");

    // 3. Update under the lease and wait for the new instance
    let resp = client
        .post(format!("{base}/machines/{}", machine.id))
        .header(LEASE_NONCE_HEADER, &lease.nonce)
        .json(&UpdateMachineRequest {
            config: config("web:v2"),
        })
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let handle: UpdateHandle = resp.json().await.unwrap();
    assert_ne!(handle.instance_id, machine.instance_id);
    assert_eq!(handle.target_state, MachineState::Started);

    let resp = client
        .get(format!("{base}/machines/{}/wait", machine.id))
        .query(&[
            ("instance_id", handle.instance_id.as_str()),
            ("state", "started"),
            ("timeout_secs", "5"),
        ])
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let waited: WaitResponse = resp.json().await.unwrap();
    assert_eq!(waited.state, MachineState::Started);

    // 4. Release, twice
    for _ in 0..2 {
        let resp = client
            .delete(format!("{base}/machines/{}/lease", machine.id))
            .header(LEASE_NONCE_HEADER, &lease.nonce)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let current: Machine = client
        .get(format!("{base}/machines/{}", machine.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(current.config.image, "web:v2");
    assert_eq!(current.image_ref.tag, "v2");
}

#[tokio::test]
async fn second_holder_gets_conflict() {
    let base = spawn_daemon().await;
    let client = Client::new();
    let machine = launch(&client, &base, "web:v1").await;

    assert!(acquire(&client, &base, &machine.id, "alice").await.status().is_success());
    let resp = acquire(&client, &base, &machine.id, "bob").await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(error_kind(resp).await, ErrorKind::Conflict);

    let leases: Vec<Lease> = client
        .get(format!("{base}/leases"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].owner, "alice");
    assert!(leases[0].nonce.is_empty());
}

#[tokio::test]
async fn update_without_matching_nonce_is_unauthorized() {
    let base = spawn_daemon().await;
    let client = Client::new();
    let machine = launch(&client, &base, "web:v1").await;
    assert!(acquire(&client, &base, &machine.id, "alice").await.status().is_success());

    let resp = client
        .post(format!("{base}/machines/{}", machine.id))
        .header(LEASE_NONCE_HEADER, "not-the-nonce")
        .json(&UpdateMachineRequest {
            config: config("web:v2"),
        })
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_kind(resp).await, ErrorKind::Unauthorized);

    let resp = client
        .post(format!("{base}/machines/{}", machine.id))
        .json(&UpdateMachineRequest {
            config: config("web:v2"),
        })
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn mount_outside_the_region_is_rejected() {
    let base = spawn_daemon().await;
    let client = Client::new();
    let machine = launch(&client, &base, "web:v1").await;

    let resp = client
        .post(format!("{base}/apps/web/volumes"))
        .json(&CreateVolumeRequest {
            name: "data".into(),
            region: "fra".into(),
            size_gb: Some(1),
        })
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let lease: Lease = acquire(&client, &base, &machine.id, "alice").await.json().await.unwrap();
    let mut with_mount = config("web:v2");
    with_mount.mounts.push(MachineMount {
        volume: "data".into(),
        path: "/data".into(),
        size_gb: 1,
        encrypted: false,
    });
    let resp = client
        .post(format!("{base}/machines/{}", machine.id))
        .header(LEASE_NONCE_HEADER, &lease.nonce)
        .json(&UpdateMachineRequest { config: with_mount })
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(error_kind(resp).await, ErrorKind::InvalidConfig);
}

#[tokio::test]
async fn wait_for_a_stale_instance_times_out() {
    let base = spawn_daemon().await;
    let client = Client::new();
    let machine = launch(&client, &base, "web:v1").await;

    let resp = client
        .get(format!("{base}/machines/{}/wait", machine.id))
        .query(&[
            ("instance_id", "some-other-instance"),
            ("state", "started"),
            ("timeout_secs", "1"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(error_kind(resp).await, ErrorKind::TimedOut);
}

#[tokio::test]
async fn unknown_machine_is_not_found() {
    let base = spawn_daemon().await;
    let client = Client::new();

    let resp = acquire(&client, &base, "missing", "alice").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_kind(resp).await, ErrorKind::NotFound);
}

#[tokio::test]
async fn release_after_expiry_still_succeeds() {
    let base = spawn_daemon().await;
    let client = Client::new();
    let machine = launch(&client, &base, "web:v1").await;

    let req = AcquireLeaseRequest {
        ttl_seconds: Some(1),
        owner: Some("alice".into()),
        nonce: None,
    };
    let lease: Lease = client
        .post(format!("{base}/machines/{}/lease", machine.id))
        .json(&req)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let resp = client
        .delete(format!("{base}/machines/{}/lease", machine.id))
        .header(LEASE_NONCE_HEADER, &lease.nonce)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    assert!(acquire(&client, &base, &machine.id, "bob").await.status().is_success());
}
