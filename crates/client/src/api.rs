use std::time::Duration;

use async_trait::async_trait;
use fleet_common::{
    AcquireLeaseRequest, ControlPlaneError, CreateVolumeRequest, ErrorBody, LaunchMachineInput,
    Lease, Machine, MachineConfig, MachineState, UpdateHandle, UpdateMachineRequest, Volume,
    WaitResponse, LEASE_NONCE_HEADER, MAX_WAIT_SECS,
};
use fleet_orchestrator::ControlPlane;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::debug;

/// Slack on top of a wait timeout so the server answers before we give up.
const WAIT_GRACE: Duration = Duration::from_secs(5);

/// [`ControlPlane`] over the daemon's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
    owner: String,
    max_wait: Duration,
}

fn transport(err: reqwest::Error) -> ControlPlaneError {
    ControlPlaneError::Transport(err.to_string())
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            max_wait: Duration::from_secs(MAX_WAIT_SECS),
        }
    }

    /// Cap on a single long-poll. Wait budgets above it are spent over several requests.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait.max(Duration::from_secs(1));
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(
        resp: Response,
        machine_id: &str,
    ) -> Result<T, ControlPlaneError> {
        let resp = Self::check(resp, machine_id).await?;
        resp.json().await.map_err(transport)
    }

    async fn check(resp: Response, machine_id: &str) -> Result<Response, ControlPlaneError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        match resp.json::<ErrorBody>().await {
            Ok(body) => Err(ControlPlaneError::from_body(body, machine_id)),
            Err(_) => Err(ControlPlaneError::Transport(format!(
                "unexpected response status {status}"
            ))),
        }
    }

    async fn request_lease(
        &self,
        machine_id: &str,
        ttl: Duration,
        nonce: Option<&str>,
    ) -> Result<Lease, ControlPlaneError> {
        let req = AcquireLeaseRequest {
            ttl_seconds: Some(ttl.as_secs().max(1)),
            owner: Some(self.owner.clone()),
            nonce: nonce.map(str::to_string),
        };
        let resp = self
            .client
            .post(self.url(&format!("/machines/{machine_id}/lease")))
            .json(&req)
            .send()
            .await
            .map_err(transport)?;
        Self::decode(resp, machine_id).await
    }

    /// One long-poll of `timeout` in whole seconds, at least one.
    async fn wait_once(
        &self,
        handle: &UpdateHandle,
        timeout: Duration,
    ) -> Result<MachineState, ControlPlaneError> {
        let timeout_secs = timeout.as_secs().max(1);
        debug!(machine_id = %handle.machine_id, timeout_secs, "waiting on control plane");
        let resp = self
            .client
            .get(self.url(&format!("/machines/{}/wait", handle.machine_id)))
            .query(&[
                ("instance_id", handle.instance_id.clone()),
                ("state", handle.target_state.to_string()),
                ("timeout_secs", timeout_secs.to_string()),
            ])
            .timeout(Duration::from_secs(timeout_secs) + WAIT_GRACE)
            .send()
            .await;

        let timed_out = || ControlPlaneError::TimedOut {
            machine_id: handle.machine_id.clone(),
            target: handle.target_state.to_string(),
        };
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return Err(timed_out()),
            Err(e) => return Err(transport(e)),
        };
        if resp.status() == StatusCode::REQUEST_TIMEOUT {
            return Err(timed_out());
        }
        let waited: WaitResponse = Self::decode(resp, &handle.machine_id).await?;
        Ok(waited.state)
    }

    pub async fn create_volume(
        &self,
        app_id: &str,
        req: &CreateVolumeRequest,
    ) -> Result<Volume, ControlPlaneError> {
        let resp = self
            .client
            .post(self.url(&format!("/apps/{app_id}/volumes")))
            .json(req)
            .send()
            .await
            .map_err(transport)?;
        Self::decode(resp, app_id).await
    }

    pub async fn list_volumes(&self, app_id: &str) -> Result<Vec<Volume>, ControlPlaneError> {
        let resp = self
            .client
            .get(self.url(&format!("/apps/{app_id}/volumes")))
            .send()
            .await
            .map_err(transport)?;
        Self::decode(resp, app_id).await
    }

    /// Active leases across all machines; nonces are withheld by the server.
    pub async fn list_leases(&self) -> Result<Vec<Lease>, ControlPlaneError> {
        let resp = self
            .client
            .get(self.url("/leases"))
            .send()
            .await
            .map_err(transport)?;
        Self::decode(resp, "").await
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn list(&self, app_id: &str) -> Result<Vec<Machine>, ControlPlaneError> {
        let resp = self
            .client
            .get(self.url(&format!("/apps/{app_id}/machines")))
            .send()
            .await
            .map_err(transport)?;
        Self::decode(resp, app_id).await
    }

    async fn get(&self, machine_id: &str) -> Result<Machine, ControlPlaneError> {
        let resp = self
            .client
            .get(self.url(&format!("/machines/{machine_id}")))
            .send()
            .await
            .map_err(transport)?;
        Self::decode(resp, machine_id).await
    }

    async fn acquire_lease(
        &self,
        machine_id: &str,
        ttl: Duration,
    ) -> Result<Lease, ControlPlaneError> {
        self.request_lease(machine_id, ttl, None).await
    }

    async fn renew_lease(
        &self,
        machine_id: &str,
        nonce: &str,
        ttl: Duration,
    ) -> Result<Lease, ControlPlaneError> {
        self.request_lease(machine_id, ttl, Some(nonce)).await
    }

    async fn update(
        &self,
        machine_id: &str,
        config: &MachineConfig,
        nonce: &str,
    ) -> Result<UpdateHandle, ControlPlaneError> {
        let req = UpdateMachineRequest {
            config: config.clone(),
        };
        let resp = self
            .client
            .post(self.url(&format!("/machines/{machine_id}")))
            .header(LEASE_NONCE_HEADER, nonce)
            .json(&req)
            .send()
            .await
            .map_err(transport)?;
        Self::decode(resp, machine_id).await
    }

    async fn wait(
        &self,
        handle: &UpdateHandle,
        timeout: Duration,
    ) -> Result<MachineState, ControlPlaneError> {
        let deadline = Instant::now() + timeout;
        loop {
            let chunk = deadline
                .saturating_duration_since(Instant::now())
                .min(self.max_wait);
            match self.wait_once(handle, chunk).await {
                Err(ControlPlaneError::TimedOut { .. }) if Instant::now() < deadline => {
                    debug!(machine_id = %handle.machine_id, "wait chunk elapsed, polling again");
                }
                other => return other,
            }
        }
    }

    async fn release_lease(&self, machine_id: &str, nonce: &str) -> Result<(), ControlPlaneError> {
        let resp = self
            .client
            .delete(self.url(&format!("/machines/{machine_id}/lease")))
            .header(LEASE_NONCE_HEADER, nonce)
            .send()
            .await
            .map_err(transport)?;
        Self::check(resp, machine_id).await.map(|_| ())
    }

    async fn launch(&self, input: &LaunchMachineInput) -> Result<Machine, ControlPlaneError> {
        let resp = self
            .client
            .post(self.url(&format!("/apps/{}/machines", input.app_id)))
            .json(input)
            .send()
            .await
            .map_err(transport)?;
        Self::decode(resp, &input.app_id).await
    }
}
