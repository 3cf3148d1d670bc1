use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fleet_common::{ControlPlaneError, Lease};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control_plane::ControlPlane;

const MIN_RENEW_PERIOD: Duration = Duration::from_millis(500);

/// Why [`HeldLease::hold_while`] stopped.
#[derive(Debug)]
pub enum HoldError {
    Operation(ControlPlaneError),
    Renewal(ControlPlaneError),
    Cancelled,
}

/// A lease this process acquired and has not yet released.
///
/// `release` consumes the value, so a lease can be released at most once.
pub struct HeldLease {
    control_plane: Arc<dyn ControlPlane>,
    lease: Lease,
    ttl: Duration,
}

impl std::fmt::Debug for HeldLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeldLease")
            .field("lease", &self.lease)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl HeldLease {
    pub async fn acquire(
        control_plane: Arc<dyn ControlPlane>,
        machine_id: &str,
        ttl: Duration,
    ) -> Result<Self, ControlPlaneError> {
        info!(machine_id, ttl_secs = ttl.as_secs(), "taking lease");
        let lease = control_plane.acquire_lease(machine_id, ttl).await?;
        debug!(machine_id, expires_at = %lease.expires_at, "lease granted");
        Ok(Self {
            control_plane,
            lease,
            ttl,
        })
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn nonce(&self) -> &str {
        &self.lease.nonce
    }

    pub fn machine_id(&self) -> &str {
        &self.lease.machine_id
    }

    /// Re-acquire with the same nonce before the current term runs out.
    pub async fn renew(&mut self) -> Result<(), ControlPlaneError> {
        let renewed = self
            .control_plane
            .renew_lease(&self.lease.machine_id, &self.lease.nonce, self.ttl)
            .await?;
        if renewed.nonce != self.lease.nonce {
            return Err(ControlPlaneError::Conflict {
                machine_id: self.lease.machine_id.clone(),
                owner: Some(renewed.owner),
            });
        }
        debug!(machine_id = %self.lease.machine_id, expires_at = %renewed.expires_at, "lease renewed");
        self.lease = renewed;
        Ok(())
    }

    fn renew_period(&self) -> Duration {
        (self.ttl / 2).max(MIN_RENEW_PERIOD)
    }

    /// Drive `operation` to completion, renewing the lease every half TTL.
    /// Returns early if the lease cannot be renewed or `cancel` fires.
    pub async fn hold_while<T, F>(
        &mut self,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, HoldError>
    where
        F: Future<Output = Result<T, ControlPlaneError>>,
    {
        tokio::pin!(operation);
        let period = self.renew_period();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut operation => return result.map_err(HoldError::Operation),
                _ = cancel.cancelled() => return Err(HoldError::Cancelled),
                _ = ticker.tick() => self.renew().await.map_err(HoldError::Renewal)?,
            }
        }
    }

    /// Best effort. A failure is only logged: the lease expires on its own.
    pub async fn release(self) -> bool {
        let machine_id = &self.lease.machine_id;
        info!(machine_id = %machine_id, "releasing lease");
        match self
            .control_plane
            .release_lease(machine_id, &self.lease.nonce)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    machine_id = %machine_id,
                    expires_at = %self.lease.expires_at,
                    error = %err,
                    "failed to release lease, leaving it to expire"
                );
                false
            }
        }
    }
}
