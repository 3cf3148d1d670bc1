use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_LEASE_TTL_SECS: u64 = 30;

/// A time-bounded exclusive claim on one machine.
///
/// The control plane is the only authority on exclusivity; holding a `Lease`
/// value locally proves nothing once `expires_at` has passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub machine_id: String,
    pub nonce: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl Lease {
    pub fn new(
        machine_id: impl Into<String>,
        nonce: impl Into<String>,
        owner: impl Into<String>,
        ttl_seconds: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            nonce: nonce.into(),
            owner: owner.into(),
            expires_at: now + Duration::seconds(ttl_seconds as i64),
            ttl_seconds,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn held_by(&self, nonce: &str) -> bool {
        self.nonce == nonce
    }

    /// Push the expiry out by another TTL from `now`.
    pub fn extend(&mut self, ttl_seconds: u64, now: DateTime<Utc>) {
        self.ttl_seconds = ttl_seconds;
        self.expires_at = now + Duration::seconds(ttl_seconds as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_only_before_expiry() {
        let now = Utc::now();
        let lease = Lease::new("m1", "n1", "ops", 30, now);
        assert!(lease.is_valid_at(now));
        assert!(lease.is_valid_at(now + Duration::seconds(29)));
        assert!(!lease.is_valid_at(now + Duration::seconds(30)));
    }

    #[test]
    fn extend_keeps_nonce() {
        let now = Utc::now();
        let mut lease = Lease::new("m1", "n1", "ops", 10, now);
        lease.extend(60, now + Duration::seconds(5));
        assert!(lease.held_by("n1"));
        assert!(lease.is_valid_at(now + Duration::seconds(60)));
    }
}
