use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level classification of a control-plane failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Conflict,
    Unauthorized,
    InvalidConfig,
    NotFound,
    TimedOut,
    UnexpectedState,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::NotFound => "not_found",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::UnexpectedState => "unexpected_state",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body carried by every non-2xx control-plane response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlPlaneError {
    /// Lease held by another owner. Retryable later, not within the same run.
    #[error("machine {machine_id} is leased by another holder{}", owner_suffix(.owner))]
    Conflict {
        machine_id: String,
        owner: Option<String>,
    },
    #[error("lease nonce rejected for machine {machine_id}: {reason}")]
    Unauthorized { machine_id: String, reason: String },
    #[error("invalid machine config: {0}")]
    InvalidConfig(String),
    #[error("machine {0} not found")]
    NotFound(String),
    #[error("timed out waiting for machine {machine_id} to reach {target}")]
    TimedOut { machine_id: String, target: String },
    #[error("machine {machine_id} settled in unexpected state {state}")]
    UnexpectedState { machine_id: String, state: String },
    #[error("control plane request failed: {0}")]
    Transport(String),
}

fn owner_suffix(owner: &Option<String>) -> String {
    owner
        .as_deref()
        .map(|o| format!(" ({o})"))
        .unwrap_or_default()
}

impl ControlPlaneError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlPlaneError::Conflict { .. } => ErrorKind::Conflict,
            ControlPlaneError::Unauthorized { .. } => ErrorKind::Unauthorized,
            ControlPlaneError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            ControlPlaneError::NotFound(_) => ErrorKind::NotFound,
            ControlPlaneError::TimedOut { .. } => ErrorKind::TimedOut,
            ControlPlaneError::UnexpectedState { .. } => ErrorKind::UnexpectedState,
            ControlPlaneError::Transport(_) => ErrorKind::Internal,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// Rebuild a typed error from a response body. `machine_id` fills in the
    /// context the body does not carry structurally.
    pub fn from_body(body: ErrorBody, machine_id: &str) -> Self {
        let machine_id = machine_id.to_string();
        match body.kind {
            ErrorKind::Conflict => ControlPlaneError::Conflict {
                machine_id,
                owner: None,
            },
            ErrorKind::Unauthorized => ControlPlaneError::Unauthorized {
                machine_id,
                reason: body.message,
            },
            ErrorKind::InvalidConfig => ControlPlaneError::InvalidConfig(body.message),
            ErrorKind::NotFound => ControlPlaneError::NotFound(machine_id),
            ErrorKind::TimedOut => ControlPlaneError::TimedOut {
                machine_id,
                target: body.message,
            },
            ErrorKind::UnexpectedState => ControlPlaneError::UnexpectedState {
                machine_id,
                state: body.message,
            },
            ErrorKind::Internal => ControlPlaneError::Transport(body.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_body_round_trip() {
        let err = ControlPlaneError::Conflict {
            machine_id: "m1".into(),
            owner: Some("alice".into()),
        };
        assert_eq!(err.to_string(), "machine m1 is leased by another holder (alice)");
        let back = ControlPlaneError::from_body(err.to_body(), "m1");
        assert_eq!(back.kind(), ErrorKind::Conflict);
    }
}
