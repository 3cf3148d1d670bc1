use std::fmt;

use fleet_orchestrator::{ErrorScope, RunResult};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub machine_id: String,
    pub stage: String,
    pub kind: Option<String>,
    pub error: String,
}

/// Printable summary of a [`RunResult`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub app: String,
    pub image: String,
    pub success: bool,
    pub launched: Option<String>,
    pub updated: Vec<String>,
    pub failed_at: Option<String>,
    pub failed_stage: Option<String>,
    pub cause: Option<String>,
    /// `machine` or `run`.
    pub scope: Option<String>,
    pub failures: Vec<FailureReport>,
    pub untouched: Vec<String>,
}

impl RunReport {
    pub fn new(app: &str, image: &str, result: &RunResult) -> Self {
        Self {
            app: app.to_string(),
            image: image.to_string(),
            success: result.is_success(),
            launched: result.launched.clone(),
            updated: result.updated.clone(),
            failed_at: result.failed_at.clone(),
            failed_stage: result.failed_stage.map(|s| s.to_string()),
            cause: result.cause.as_ref().map(|e| e.to_string()),
            scope: result.cause.as_ref().map(|e| match e.scope() {
                ErrorScope::Machine => "machine".to_string(),
                ErrorScope::Run => "run".to_string(),
            }),
            failures: result
                .failures
                .iter()
                .map(|f| FailureReport {
                    machine_id: f.machine_id.clone(),
                    stage: f.stage.to_string(),
                    kind: f.cause.kind().map(|k| k.to_string()),
                    error: f.cause.to_string(),
                })
                .collect(),
            untouched: result.untouched.clone(),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(id) = &self.launched {
            writeln!(f, "Launched {} for {} with {}", id, self.app, self.image)?;
        }
        for id in &self.updated {
            writeln!(f, "  ✔ {id}")?;
        }
        for failure in &self.failures {
            writeln!(
                f,
                "  ✘ {} ({}): {}",
                failure.machine_id, failure.stage, failure.error
            )?;
        }
        for id in &self.untouched {
            writeln!(f, "  - {id} (not attempted)")?;
        }
        match &self.cause {
            None => write!(
                f,
                "Deployed {} to {} ({} updated)",
                self.image,
                self.app,
                self.updated.len()
            ),
            Some(cause) => write!(f, "Deployment of {} failed: {}", self.app, cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::ControlPlaneError;
    use fleet_orchestrator::{FleetError, MachineFailure, MachineStage};

    #[test]
    fn failed_run_reports_machine_scope() {
        let cause = FleetError::Machine {
            machine_id: "m2".into(),
            stage: MachineStage::Pending,
            source: ControlPlaneError::Conflict {
                machine_id: "m2".into(),
                owner: Some("someone".into()),
            },
        };
        let result = RunResult {
            updated: vec!["m1".into()],
            failed_at: Some("m2".into()),
            failed_stage: Some(MachineStage::Pending),
            cause: Some(cause.clone()),
            failures: vec![MachineFailure {
                machine_id: "m2".into(),
                stage: MachineStage::Pending,
                cause,
            }],
            untouched: vec!["m3".into()],
            launched: None,
        };

        let report = RunReport::new("web", "web:v2", &result);
        assert!(!report.success);
        assert_eq!(report.scope.as_deref(), Some("machine"));
        assert_eq!(report.failures[0].kind.as_deref(), Some("conflict"));

        let text = report.to_string();
        assert!(text.contains("✔ m1"));
        assert!(text.contains("m3 (not attempted)"));
        assert!(text.starts_with("  ✔"));
    }

    #[test]
    fn successful_run_summary() {
        let result = RunResult {
            updated: vec!["m1".into(), "m2".into()],
            ..Default::default()
        };
        let report = RunReport::new("web", "web:v2", &result);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["success"], true);
        assert!(report.to_string().ends_with("(2 updated)"));
    }
}
