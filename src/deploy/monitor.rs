//! SF-024: Status polling and run summaries.

use super::retry::with_retry;
use super::types::{DeploymentState, DocumentStatus, RunPhase, UploadStatus};
use crate::core::types::{DeployConfig, RetryPolicy};
use crate::error::PlatformError;
use crate::platform::{ControlPlane, DeploymentHandle, DeploymentStatus, PlatformPhase};
use std::fmt;
use std::time::Duration;

/// How often and how long to poll one deployment.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl PollPolicy {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_polls_per_document.max(1),
        }
    }
}

/// Final observation of a polled deployment.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Terminal { status: DeploymentStatus, polls: u32 },
    /// Poll budget spent before a terminal phase
    Exhausted { last: DeploymentStatus, polls: u32 },
}

impl PollOutcome {
    pub fn status(&self) -> &DeploymentStatus {
        match self {
            Self::Terminal { status, .. } => status,
            Self::Exhausted { last, .. } => last,
        }
    }
}

/// Poll until the deployment reaches a terminal phase.
///
/// Observed phases never regress: a report ranked below the last one seen is
/// ignored. Transient `get_status` failures are retried under `retry`.
pub async fn poll_until_terminal(
    plane: &dyn ControlPlane,
    handle: &DeploymentHandle,
    policy: &PollPolicy,
    retry: &RetryPolicy,
) -> Result<PollOutcome, PlatformError> {
    let mut last = DeploymentStatus::in_phase(PlatformPhase::Accepted);
    for poll in 1..=policy.max_polls {
        let status = with_retry(retry, &handle.0, |_| plane.get_status(handle))
            .await
            .value?;
        if status.phase.rank() >= last.phase.rank() {
            last = status;
        } else {
            tracing::debug!(
                handle = %handle.0,
                reported = ?status.phase,
                current = ?last.phase,
                "ignoring regressed status"
            );
        }
        if last.phase.is_terminal() {
            return Ok(PollOutcome::Terminal {
                status: last,
                polls: poll,
            });
        }
        tokio::time::sleep(policy.interval).await;
    }
    Ok(PollOutcome::Exhausted {
        last,
        polls: policy.max_polls,
    })
}

/// Condensed view of a persisted run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub name: String,
    pub run_id: String,
    pub phase: RunPhase,
    pub tiers: Vec<Vec<(String, DocumentStatus)>>,
    pub uploads_done: usize,
    pub uploads_total: usize,
    pub rollback: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn summarize(state: &DeploymentState) -> RunSummary {
    let tiers = state
        .tiers
        .iter()
        .map(|tier| {
            tier.documents
                .iter()
                .map(|d| {
                    let status = state
                        .documents
                        .get(d)
                        .map(|r| r.status)
                        .unwrap_or(DocumentStatus::Pending);
                    (d.clone(), status)
                })
                .collect()
        })
        .collect();

    let rollback = if state.rollback.executed {
        Some(format!(
            "executed: restored [{}], skipped [{}]",
            state.rollback.restored.join(", "),
            state.rollback.skipped.join(", ")
        ))
    } else if state.rollback.enabled {
        Some(if state.rollback.available {
            "available, not executed".to_string()
        } else {
            "enabled, no checkpoint yet".to_string()
        })
    } else {
        None
    };

    RunSummary {
        name: state.name.clone(),
        run_id: state.run_id.clone(),
        phase: state.phase,
        tiers,
        uploads_done: state
            .uploads
            .values()
            .filter(|u| u.status == UploadStatus::Uploaded)
            .count(),
        uploads_total: state.uploads.len(),
        rollback,
        errors: state.errors.clone(),
        warnings: state.warnings.clone(),
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} (run {}): {}", self.name, self.run_id, self.phase)?;
        writeln!(f, "  uploads: {}/{}", self.uploads_done, self.uploads_total)?;
        for (i, tier) in self.tiers.iter().enumerate() {
            let docs: Vec<String> = tier.iter().map(|(d, s)| format!("{}={}", d, s)).collect();
            writeln!(f, "  tier {}: {}", i, docs.join(" "))?;
        }
        if let Some(rollback) = &self.rollback {
            writeln!(f, "  rollback: {}", rollback)?;
        }
        for e in &self.errors {
            writeln!(f, "  error: {}", e)?;
        }
        for w in &self.warnings {
            writeln!(f, "  warning: {}", w)?;
        }
        Ok(())
    }
}
