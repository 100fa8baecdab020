//! SF-025: Tier execution. Concurrent submission, polling, conflict fallback
//! and rollback redeployment.

use super::monitor::{poll_until_terminal, PollOutcome, PollPolicy};
use super::retry::with_retry;
use super::types::DocumentStatus;
use crate::core::types::{DeploymentMode, RetryPolicy};
use crate::error::PlatformError;
use crate::platform::{ArtifactLocator, ControlPlane, DeploymentRequest, PlatformPhase};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Shared, immutable inputs for every document in a tier.
#[derive(Clone)]
pub struct TierContext {
    pub control_plane: Arc<dyn ControlPlane>,
    pub retry: RetryPolicy,
    pub poll: PollPolicy,
    /// Hard deadline; documents still in flight are marked timed out
    pub deadline: Instant,
    pub run_id: String,
    pub deployment_name: String,
    pub max_concurrency: usize,
}

impl TierContext {
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self {
            deadline,
            ..self.clone()
        }
    }
}

/// One document submission, parameters already bound.
#[derive(Debug, Clone)]
pub struct DocumentJob {
    pub document: String,
    pub locator: ArtifactLocator,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub mode: DeploymentMode,
}

/// Terminal result of one document.
#[derive(Debug, Clone)]
pub struct DocumentOutcome {
    pub document: String,
    pub status: DocumentStatus,
    /// Mode of the last submission
    pub mode: DeploymentMode,
    pub conflict_retried: bool,
    /// Submissions made, retries included
    pub attempts: u32,
    pub handle: Option<String>,
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub resource_statuses: BTreeMap<String, String>,
    pub errors: Vec<String>,
    pub error: Option<PlatformError>,
}

impl DocumentOutcome {
    fn new(job: &DocumentJob) -> Self {
        Self {
            document: job.document.clone(),
            status: DocumentStatus::Pending,
            mode: job.mode,
            conflict_retried: false,
            attempts: 0,
            handle: None,
            outputs: BTreeMap::new(),
            resource_statuses: BTreeMap::new(),
            errors: Vec::new(),
            error: None,
        }
    }

    fn fail(mut self, status: DocumentStatus, err: PlatformError) -> Self {
        self.status = status;
        self.errors.push(err.to_string());
        self.error = Some(err);
        self
    }

    pub fn succeeded(&self) -> bool {
        self.status == DocumentStatus::Succeeded
    }
}

/// Platform deployment name for a document; stable across runs.
pub fn platform_deployment_name(deployment: &str, document: &str) -> String {
    format!("{}-{}", deployment, document)
}

enum Attempt {
    Done(DocumentOutcome),
    Retry(DocumentOutcome, PlatformError),
}

async fn submit_and_poll(ctx: &TierContext, job: &DocumentJob, mut outcome: DocumentOutcome) -> Attempt {
    let request = DeploymentRequest {
        name: platform_deployment_name(&ctx.deployment_name, &job.document),
        document: job.document.clone(),
        locator: job.locator.clone(),
        parameters: job.parameters.clone(),
        mode: outcome.mode,
        run_id: ctx.run_id.clone(),
    };
    let plane = ctx.control_plane.as_ref();
    let submitted = with_retry(&ctx.retry, &job.document, |_| {
        plane.submit_deployment(request.clone())
    })
    .await;
    outcome.attempts += submitted.attempts;

    let handle = match submitted.value {
        Ok(handle) => handle,
        Err(err) => return Attempt::Retry(outcome, err),
    };
    outcome.handle = Some(handle.0.clone());
    outcome.status = DocumentStatus::Submitted;

    let status = match poll_until_terminal(plane, &handle, &ctx.poll, &ctx.retry).await {
        Ok(PollOutcome::Terminal { status, .. }) => status,
        Ok(PollOutcome::Exhausted { polls, .. }) => {
            let err = PlatformError::Other(format!(
                "deployment {} not terminal after {} polls",
                handle.0, polls
            ));
            return Attempt::Done(outcome.fail(DocumentStatus::TimedOut, err));
        }
        Err(err) => return Attempt::Done(outcome.fail(DocumentStatus::Failed, err)),
    };

    outcome.resource_statuses = status.resources;
    outcome.outputs = status.outputs;
    match status.phase {
        PlatformPhase::Succeeded => {
            outcome.status = DocumentStatus::Succeeded;
            Attempt::Done(outcome)
        }
        _ => Attempt::Retry(outcome, PlatformError::from_diagnostics(&status.errors)),
    }
}

/// Deploy one document: submit (transient errors retried), poll to a
/// terminal phase, and fall back to incremental mode once on conflict.
#[tracing::instrument(skip_all, fields(document = %job.document))]
pub async fn deploy_document(ctx: &TierContext, job: &DocumentJob) -> DocumentOutcome {
    let mut outcome = DocumentOutcome::new(job);
    loop {
        match submit_and_poll(ctx, job, outcome).await {
            Attempt::Done(done) => return done,
            Attempt::Retry(mut failed, err) => {
                if err.is_conflict() && !failed.conflict_retried {
                    tracing::warn!(error = %err, "resource conflict, retrying in incremental mode");
                    failed.errors.push(err.to_string());
                    failed.conflict_retried = true;
                    failed.mode = DeploymentMode::Incremental;
                    outcome = failed;
                    continue;
                }
                return failed.fail(DocumentStatus::Failed, err);
            }
        }
    }
}

/// Deploy every job of a tier concurrently (bounded by `max_concurrency`)
/// and wait until all are terminal. Outcomes come back in job order.
pub async fn deploy_tier(ctx: Arc<TierContext>, jobs: Vec<DocumentJob>) -> Vec<DocumentOutcome> {
    let semaphore = Arc::new(Semaphore::new(ctx.max_concurrency.max(1)));
    let mut handles = Vec::with_capacity(jobs.len());

    for job in jobs {
        let ctx = Arc::clone(&ctx);
        let semaphore = Arc::clone(&semaphore);
        let fallback = DocumentOutcome::new(&job);
        let handle = tokio::spawn(async move {
            // Waiting for a slot past the deadline leaves the document untouched
            let Ok(_permit) = tokio::time::timeout_at(ctx.deadline, semaphore.acquire_owned()).await
            else {
                tracing::warn!(document = %job.document, "deadline reached before submission");
                return DocumentOutcome::new(&job).fail(
                    DocumentStatus::NotAttempted,
                    PlatformError::Other("run deadline reached before submission".to_string()),
                );
            };
            match tokio::time::timeout_at(ctx.deadline, deploy_document(&ctx, &job)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(document = %job.document, "deadline reached");
                    DocumentOutcome::new(&job).fail(
                        DocumentStatus::TimedOut,
                        PlatformError::Other("run deadline reached before completion".to_string()),
                    )
                }
            }
        });
        handles.push((fallback, handle));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (fallback, handle) in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => fallback.fail(
                DocumentStatus::Failed,
                PlatformError::Other(format!("deployment task failed: {}", e)),
            ),
        };
        tracing::info!(
            document = %outcome.document,
            status = %outcome.status,
            attempts = outcome.attempts,
            "document finished"
        );
        outcomes.push(outcome);
    }
    outcomes
}

/// Redeploy known-good jobs, tier groups in reverse order.
/// `tiers` is in forward order; each group runs as its own tier.
pub async fn rollback(ctx: Arc<TierContext>, tiers: Vec<Vec<DocumentJob>>) -> Vec<DocumentOutcome> {
    let mut outcomes = Vec::new();
    for jobs in tiers.into_iter().rev() {
        if jobs.is_empty() {
            continue;
        }
        tracing::info!(
            documents = ?jobs.iter().map(|j| j.document.as_str()).collect::<Vec<_>>(),
            "restoring known-good documents"
        );
        outcomes.extend(deploy_tier(Arc::clone(&ctx), jobs).await);
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::{Outcome, ScriptedControlPlane};
    use crate::platform::Diagnostic;
    use std::time::Duration;

    fn ctx(plane: Arc<ScriptedControlPlane>, deadline_secs: u64) -> Arc<TierContext> {
        Arc::new(TierContext {
            control_plane: plane,
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_multiplier: 2.0,
                initial_delay_ms: 10,
                max_delay_ms: 100,
            },
            poll: PollPolicy {
                interval: Duration::from_millis(100),
                max_polls: 1000,
            },
            deadline: Instant::now() + Duration::from_secs(deadline_secs),
            run_id: "r-test".to_string(),
            deployment_name: "shop".to_string(),
            max_concurrency: 2,
        })
    }

    fn job(document: &str) -> DocumentJob {
        DocumentJob {
            document: document.to_string(),
            locator: ArtifactLocator {
                artifact: document.to_string(),
                url: format!("mem://artifacts/{}", document),
                token: None,
            },
            parameters: BTreeMap::new(),
            mode: DeploymentMode::Complete,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf025_tier_all_succeed() {
        let plane = Arc::new(ScriptedControlPlane::default());
        let outcomes = deploy_tier(ctx(plane.clone(), 60), vec![job("T1"), job("T2"), job("T3")]).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.succeeded()));
        assert_eq!(outcomes[1].document, "T2");
        assert_eq!(plane.submitted().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf025_conflict_switches_to_incremental_once() {
        let plane = Arc::new(ScriptedControlPlane::default().script(
            "T1",
            vec![Outcome::Fail(vec![Diagnostic::new("Conflict", "in use")])],
        ));
        let outcomes = deploy_tier(ctx(plane.clone(), 60), vec![job("T1")]).await;
        assert!(outcomes[0].succeeded());
        assert!(outcomes[0].conflict_retried);
        assert_eq!(outcomes[0].mode, DeploymentMode::Incremental);
        let modes: Vec<_> = plane.submitted().iter().map(|s| s.mode).collect();
        assert_eq!(modes, vec![DeploymentMode::Complete, DeploymentMode::Incremental]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf025_second_conflict_fails() {
        let plane = Arc::new(ScriptedControlPlane::default().script(
            "T1",
            vec![
                Outcome::Reject(PlatformError::Conflict("busy".into())),
                Outcome::Reject(PlatformError::Conflict("still busy".into())),
            ],
        ));
        let outcomes = deploy_tier(ctx(plane.clone(), 60), vec![job("T1")]).await;
        assert_eq!(outcomes[0].status, DocumentStatus::Failed);
        assert!(matches!(outcomes[0].error, Some(PlatformError::Conflict(_))));
        assert_eq!(plane.submitted().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf025_transient_submit_retried() {
        let plane = Arc::new(ScriptedControlPlane::default().script(
            "T1",
            vec![Outcome::Reject(PlatformError::Transient("503".into()))],
        ));
        let outcomes = deploy_tier(ctx(plane, 60), vec![job("T1")]).await;
        assert!(outcomes[0].succeeded());
        assert_eq!(outcomes[0].attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf025_failure_does_not_abort_siblings() {
        let plane = Arc::new(ScriptedControlPlane::default().script(
            "T2",
            vec![Outcome::Fail(vec![Diagnostic::new("InvalidTemplate", "bad sku")])],
        ));
        let outcomes = deploy_tier(ctx(plane, 60), vec![job("T1"), job("T2"), job("T3")]).await;
        assert!(outcomes[0].succeeded());
        assert_eq!(outcomes[1].status, DocumentStatus::Failed);
        assert!(matches!(
            outcomes[1].error,
            Some(PlatformError::TemplateSchema { .. })
        ));
        assert!(outcomes[2].succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf025_deadline_marks_timed_out() {
        let plane = Arc::new(
            ScriptedControlPlane::default().script("T2", vec![Outcome::Hang]),
        );
        let outcomes = deploy_tier(ctx(plane, 5), vec![job("T1"), job("T2")]).await;
        assert!(outcomes[0].succeeded());
        assert_eq!(outcomes[1].status, DocumentStatus::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf025_deadline_while_waiting_for_slot_not_attempted() {
        let plane = Arc::new(
            ScriptedControlPlane::default()
                .script("T1", vec![Outcome::Hang])
                .script("T2", vec![Outcome::Hang]),
        );
        let outcomes =
            deploy_tier(ctx(plane.clone(), 5), vec![job("T1"), job("T2"), job("T3")]).await;

        let statuses: Vec<DocumentStatus> = outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![
                DocumentStatus::TimedOut,
                DocumentStatus::TimedOut,
                DocumentStatus::NotAttempted
            ]
        );
        assert_eq!(plane.submitted_documents(), vec!["T1", "T2"]);
        assert!(outcomes[2].handle.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sf025_rollback_reverse_tier_order() {
        let plane = Arc::new(ScriptedControlPlane::default());
        let outcomes = rollback(
            ctx(plane.clone(), 60),
            vec![vec![job("T1")], vec![], vec![job("T3")]],
        )
        .await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(plane.submitted_documents(), vec!["T3", "T1"]);
    }

    #[test]
    fn test_sf025_platform_deployment_name() {
        assert_eq!(platform_deployment_name("shop", "T2"), "shop-T2");
    }
}
