//! SF-026: Deployment orchestrator. The run state machine.
//!
//! Preparing → Uploading → Deploying → Validating → Completed, with Failed
//! reachable from every phase and RollingBack entered before Failed when a
//! tier fails with rollback enabled. The orchestrator owns the
//! `DeploymentState`; workers hand results back over join handles and the
//! state is persisted after every phase and tier transition.

use super::engine::{self, DocumentJob, DocumentOutcome, TierContext};
use super::monitor::PollPolicy;
use super::retry::with_retry;
use super::state::{load_state, new_state, save_state};
use super::types::*;
use super::uploader::{collect_artifacts, reissue_token, upload_all};
use crate::error::DeployError;
use crate::pipeline::CompiledPlan;
use crate::platform::{ArtifactStore, ControlPlane};
use crate::provenance::eventlog::{append_event, generate_run_id};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Final state of a run plus the error that ended it, if any.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: DeploymentState,
    pub error: Option<DeployError>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.state.phase == RunPhase::Completed
    }

    pub fn into_result(self) -> Result<DeploymentState, DeployError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.state),
        }
    }
}

/// Drives compiled plans against an artifact store and a control plane.
pub struct Orchestrator {
    store: Arc<dyn ArtifactStore>,
    control_plane: Arc<dyn ControlPlane>,
    state_dir: PathBuf,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        control_plane: Arc<dyn ControlPlane>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            control_plane,
            state_dir: state_dir.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token checked at tier boundaries; cancel it to stop after the
    /// in-flight tier.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a fresh run. Known-good entries of the previous run carry over
    /// as rollback targets.
    #[tracing::instrument(skip_all, fields(deployment = %plan.name))]
    pub async fn deploy(&self, plan: &CompiledPlan) -> Result<RunOutcome, DeployError> {
        let previous = load_state(&self.state_dir, &plan.name)?;
        let mut state = new_state(&generate_run_id(), &plan.name, &plan.tiers, &plan.config);
        if let Some(previous) = previous {
            if previous.is_resumable() {
                tracing::warn!(
                    run_id = %previous.run_id,
                    phase = %previous.phase,
                    "previous run was interrupted; starting a fresh run"
                );
            }
            state.known_good = previous.known_good;
        }
        Ok(self.drive(plan, state, false).await)
    }

    /// Continue an interrupted run: valid uploads are reused and documents
    /// that already succeeded are skipped.
    #[tracing::instrument(skip_all, fields(deployment = %plan.name))]
    pub async fn resume(&self, plan: &CompiledPlan) -> Result<RunOutcome, DeployError> {
        let mut state = load_state(&self.state_dir, &plan.name)?.ok_or_else(|| {
            DeployError::NothingToResume(format!("no recorded run for '{}'", plan.name))
        })?;
        if !state.is_resumable() {
            return Err(DeployError::NothingToResume(format!(
                "run {} already finished as {}",
                state.run_id, state.phase
            )));
        }
        if state.tiers != plan.tiers {
            return Err(DeployError::State(format!(
                "document tiers of '{}' changed since run {}; start a fresh deployment",
                plan.name, state.run_id
            )));
        }

        for record in state.documents.values_mut() {
            if record.status != DocumentStatus::Succeeded {
                record.status = DocumentStatus::Pending;
                record.errors.clear();
            }
        }
        state.errors.clear();
        state.current_tier = None;
        tracing::info!(
            run_id = %state.run_id,
            succeeded = state.documents_with(DocumentStatus::Succeeded).len(),
            "resuming run"
        );
        Ok(self.drive(plan, state, true).await)
    }

    async fn drive(&self, plan: &CompiledPlan, state: DeploymentState, resumed: bool) -> RunOutcome {
        let run_timeout = Duration::from_secs(plan.config.deployment_timeout_minutes * 60);
        let mut run = Run {
            orch: self,
            plan,
            state,
            started: Instant::now(),
            deadline: Instant::now() + run_timeout,
            run_timeout,
        };
        run.event(DeployEvent::RunStarted {
            run_id: run.state.run_id.clone(),
            name: plan.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            resumed,
        });

        let error = match run.execute().await {
            Ok(()) => None,
            Err(err) => Some(run.fail(err).await),
        };

        let total_seconds = run.started.elapsed().as_secs_f64();
        run.event(DeployEvent::RunFinished {
            run_id: run.state.run_id.clone(),
            phase: run.state.phase,
            total_seconds,
        });
        match &error {
            None => tracing::info!(phase = %run.state.phase, total_seconds, "run finished"),
            Some(err) => tracing::error!(error = %err, total_seconds, "run failed"),
        }
        RunOutcome {
            state: run.state,
            error,
        }
    }
}

/// One run in progress.
struct Run<'a> {
    orch: &'a Orchestrator,
    plan: &'a CompiledPlan,
    state: DeploymentState,
    started: Instant,
    deadline: Instant,
    run_timeout: Duration,
}

impl Run<'_> {
    fn event(&self, event: DeployEvent) {
        if let Err(e) = append_event(&self.orch.state_dir, &self.state.name, event) {
            tracing::warn!(error = %e, "cannot append deployment event");
        }
    }

    fn persist(&mut self) -> Result<(), DeployError> {
        self.state.updated_at = Utc::now();
        save_state(&self.orch.state_dir, &self.state)
    }

    fn transition(&mut self, to: RunPhase) -> Result<(), DeployError> {
        let from = self.state.phase;
        self.state.phase = to;
        tracing::info!(%from, %to, "phase transition");
        self.event(DeployEvent::PhaseChanged {
            run_id: self.state.run_id.clone(),
            from,
            to,
        });
        self.persist()
    }

    fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.plan.config.artifact_token_ttl_minutes * 60)
    }

    fn tier_context(&self, deadline: Instant) -> TierContext {
        let config = &self.plan.config;
        TierContext {
            control_plane: Arc::clone(&self.orch.control_plane),
            retry: config.retry_policy.clone(),
            poll: PollPolicy::from_config(config),
            deadline,
            run_id: self.state.run_id.clone(),
            deployment_name: self.state.name.clone(),
            max_concurrency: config.max_deploy_concurrency,
        }
    }

    async fn execute(&mut self) -> Result<(), DeployError> {
        self.prepare().await?;
        self.upload().await?;
        self.deploy_tiers().await?;
        if self.plan.config.validate_after_deploy {
            self.transition(RunPhase::Validating)?;
            self.validate();
        }
        self.complete()
    }

    async fn prepare(&mut self) -> Result<(), DeployError> {
        if self.state.phase == RunPhase::Preparing {
            self.persist()?;
        } else {
            self.transition(RunPhase::Preparing)?;
        }
        let retry = &self.plan.config.retry_policy;
        let store = self.orch.store.as_ref();
        let plane = self.orch.control_plane.as_ref();
        with_retry(retry, "ensure_container", |_| store.ensure_container())
            .await
            .value
            .map_err(DeployError::Preparation)?;
        with_retry(retry, "check_connectivity", |_| plane.check_connectivity())
            .await
            .value
            .map_err(DeployError::Preparation)?;
        Ok(())
    }

    async fn upload(&mut self) -> Result<(), DeployError> {
        self.transition(RunPhase::Uploading)?;
        let config = &self.plan.config;
        let artifacts =
            collect_artifacts(&self.plan.synthesis, &self.plan.payloads, &self.plan.base_dir)?;

        let now = Utc::now();
        let (reused, fresh): (Vec<_>, Vec<_>) = artifacts.into_iter().partition(|a| {
            self.state.uploads.get(&a.key).is_some_and(|r| {
                r.status == UploadStatus::Uploaded
                    && r.content_hash.as_deref() == Some(a.content_hash.as_str())
                    && r.locator
                        .as_ref()
                        .is_some_and(|l| l.is_usable(now, self.run_timeout))
            })
        });
        for artifact in &reused {
            tracing::debug!(artifact = %artifact.key, "reusing upload");
        }
        for artifact in &fresh {
            self.state
                .uploads
                .insert(artifact.key.clone(), ArtifactRecord::pending(artifact.kind));
        }

        let reports = upload_all(
            Arc::clone(&self.orch.store),
            fresh,
            &config.retry_policy,
            config.max_upload_concurrency,
            self.token_ttl(),
        )
        .await;

        let mut first_failure = None;
        for report in reports {
            let failed_attempts = report.outcome.failed_attempts();
            let record = self
                .state
                .uploads
                .entry(report.artifact.clone())
                .or_insert_with(|| ArtifactRecord::pending(ArtifactKind::Template));
            record.attempts = report.outcome.attempts;
            record.failed_attempts = failed_attempts;
            record.content_hash = Some(report.content_hash.clone());
            match report.outcome.value {
                Ok(locator) => {
                    record.status = UploadStatus::Uploaded;
                    record.locator = Some(locator);
                    record.last_error = None;
                    self.event(DeployEvent::ArtifactUploaded {
                        run_id: self.state.run_id.clone(),
                        artifact: report.artifact,
                        attempts: report.outcome.attempts,
                    });
                }
                Err(err) => {
                    record.status = UploadStatus::Failed;
                    record.last_error = Some(err.to_string());
                    self.event(DeployEvent::ArtifactFailed {
                        run_id: self.state.run_id.clone(),
                        artifact: report.artifact.clone(),
                        attempts: report.outcome.attempts,
                        error: err.to_string(),
                    });
                    first_failure.get_or_insert(DeployError::UploadExhausted {
                        artifact: report.artifact,
                        attempts: report.outcome.attempts,
                        last_error: err.to_string(),
                    });
                }
            }
        }
        self.persist()?;
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Bind parameters from producer outputs recorded in this state.
    fn build_job(&self, document: &str) -> Result<DocumentJob, DeployError> {
        let template = self.plan.synthesis.template(document).ok_or_else(|| {
            DeployError::State(format!("document '{}' is not part of the plan", document))
        })?;
        let locator = self
            .state
            .uploads
            .get(document)
            .and_then(|u| u.locator.clone())
            .ok_or_else(|| DeployError::State(format!("document '{}' was not uploaded", document)))?;

        let mut parameters = BTreeMap::new();
        for binding in &template.parameter_bindings {
            let value = self
                .state
                .documents
                .get(&binding.producer)
                .and_then(|r| r.outputs.get(&binding.output))
                .cloned()
                .ok_or_else(|| DeployError::MissingOutput {
                    document: document.to_string(),
                    producer: binding.producer.clone(),
                    output: binding.output.clone(),
                })?;
            parameters.insert(binding.parameter.clone(), value);
        }
        Ok(DocumentJob {
            document: document.to_string(),
            locator,
            parameters,
            mode: self.plan.config.deployment_mode,
        })
    }

    fn mark_pending(&mut self, status: DocumentStatus) {
        for record in self.state.documents.values_mut() {
            if record.status == DocumentStatus::Pending {
                record.status = status;
            }
        }
    }

    fn apply(&mut self, outcome: DocumentOutcome) {
        let tier = self.state.current_tier.unwrap_or_default();
        let mode = outcome.mode;
        let record = self
            .state
            .documents
            .entry(outcome.document.clone())
            .or_insert_with(|| DocumentRecord::pending(tier, mode));
        record.status = outcome.status;
        record.mode = outcome.mode;
        record.conflict_retried = outcome.conflict_retried;
        record.attempts += outcome.attempts;
        record.handle = outcome.handle;
        record.outputs = outcome.outputs;
        record.resource_statuses = outcome.resource_statuses;
        record.errors.extend(outcome.errors);
        record.finished_at = Some(Utc::now());
        let attempts = record.attempts;

        if let Some(source) = outcome.error {
            let err = DeployError::Platform {
                document: outcome.document.clone(),
                source,
            };
            self.state.errors.push(err.to_string());
        }
        self.event(DeployEvent::DocumentFinished {
            run_id: self.state.run_id.clone(),
            document: outcome.document,
            status: outcome.status,
            attempts,
        });
    }

    async fn deploy_tiers(&mut self) -> Result<(), DeployError> {
        if self.state.rollback.enabled {
            self.state.rollback.available = true;
        }
        self.transition(RunPhase::Deploying)?;
        let ctx = Arc::new(self.tier_context(self.deadline));
        let plan = self.plan;

        for tier in &plan.tiers {
            if self.orch.cancel.is_cancelled() {
                tracing::warn!(tier = tier.index, "cancelled before tier");
                self.mark_pending(DocumentStatus::NotAttempted);
                self.persist()?;
                return Err(DeployError::Cancelled {
                    completed_tiers: tier.index,
                });
            }
            if Instant::now() >= self.deadline {
                return self.timed_out();
            }

            let mut jobs = Vec::with_capacity(tier.documents.len());
            let mut binding_error = None;
            for document in &tier.documents {
                let done = self
                    .state
                    .documents
                    .get(document)
                    .is_some_and(|r| r.status == DocumentStatus::Succeeded);
                if done {
                    tracing::debug!(%document, "already succeeded, skipping");
                    continue;
                }
                let job = self.build_job(document);
                let record = self
                    .state
                    .documents
                    .entry(document.clone())
                    .or_insert_with(|| DocumentRecord::pending(tier.index, plan.config.deployment_mode));
                match job {
                    Ok(job) => {
                        record.parameters = job.parameters.clone();
                        jobs.push(job);
                    }
                    Err(err) => {
                        record.status = DocumentStatus::Failed;
                        record.errors.push(err.to_string());
                        binding_error.get_or_insert(err);
                    }
                }
            }

            self.state.current_tier = Some(tier.index);
            tracing::info!(tier = tier.index, documents = jobs.len(), "tier started");
            self.event(DeployEvent::TierStarted {
                run_id: self.state.run_id.clone(),
                tier: tier.index,
                documents: jobs.iter().map(|j| j.document.clone()).collect(),
            });
            self.persist()?;

            for outcome in engine::deploy_tier(Arc::clone(&ctx), jobs).await {
                self.apply(outcome);
            }

            let in_tier = |status: DocumentStatus, state: &DeploymentState| -> Vec<String> {
                tier.documents
                    .iter()
                    .filter(|d| state.documents.get(*d).map(|r| r.status) == Some(status))
                    .cloned()
                    .collect()
            };
            let unfinished = !in_tier(DocumentStatus::TimedOut, &self.state).is_empty()
                || !in_tier(DocumentStatus::NotAttempted, &self.state).is_empty();
            if unfinished {
                return self.timed_out();
            }
            if let Some(err) = binding_error {
                self.mark_pending(DocumentStatus::NotAttempted);
                self.persist()?;
                return Err(err);
            }
            let failed = in_tier(DocumentStatus::Failed, &self.state);
            if !failed.is_empty() {
                self.mark_pending(DocumentStatus::NotAttempted);
                self.persist()?;
                return Err(DeployError::TierFailed {
                    tier: tier.index,
                    failed,
                    succeeded: self.state.documents_with(DocumentStatus::Succeeded),
                    not_attempted: self.state.documents_with(DocumentStatus::NotAttempted),
                });
            }
            self.persist()?;
        }
        self.state.current_tier = None;
        Ok(())
    }

    /// Documents in flight at the deadline are already `TimedOut`; nothing
    /// else was submitted, so every pending document becomes `NotAttempted`.
    fn timed_out(&mut self) -> Result<(), DeployError> {
        self.mark_pending(DocumentStatus::NotAttempted);
        self.persist()?;
        let mut pending = self.state.documents_with(DocumentStatus::TimedOut);
        pending.extend(self.state.documents_with(DocumentStatus::NotAttempted));
        Err(DeployError::Timeout {
            minutes: self.plan.config.deployment_timeout_minutes,
            pending,
        })
    }

    /// Non-fatal post-deployment checks.
    fn validate(&mut self) {
        let now = Utc::now();
        let mut warnings = Vec::new();
        for template in &self.plan.synthesis.templates {
            let Some(record) = self.state.documents.get(&template.document_id) else {
                continue;
            };
            for (resource, status) in &record.resource_statuses {
                if status != "Succeeded" {
                    warnings.push(format!(
                        "document '{}': resource '{}' finished as {}",
                        template.document_id, resource, status
                    ));
                }
            }
            for output in template.document.outputs.keys() {
                if !record.outputs.contains_key(output) {
                    warnings.push(format!(
                        "document '{}': declared output '{}' missing from deployment outputs",
                        template.document_id, output
                    ));
                }
            }
        }
        for (artifact, upload) in &self.state.uploads {
            let expired = upload.status == UploadStatus::Uploaded
                && upload
                    .locator
                    .as_ref()
                    .is_some_and(|l| !l.is_usable(now, Duration::ZERO));
            if expired {
                warnings.push(format!(
                    "access token for '{}' expired before deployment finished",
                    artifact
                ));
            }
        }
        for warning in &warnings {
            tracing::warn!("{}", warning);
        }
        self.state.warnings.extend(warnings);
    }

    fn complete(&mut self) -> Result<(), DeployError> {
        let now = Utc::now();
        for document in self.state.documents_with(DocumentStatus::Succeeded) {
            let Some(locator) = self.state.uploads.get(&document).and_then(|u| u.locator.clone())
            else {
                continue;
            };
            let Some(record) = self.state.documents.get(&document) else {
                continue;
            };
            let entry = KnownGood {
                run_id: self.state.run_id.clone(),
                locator,
                parameters: record.parameters.clone(),
                deployed_at: record.finished_at.unwrap_or(now),
            };
            self.state.known_good.insert(document, entry);
        }
        self.transition(RunPhase::Completed)
    }

    /// Move to Failed, rolling back first when the failure happened while
    /// deploying and rollback is enabled.
    async fn fail(&mut self, err: DeployError) -> DeployError {
        let rollback = self.state.phase == RunPhase::Deploying
            && self.state.rollback.enabled
            && !matches!(err, DeployError::Cancelled { .. } | DeployError::State(_));
        self.state.errors.push(err.to_string());
        if rollback {
            if let Err(e) = self.roll_back().await {
                tracing::error!(error = %e, "cannot persist rollback state");
            }
        }
        if let Err(e) = self.transition(RunPhase::Failed) {
            tracing::error!(error = %e, "cannot persist failed state");
        }
        err
    }

    /// Redeploy the known-good version of every document this run touched,
    /// tiers in reverse order.
    async fn roll_back(&mut self) -> Result<(), DeployError> {
        self.transition(RunPhase::RollingBack)?;
        let plan = self.plan;
        let retry = &plan.config.retry_policy;
        let ttl = self.token_ttl();
        let mut groups: Vec<Vec<DocumentJob>> = vec![Vec::new(); plan.tiers.len()];

        for (position, tier) in plan.tiers.iter().enumerate() {
            for document in &tier.documents {
                let touched = self
                    .state
                    .documents
                    .get(document)
                    .is_some_and(|r| r.status.was_submitted());
                if !touched {
                    continue;
                }
                let Some(known_good) = self.state.known_good.get(document).cloned() else {
                    let warning = format!(
                        "no known-good state for '{}'; left as deployed by this run",
                        document
                    );
                    tracing::warn!("{}", warning);
                    self.state.rollback.skipped.push(document.clone());
                    self.state.warnings.push(warning);
                    continue;
                };
                match reissue_token(self.orch.store.as_ref(), &known_good.locator, retry, ttl).await
                {
                    Ok(locator) => groups[position].push(DocumentJob {
                        document: document.clone(),
                        locator,
                        parameters: known_good.parameters,
                        mode: plan.config.deployment_mode,
                    }),
                    Err(e) => self.state.rollback.errors.push(format!(
                        "{}: cannot re-issue access token: {}",
                        document, e
                    )),
                }
            }
        }

        let ctx = Arc::new(self.tier_context(Instant::now() + self.run_timeout));
        for outcome in engine::rollback(ctx, groups).await {
            if outcome.succeeded() {
                if let Some(record) = self.state.documents.get_mut(&outcome.document) {
                    record.status = DocumentStatus::RolledBack;
                }
                self.state.rollback.restored.push(outcome.document);
            } else {
                self.state.rollback.errors.push(format!(
                    "{}: {}",
                    outcome.document,
                    outcome.errors.join("; ")
                ));
            }
        }
        self.state.rollback.executed = true;
        self.state.rollback.available = true;
        self.event(DeployEvent::RollbackFinished {
            run_id: self.state.run_id.clone(),
            restored: self.state.rollback.restored.clone(),
            skipped: self.state.rollback.skipped.clone(),
        });
        self.persist()
    }
}
