//! SF-020: Deployment run types. Phases, per-artifact and per-document
//! records, the persisted `DeploymentState`, and provenance events.

use crate::core::types::{DeploymentMode, DeploymentTier};
use crate::platform::ArtifactLocator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Orchestrator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Preparing,
    Uploading,
    Deploying,
    Validating,
    RollingBack,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preparing => write!(f, "PREPARING"),
            Self::Uploading => write!(f, "UPLOADING"),
            Self::Deploying => write!(f, "DEPLOYING"),
            Self::Validating => write!(f, "VALIDATING"),
            Self::RollingBack => write!(f, "ROLLING-BACK"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// What an uploaded artifact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Template,
    Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploaded,
    Failed,
}

/// Upload bookkeeping for one artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub kind: ArtifactKind,
    pub status: UploadStatus,
    pub attempts: u32,
    pub failed_attempts: u32,
    #[serde(default)]
    pub locator: Option<ArtifactLocator>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ArtifactRecord {
    pub fn pending(kind: ArtifactKind) -> Self {
        Self {
            kind,
            status: UploadStatus::Pending,
            attempts: 0,
            failed_attempts: 0,
            locator: None,
            content_hash: None,
            last_error: None,
        }
    }
}

/// Per-document deployment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Submitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    NotAttempted,
    RolledBack,
}

impl DocumentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::NotAttempted | Self::RolledBack
        )
    }

    /// Whether this run touched the document on the platform.
    pub fn was_submitted(self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Running | Self::Succeeded | Self::Failed | Self::TimedOut
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::TimedOut => write!(f, "TIMED-OUT"),
            Self::NotAttempted => write!(f, "NOT-ATTEMPTED"),
            Self::RolledBack => write!(f, "ROLLED-BACK"),
        }
    }
}

/// Deployment bookkeeping for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub tier: usize,
    pub status: DocumentStatus,
    pub mode: DeploymentMode,
    #[serde(default)]
    pub handle: Option<String>,
    pub attempts: u32,
    #[serde(default)]
    pub conflict_retried: bool,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub resource_statuses: BTreeMap<String, String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl DocumentRecord {
    pub fn pending(tier: usize, mode: DeploymentMode) -> Self {
        Self {
            tier,
            status: DocumentStatus::Pending,
            mode,
            handle: None,
            attempts: 0,
            conflict_retried: false,
            parameters: BTreeMap::new(),
            outputs: BTreeMap::new(),
            resource_statuses: BTreeMap::new(),
            errors: Vec::new(),
            finished_at: None,
        }
    }
}

/// Rollback availability and outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackState {
    /// `rollback_on_failure` was set for this run
    pub enabled: bool,
    /// A restore checkpoint exists for this run
    pub available: bool,
    pub executed: bool,
    #[serde(default)]
    pub restored: Vec<String>,
    #[serde(default)]
    pub skipped: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Last successful deployment of a document, the rollback target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownGood {
    pub run_id: String,
    pub locator: ArtifactLocator,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub deployed_at: DateTime<Utc>,
}

/// Durable per-run state, persisted after every phase and tier transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    pub schema: String,
    pub run_id: String,
    pub name: String,
    pub generator: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phase: RunPhase,
    #[serde(default)]
    pub current_tier: Option<usize>,
    #[serde(default)]
    pub tiers: Vec<DeploymentTier>,
    #[serde(default)]
    pub uploads: BTreeMap<String, ArtifactRecord>,
    #[serde(default)]
    pub documents: BTreeMap<String, DocumentRecord>,
    #[serde(default)]
    pub rollback: RollbackState,
    #[serde(default)]
    pub known_good: BTreeMap<String, KnownGood>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl DeploymentState {
    /// Documents grouped by status, in tier order.
    pub fn documents_with(&self, status: DocumentStatus) -> Vec<String> {
        self.tiers
            .iter()
            .flat_map(|t| t.documents.iter())
            .filter(|d| self.documents.get(*d).map(|r| r.status) == Some(status))
            .cloned()
            .collect()
    }

    pub fn is_resumable(&self) -> bool {
        !self.phase.is_terminal()
    }
}

/// Provenance event for the JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeployEvent {
    RunStarted {
        run_id: String,
        name: String,
        version: String,
        resumed: bool,
    },
    PhaseChanged {
        run_id: String,
        from: RunPhase,
        to: RunPhase,
    },
    ArtifactUploaded {
        run_id: String,
        artifact: String,
        attempts: u32,
    },
    ArtifactFailed {
        run_id: String,
        artifact: String,
        attempts: u32,
        error: String,
    },
    TierStarted {
        run_id: String,
        tier: usize,
        documents: Vec<String>,
    },
    DocumentFinished {
        run_id: String,
        document: String,
        status: DocumentStatus,
        attempts: u32,
    },
    RollbackFinished {
        run_id: String,
        restored: Vec<String>,
        skipped: Vec<String>,
    },
    RunFinished {
        run_id: String,
        phase: RunPhase,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: DeployEvent,
}
