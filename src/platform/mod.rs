//! SF-011: Platform collaborators. Artifact store and control plane.
//!
//! The orchestrator only talks to these traits. `local` provides
//! filesystem/in-process backends used by the CLI and end-to-end tests.

pub mod local;

use crate::core::types::DeploymentMode;
use crate::error::PlatformError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// One platform diagnostic (error code + message).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub target: Option<String>,
}

impl Diagnostic {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            target: None,
        }
    }
}

/// Time-limited access token for an uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Addressable uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocator {
    pub artifact: String,
    pub url: String,
    #[serde(default)]
    pub token: Option<AccessToken>,
}

impl ArtifactLocator {
    /// Usable until `now + margin` with its current token.
    pub fn is_usable(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        self.token
            .as_ref()
            .is_some_and(|t| t.is_valid_at(now + margin))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentHandle(pub String);

/// A deployment submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    /// Platform deployment name, stable per graph and document
    pub name: String,
    pub document: String,
    pub locator: ArtifactLocator,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub mode: DeploymentMode,
    pub run_id: String,
}

/// Platform-side deployment phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformPhase {
    Accepted,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl PlatformPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Progress rank; status never moves to a lower rank.
    pub fn rank(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed | Self::Canceled => 2,
        }
    }
}

/// Result of `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub phase: PlatformPhase,
    /// Per-resource provisioning state
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<Diagnostic>,
}

impl DeploymentStatus {
    pub fn in_phase(phase: PlatformPhase) -> Self {
        Self {
            phase,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            errors: Vec::new(),
        }
    }
}

/// Staging store for documents and payloads.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Provision (or confirm) the staging container.
    async fn ensure_container(&self) -> Result<(), PlatformError>;

    /// Upload bytes under `name`; returns the artifact URL.
    async fn put_blob(&self, name: &str, bytes: Vec<u8>) -> Result<String, PlatformError>;

    async fn issue_access_token(
        &self,
        url: &str,
        ttl: Duration,
    ) -> Result<AccessToken, PlatformError>;
}

/// Resource-management control plane.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn check_connectivity(&self) -> Result<(), PlatformError>;

    async fn submit_deployment(
        &self,
        request: DeploymentRequest,
    ) -> Result<DeploymentHandle, PlatformError>;

    async fn get_status(&self, handle: &DeploymentHandle)
        -> Result<DeploymentStatus, PlatformError>;
}
