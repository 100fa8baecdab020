//! SF-021: Deployment state file. Load, save (atomic), path derivation.

use super::types::*;
use crate::core::types::{DeployConfig, DeploymentTier};
use crate::error::DeployError;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const STATE_SCHEMA: &str = "1.0";

/// Derive the state file path for a deployment within the state directory.
pub fn state_file_path(state_dir: &Path, deployment: &str) -> PathBuf {
    state_dir.join(deployment).join("deployment.state.json")
}

/// Load a deployment's state. Returns None if no run was recorded yet.
pub fn load_state(state_dir: &Path, deployment: &str) -> Result<Option<DeploymentState>, DeployError> {
    let path = state_file_path(state_dir, deployment);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| DeployError::State(format!("cannot read {}: {}", path.display(), e)))?;
    let state: DeploymentState = serde_json::from_str(&content)
        .map_err(|e| DeployError::State(format!("invalid state file {}: {}", path.display(), e)))?;
    Ok(Some(state))
}

/// Save state atomically (write to temp, then rename).
pub fn save_state(state_dir: &Path, state: &DeploymentState) -> Result<(), DeployError> {
    let path = state_file_path(state_dir, &state.name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            DeployError::State(format!("cannot create dir {}: {}", parent.display(), e))
        })?;
    }

    let json = serde_json::to_string_pretty(state)
        .map_err(|e| DeployError::State(format!("serialize error: {}", e)))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json)
        .map_err(|e| DeployError::State(format!("cannot write {}: {}", tmp_path.display(), e)))?;
    std::fs::rename(&tmp_path, &path).map_err(|e| {
        DeployError::State(format!(
            "cannot rename {} → {}: {}",
            tmp_path.display(),
            path.display(),
            e
        ))
    })?;

    Ok(())
}

/// Fresh state for a new run: every document pending in its tier.
pub fn new_state(
    run_id: &str,
    name: &str,
    tiers: &[DeploymentTier],
    config: &DeployConfig,
) -> DeploymentState {
    let now = Utc::now();
    let documents: BTreeMap<String, DocumentRecord> = tiers
        .iter()
        .flat_map(|t| {
            t.documents
                .iter()
                .map(move |d| (d.clone(), DocumentRecord::pending(t.index, config.deployment_mode)))
        })
        .collect();

    DeploymentState {
        schema: STATE_SCHEMA.to_string(),
        run_id: run_id.to_string(),
        name: name.to_string(),
        generator: format!("shardform {}", env!("CARGO_PKG_VERSION")),
        started_at: now,
        updated_at: now,
        phase: RunPhase::Preparing,
        current_tier: None,
        tiers: tiers.to_vec(),
        uploads: BTreeMap::new(),
        documents,
        rollback: RollbackState {
            enabled: config.rollback_on_failure,
            ..RollbackState::default()
        },
        known_good: BTreeMap::new(),
        errors: Vec::new(),
        warnings: Vec::new(),
    }
}
