//! SF-000: Error taxonomy for synthesis and deployment.
//!
//! Every fatal error names the offending resource or document, the violated
//! constraint, and a remedy where one can be derived mechanically.

use crate::platform::Diagnostic;
use thiserror::Error;

/// Malformed graphs, cycles, unsatisfiable co-location and bad limits.
/// Always raised before any network call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("graph parse error: {0}")]
    Parse(String),

    #[error("resource at position {index} has an empty id; give every resource a unique id")]
    EmptyId { index: usize },

    #[error(
        "resource id '{id}' is invalid; ids may only contain letters, digits, '-' and '_'"
    )]
    InvalidId { id: String },

    #[error(
        "duplicate resource id '{id}' (positions {first} and {second}); rename one of them"
    )]
    DuplicateId {
        id: String,
        first: usize,
        second: usize,
    },

    #[error(
        "resources '{first}' and '{second}' share type and name '{name}'; give one an explicit distinct name"
    )]
    DuplicateAddress {
        first: String,
        second: String,
        name: String,
    },

    #[error("resource '{id}' has an empty type tag")]
    EmptyType { id: String },

    #[error(
        "resource '{id}' depends on unknown resource '{dependency}'; declare '{dependency}' or remove the dependency"
    )]
    UnknownDependency { id: String, dependency: String },

    #[error("resource '{id}' depends on itself; remove the self reference")]
    SelfDependency { id: String },

    #[error(
        "resource '{id}' has a malformed reference '{placeholder}'; write references as ${{ref:<id>}} or ${{ref:<id>.<attribute>}}"
    )]
    MalformedReference { id: String, placeholder: String },

    #[error("dependency cycle detected involving: {}", .members.join(", "))]
    DependencyCycle { members: Vec<String> },

    #[error(
        "co-location group '{group}' ({members} resources, ~{size} bytes) cannot fit any single document (limits: {max_resources} resources, {max_size} bytes); raise the limits or shrink the group"
    )]
    ColocationOverflow {
        group: String,
        members: usize,
        size: u64,
        max_resources: usize,
        max_size: u64,
    },

    #[error(
        "resource '{id}' (~{size} bytes) cannot fit any document under the {max_size}-byte limit; reduce its properties or raise max_template_size_bytes"
    )]
    ResourceTooLarge { id: String, size: u64, max_size: u64 },

    #[error("document dependency cycle: {}; documents must be orderable", .path.join(" -> "))]
    DocumentCycle { path: Vec<String> },

    #[error("invalid limits: {0}")]
    InvalidLimits(String),
}

/// Failures while rendering documents. All fatal; output is never truncated.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error(
        "document '{document}' renders to {actual} bytes (estimated {estimated}), over the {limit}-byte limit; lower the size limit used for assignment to leave headroom"
    )]
    SizeEstimationViolation {
        document: String,
        actual: u64,
        estimated: u64,
        limit: u64,
    },

    #[error(
        "document '{document}' holds {count} resources, over the limit of {limit}; raise max_resources_per_template or re-run assignment with the same limits"
    )]
    TooManyResources {
        document: String,
        count: usize,
        limit: usize,
    },

    #[error(
        "document '{document}' declares {count} parameters, over the limit of {limit}; reduce cross-document references into this document"
    )]
    TooManyParameters {
        document: String,
        count: usize,
        limit: usize,
    },

    #[error(
        "document '{document}' declares {count} outputs, over the limit of {limit}; reduce cross-document references out of this document"
    )]
    TooManyOutputs {
        document: String,
        count: usize,
        limit: usize,
    },

    #[error("document '{document}' still contains unresolved reference '{placeholder}'")]
    UnresolvedPlaceholder {
        document: String,
        placeholder: String,
    },

    #[error("resource '{id}' has no document assignment")]
    Unassigned { id: String },

    #[error(
        "document '{document}' addresses '{target}' directly but it lives in another document"
    )]
    DirectCrossReference { document: String, target: String },

    #[error("document '{document}' reads undeclared parameter '{parameter}'")]
    UndeclaredParameter { document: String, parameter: String },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Classified collaborator errors from the artifact store or control plane.
#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("transient platform error: {0}")]
    Transient(String),

    #[error("resource conflict: {0}")]
    Conflict(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("template rejected: {message}{}", render_diagnostics(.diagnostics))]
    TemplateSchema {
        message: String,
        diagnostics: Vec<Diagnostic>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| format!("\n  [{}] {}", d.code, d.message))
        .collect()
}

impl PlatformError {
    /// Only network blips and throttling are retried by policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Classify a failed deployment by its platform diagnostic codes.
    pub fn from_diagnostics(diagnostics: &[Diagnostic]) -> Self {
        let summary = diagnostics
            .iter()
            .map(|d| format!("{}: {}", d.code, d.message))
            .collect::<Vec<_>>()
            .join("; ");
        let has = |needles: &[&str]| {
            diagnostics
                .iter()
                .any(|d| needles.iter().any(|n| d.code.eq_ignore_ascii_case(n)))
        };

        if has(&["Conflict", "ResourceConflict", "AnotherOperationInProgress"]) {
            Self::Conflict(summary)
        } else if has(&["QuotaExceeded", "OperationNotAllowed"]) {
            Self::Quota(summary)
        } else if has(&["InvalidTemplate", "InvalidTemplateDeployment", "MissingParameter"]) {
            Self::TemplateSchema {
                message: "deployment validation failed".to_string(),
                diagnostics: diagnostics.to_vec(),
            }
        } else if has(&["TooManyRequests", "ServiceUnavailable", "InternalServerError"]) {
            Self::Transient(summary)
        } else if summary.is_empty() {
            Self::Other("deployment failed without diagnostics".to_string())
        } else {
            Self::Other(summary)
        }
    }
}

/// Run-level deployment failures.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("preparation failed: {0}")]
    Preparation(#[source] PlatformError),

    #[error("document '{document}': {source}")]
    Platform {
        document: String,
        #[source]
        source: PlatformError,
    },

    #[error(
        "upload of '{artifact}' failed after {attempts} attempt(s): {last_error}; check store connectivity or raise retry_policy.max_attempts"
    )]
    UploadExhausted {
        artifact: String,
        attempts: u32,
        last_error: String,
    },

    #[error("cannot read payload '{name}' from {path}: {reason}")]
    PayloadUnreadable {
        name: String,
        path: String,
        reason: String,
    },

    #[error(
        "document '{document}' needs output '{output}' of '{producer}', which did not report it"
    )]
    MissingOutput {
        document: String,
        producer: String,
        output: String,
    },

    #[error(
        "tier {tier} failed: failed [{}], succeeded [{}], not attempted [{}]",
        .failed.join(", "),
        .succeeded.join(", "),
        .not_attempted.join(", ")
    )]
    TierFailed {
        tier: usize,
        failed: Vec<String>,
        succeeded: Vec<String>,
        not_attempted: Vec<String>,
    },

    #[error(
        "deployment exceeded {minutes} minute(s); pending: [{}]; raise deployment_timeout_minutes",
        .pending.join(", ")
    )]
    Timeout { minutes: u64, pending: Vec<String> },

    #[error("deployment cancelled after {completed_tiers} tier(s)")]
    Cancelled { completed_tiers: usize },

    #[error("nothing to resume: {0}")]
    NothingToResume(String),

    #[error("state error: {0}")]
    State(String),
}

/// Umbrella error for the full pipeline and the CLI.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("deployment error: {0}")]
    Deploy(#[from] DeployError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag(code: &str) -> Diagnostic {
        Diagnostic {
            code: code.to_string(),
            message: "boom".to_string(),
            target: None,
        }
    }

    #[test]
    fn test_sf000_classify_conflict() {
        let err = PlatformError::from_diagnostics(&[diag("Conflict")]);
        assert!(err.is_conflict());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_sf000_classify_quota_and_schema() {
        assert!(matches!(
            PlatformError::from_diagnostics(&[diag("QuotaExceeded")]),
            PlatformError::Quota(_)
        ));
        let schema = PlatformError::from_diagnostics(&[diag("InvalidTemplate")]);
        assert!(matches!(schema, PlatformError::TemplateSchema { .. }));
        assert!(schema.to_string().contains("[InvalidTemplate] boom"));
    }

    #[test]
    fn test_sf000_classify_transient_and_other() {
        assert!(PlatformError::from_diagnostics(&[diag("TooManyRequests")]).is_transient());
        assert!(matches!(
            PlatformError::from_diagnostics(&[]),
            PlatformError::Other(_)
        ));
    }

    #[test]
    fn test_sf000_messages_name_subject_and_remedy() {
        let e = ValidationError::ColocationOverflow {
            group: "web".to_string(),
            members: 3,
            size: 9000,
            max_resources: 800,
            max_size: 4000,
        };
        let msg = e.to_string();
        assert!(msg.contains("'web'"));
        assert!(msg.contains("raise the limits"));

        let e = ValidationError::DependencyCycle {
            members: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(e.to_string(), "dependency cycle detected involving: a, b");

        let e = DeployError::TierFailed {
            tier: 1,
            failed: vec!["T2".to_string()],
            succeeded: vec![],
            not_attempted: vec!["T3".to_string()],
        };
        assert!(e.to_string().contains("failed [T2]"));
        assert!(e.to_string().contains("not attempted [T3]"));
    }

    #[test]
    fn test_sf000_malformed_reference_braces() {
        let e = ValidationError::MalformedReference {
            id: "x".to_string(),
            placeholder: "${ref:".to_string(),
        };
        assert!(e.to_string().contains("${ref:<id>}"));
    }
}
