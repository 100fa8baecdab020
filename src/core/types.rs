//! SF-001: Graph, configuration, assignment and template types.
//!
//! Defines the YAML input schema (resource graph + deployment config) and the
//! immutable artifacts each synthesis phase hands to the next.

use crate::provenance::hasher;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Resource graph (input)
// ============================================================================

/// Root input: the declared resource graph.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResourceGraph {
    /// Deployment name (also the state directory name)
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Resources in declaration order
    #[serde(default)]
    pub resources: Vec<ResourceNode>,

    /// Binary payloads uploaded alongside the documents
    #[serde(default)]
    pub payloads: Vec<Payload>,

    /// Platform limits and deployment policy
    #[serde(default)]
    pub config: DeployConfig,
}

impl ResourceGraph {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&ResourceNode> {
        self.resources.iter().find(|n| n.id == id)
    }
}

/// A single declared cloud resource.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResourceNode {
    /// Stable unique id, used in `${ref:<id>}` placeholders
    pub id: String,

    /// Resource type tag (e.g. `Microsoft.Web/sites`)
    #[serde(rename = "type")]
    pub resource_type: String,

    /// API version emitted with the resource
    #[serde(default)]
    pub api_version: Option<String>,

    /// Platform name; defaults to the id
    #[serde(default)]
    pub name: Option<String>,

    /// Declared dependencies (resource ids)
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Opaque typed properties
    #[serde(default)]
    pub properties: serde_json::Value,

    /// Co-location group; all members land in one document
    #[serde(default)]
    pub colocate: Option<String>,

    /// Placement bias; yields to size limits
    #[serde(default)]
    pub affinity: Affinity,
}

impl ResourceNode {
    /// Name used when addressing this resource on the platform.
    ///
    /// Role assignments without an explicit name get a GUID derived from
    /// scope, role definition and principal, so identical logical assignments
    /// always produce identical names.
    pub fn effective_name(&self) -> String {
        if let Some(ref name) = self.name {
            return name.clone();
        }
        if self.resource_type.ends_with("/roleAssignments") {
            let field = |key: &str| {
                self.properties
                    .get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            let scope = field("scope");
            let role = field("roleDefinitionId");
            let principal = field("principalId");
            return hasher::deterministic_guid(&[&scope, &role, &principal]);
        }
        self.id.clone()
    }
}

/// Template affinity hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Affinity {
    #[default]
    Any,
    /// Prefer the root (first) document
    Root,
}

/// Binary artifact uploaded with the documents.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Payload {
    pub name: String,
    pub path: PathBuf,
}

// ============================================================================
// Deployment configuration
// ============================================================================

/// Platform limits and deployment policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeployConfig {
    #[serde(default = "default_max_template_size")]
    pub max_template_size_bytes: u64,

    #[serde(default = "default_max_resources")]
    pub max_resources_per_template: usize,

    #[serde(default = "default_max_parameters")]
    pub max_parameters_per_template: usize,

    #[serde(default = "default_max_outputs")]
    pub max_outputs_per_template: usize,

    #[serde(default = "default_concurrency")]
    pub max_upload_concurrency: usize,

    #[serde(default = "default_concurrency")]
    pub max_deploy_concurrency: usize,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Restore last known-good state when a tier fails
    #[serde(default)]
    pub rollback_on_failure: bool,

    /// Hard per-run timeout
    #[serde(default = "default_timeout_minutes")]
    pub deployment_timeout_minutes: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_polls")]
    pub max_polls_per_document: u32,

    #[serde(default)]
    pub deployment_mode: DeploymentMode,

    /// Lifetime of artifact access tokens
    #[serde(default = "default_token_ttl")]
    pub artifact_token_ttl_minutes: u64,

    /// Run post-deployment checks (warnings only)
    #[serde(default = "default_true")]
    pub validate_after_deploy: bool,

    /// Document id prefix (`T` → T1, T2, ...)
    #[serde(default = "default_template_prefix")]
    pub template_prefix: String,

    #[serde(default = "default_schema_url")]
    pub schema_url: String,

    #[serde(default = "default_content_version")]
    pub content_version: String,
}

fn default_max_template_size() -> u64 {
    4 * 1024 * 1024
}

fn default_max_resources() -> usize {
    800
}

fn default_max_parameters() -> usize {
    256
}

fn default_max_outputs() -> usize {
    64
}

fn default_concurrency() -> usize {
    4
}

fn default_timeout_minutes() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_polls() -> u32 {
    1800
}

fn default_token_ttl() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_template_prefix() -> String {
    "T".to_string()
}

fn default_schema_url() -> String {
    "https://schema.management.azure.com/schemas/2019-04-01/deploymentTemplate.json#".to_string()
}

fn default_content_version() -> String {
    "1.0.0.0".to_string()
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            max_template_size_bytes: default_max_template_size(),
            max_resources_per_template: default_max_resources(),
            max_parameters_per_template: default_max_parameters(),
            max_outputs_per_template: default_max_outputs(),
            max_upload_concurrency: default_concurrency(),
            max_deploy_concurrency: default_concurrency(),
            retry_policy: RetryPolicy::default(),
            rollback_on_failure: false,
            deployment_timeout_minutes: default_timeout_minutes(),
            poll_interval_ms: default_poll_interval_ms(),
            max_polls_per_document: default_max_polls(),
            deployment_mode: DeploymentMode::default(),
            artifact_token_ttl_minutes: default_token_ttl(),
            validate_after_deploy: true,
            template_prefix: default_template_prefix(),
            schema_url: default_schema_url(),
            content_version: default_content_version(),
        }
    }
}

/// Retry policy for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_multiplier: default_backoff_multiplier(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Control-plane deployment mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// Resources not in the document are removed
    #[default]
    Complete,
    /// Resources not in the document are left alone
    Incremental,
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

// ============================================================================
// Metadata and assignment
// ============================================================================

/// A `${ref:<id>.<attribute>}` occurrence inside a resource's properties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReferenceSite {
    pub resource: String,
    #[serde(default)]
    pub attribute: Option<String>,
}

/// Lightweight fact sheet about one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub id: String,
    pub resource_type: String,
    /// Declaration position
    pub index: usize,
    /// Declared ∪ referenced ids, de-duplicated, declaration order
    pub dependencies: Vec<String>,
    /// Distinct references found in properties
    pub references: Vec<ReferenceSite>,
    /// Upper-bound estimate of the rendered size
    pub estimated_size: u64,
    pub colocate: Option<String>,
    pub affinity: Affinity,
}

/// One planned output document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPlan {
    pub id: String,
    /// Resource ids in emission order
    pub resources: Vec<String>,
    pub estimated_size: u64,
}

/// Placement of every resource into a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateAssignment {
    pub placements: BTreeMap<String, String>,
    pub documents: Vec<DocumentPlan>,
}

impl TemplateAssignment {
    pub fn document_of(&self, resource: &str) -> Option<&str> {
        self.placements.get(resource).map(String::as_str)
    }

    pub fn document(&self, id: &str) -> Option<&DocumentPlan> {
        self.documents.iter().find(|d| d.id == id)
    }

    /// Position of a document in assignment order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.documents.iter().position(|d| d.id == id)
    }

    pub fn document_ids(&self) -> Vec<String> {
        self.documents.iter().map(|d| d.id.clone()).collect()
    }

    /// Canonical serialization, byte-identical for identical assignments.
    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Generated documents
// ============================================================================

/// Parameter declaration in a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub param_type: String,
}

/// Output declaration in a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(rename = "type")]
    pub output_type: String,
    pub value: String,
}

/// Wire format of one deployment document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDocument {
    #[serde(rename = "$schema")]
    pub schema: String,
    #[serde(rename = "contentVersion")]
    pub content_version: String,
    pub parameters: IndexMap<String, ParameterSpec>,
    pub resources: Vec<serde_json::Value>,
    pub outputs: IndexMap<String, OutputSpec>,
}

impl TemplateDocument {
    pub fn empty(config: &DeployConfig) -> Self {
        Self {
            schema: config.schema_url.clone(),
            content_version: config.content_version.clone(),
            parameters: IndexMap::new(),
            resources: Vec::new(),
            outputs: IndexMap::new(),
        }
    }

    /// Compact JSON encoding. These are the bytes uploaded and measured against limits.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Where a consumer document's parameter value comes from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterBinding {
    pub parameter: String,
    pub producer: String,
    pub output: String,
}

/// Final artifact for one document. Never mutated after generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedTemplate {
    pub document_id: String,
    pub document: TemplateDocument,
    pub resources: Vec<String>,
    pub parameter_bindings: Vec<ParameterBinding>,
    pub size_bytes: u64,
    pub content_hash: String,
}

/// A dependency spanning two documents, routed through an output/parameter pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CrossReference {
    pub consumer: String,
    pub producer: String,
    pub resource: String,
    pub attribute: Option<String>,
    /// Shared name of the producer output and the consumer parameter
    pub parameter: String,
}

/// Output of the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub templates: Vec<GeneratedTemplate>,
    pub cross_references: Vec<CrossReference>,
    /// Declared cross-document dependencies with no value flow (producer, consumer)
    pub ordering_edges: Vec<(String, String)>,
}

impl Synthesis {
    pub fn template(&self, document: &str) -> Option<&GeneratedTemplate> {
        self.templates.iter().find(|t| t.document_id == document)
    }
}

/// Ordered stage of documents safe to deploy concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTier {
    pub index: usize,
    pub documents: Vec<String>,
}
