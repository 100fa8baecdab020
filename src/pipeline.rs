//! SF-030: Synthesis pipeline. Graph to deployable plan.
//!
//! collect → assign → context → generate → verify → tier. Every stage is
//! synchronous and consumes the previous stage's output by reference.

use crate::core::types::{
    DeployConfig, DeploymentTier, Payload, ResourceGraph, ResourceMetadata, Synthesis,
    TemplateAssignment,
};
use crate::core::{assigner, collector, context::SynthesisContext, generator, tiering};
use crate::error::PipelineError;
use std::path::PathBuf;

/// Everything the orchestrator needs for one run.
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub name: String,
    pub config: DeployConfig,
    pub metadata: Vec<ResourceMetadata>,
    pub assignment: TemplateAssignment,
    pub synthesis: Synthesis,
    pub tiers: Vec<DeploymentTier>,
    pub payloads: Vec<Payload>,
    /// Payload paths resolve against this directory
    pub base_dir: PathBuf,
}

/// Compile a graph using its own `config` block.
pub fn compile(graph: &ResourceGraph) -> Result<CompiledPlan, PipelineError> {
    compile_with(graph, &graph.config)
}

/// Compile a graph under an explicit configuration.
pub fn compile_with(graph: &ResourceGraph, config: &DeployConfig) -> Result<CompiledPlan, PipelineError> {
    let metadata = collector::collect(graph)?;
    let assignment = assigner::assign(&metadata, config)?;
    let ctx = SynthesisContext::new(graph, &assignment)?;
    let synthesis = generator::generate(graph, &ctx, config)?;
    generator::verify_addressing(&synthesis, graph, &assignment)?;

    let doc_graph = tiering::DocumentGraph::from_synthesis(&assignment, &synthesis);
    let tiers = tiering::compute_tiers(&doc_graph)?;

    tracing::info!(
        graph = %graph.name,
        resources = metadata.len(),
        documents = assignment.documents.len(),
        tiers = tiers.len(),
        cross_references = synthesis.cross_references.len(),
        "plan compiled"
    );

    Ok(CompiledPlan {
        name: graph.name.clone(),
        config: config.clone(),
        metadata,
        assignment,
        synthesis,
        tiers,
        payloads: graph.payloads.clone(),
        base_dir: PathBuf::from("."),
    })
}

impl CompiledPlan {
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Write every document as pretty JSON to `<dir>/<document>.json`.
    pub fn write_templates(&self, dir: &std::path::Path) -> Result<Vec<PathBuf>, PipelineError> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(self.synthesis.templates.len());
        for template in &self.synthesis.templates {
            let path = dir.join(format!("{}.json", template.document_id));
            let json = serde_json::to_string_pretty(&template.document)
                .map_err(crate::error::SynthesisError::from)?;
            std::fs::write(&path, json)?;
            written.push(path);
        }
        Ok(written)
    }
}
