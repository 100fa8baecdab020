//! SF-009: Context-aware document generation.
//!
//! Renders every resource into its assigned document, rewriting `${ref:...}`
//! placeholders into local expressions or parameter reads. Cross-document
//! references register an output on the producer and a parameter on the
//! consumer. Finished documents are re-measured and rejected, never
//! truncated, when they break a platform limit.

use super::collector::{self, visit_strings};
use super::context::{self, Address, Bindings, SynthesisContext};
use super::types::*;
use crate::error::SynthesisError;
use crate::provenance::hasher;
use indexmap::IndexMap;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

static RESOURCE_ID_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"resourceId\('((?:[^']|'')*)', '((?:[^']|'')*)'\)")
        .expect("resourceId pattern is a valid regex")
});

static PARAMETERS_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"parameters\('((?:[^']|'')*)'\)").expect("parameters pattern is a valid regex")
});

/// Render all documents of an assignment.
pub fn generate(
    graph: &ResourceGraph,
    ctx: &SynthesisContext<'_>,
    config: &DeployConfig,
) -> Result<Synthesis, SynthesisError> {
    let assignment = ctx.assignment();
    let mut bindings = Bindings::default();
    let mut ordering: BTreeSet<(String, String)> = BTreeSet::new();

    // Pass 1: resources. Outputs are only known once every consumer rendered.
    let mut rendered: Vec<Vec<serde_json::Value>> = Vec::with_capacity(assignment.documents.len());
    for plan in &assignment.documents {
        let mut resources = Vec::with_capacity(plan.resources.len());
        for id in &plan.resources {
            let node = graph
                .node(id)
                .ok_or_else(|| SynthesisError::Unassigned { id: id.clone() })?;
            let (resource, dependencies) = render_resource(node, &plan.id, ctx, &mut bindings)?;
            resources.push(resource);

            // Declared and referenced alike; constant references carry no
            // binding but still order their producer first.
            for dep in &dependencies {
                if let Some(owner) = ctx.owner_of(dep) {
                    if owner != plan.id {
                        ordering.insert((owner.to_string(), plan.id.clone()));
                    }
                }
            }
        }
        rendered.push(resources);
    }

    let cross_references = bindings.cross_references();
    let flows: BTreeSet<(&str, &str)> = cross_references
        .iter()
        .map(|r| (r.producer.as_str(), r.consumer.as_str()))
        .collect();
    let ordering_edges: Vec<(String, String)> = ordering
        .into_iter()
        .filter(|(p, c)| !flows.contains(&(p.as_str(), c.as_str())))
        .collect();

    // Pass 2: assemble, measure, scan.
    let mut templates = Vec::with_capacity(assignment.documents.len());
    for (plan, resources) in assignment.documents.iter().zip(rendered) {
        let template = assemble(plan, resources, &bindings, config)?;
        tracing::debug!(
            document = %template.document_id,
            resources = template.resources.len(),
            bytes = template.size_bytes,
            estimated = plan.estimated_size,
            "document rendered"
        );
        templates.push(template);
    }

    tracing::info!(
        documents = templates.len(),
        cross_references = cross_references.len(),
        "synthesis complete"
    );

    Ok(Synthesis {
        templates,
        cross_references,
        ordering_edges,
    })
}

/// Render one resource. Also returns every resource it depends on.
fn render_resource(
    node: &ResourceNode,
    document: &str,
    ctx: &SynthesisContext<'_>,
    bindings: &mut Bindings,
) -> Result<(serde_json::Value, Vec<String>), SynthesisError> {
    let mut out = serde_json::Map::new();
    out.insert("type".into(), node.resource_type.clone().into());
    if let Some(ref version) = node.api_version {
        out.insert("apiVersion".into(), version.clone().into());
    }
    out.insert("name".into(), escape_literal(node.effective_name()).into());

    let referenced = collector::references_in(&node.properties).map_err(|placeholder| {
        SynthesisError::UnresolvedPlaceholder {
            document: document.to_string(),
            placeholder,
        }
    })?;
    let mut dependencies: Vec<String> = Vec::new();
    let mut depends_on: Vec<String> = Vec::new();
    for dep in node
        .depends_on
        .iter()
        .chain(referenced.iter().map(|r| &r.resource))
    {
        if dep != &node.id && !dependencies.contains(dep) {
            dependencies.push(dep.clone());
        }
        if let Some(entry) = ctx.dependency_entry(document, dep) {
            if !depends_on.contains(&entry) {
                depends_on.push(entry);
            }
        }
    }
    if !depends_on.is_empty() {
        out.insert("dependsOn".into(), depends_on.into());
    }

    if !node.properties.is_null() {
        let properties = rewrite(&node.properties, document, ctx, bindings)?;
        out.insert("properties".into(), properties);
    }
    Ok((serde_json::Value::Object(out), dependencies))
}

/// Rewrite every placeholder in a properties tree.
fn rewrite(
    value: &serde_json::Value,
    document: &str,
    ctx: &SynthesisContext<'_>,
    bindings: &mut Bindings,
) -> Result<serde_json::Value, SynthesisError> {
    Ok(match value {
        serde_json::Value::String(s) => {
            serde_json::Value::String(rewrite_string(s, document, ctx, bindings)?)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .iter()
                .map(|v| rewrite(v, document, ctx, bindings))
                .collect::<Result<_, _>>()?,
        ),
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), rewrite(v, document, ctx, bindings)?);
            }
            serde_json::Value::Object(out)
        }
        other => other.clone(),
    })
}

enum Segment {
    Literal(String),
    Expression(String),
}

fn rewrite_string(
    s: &str,
    document: &str,
    ctx: &SynthesisContext<'_>,
    bindings: &mut Bindings,
) -> Result<String, SynthesisError> {
    let placeholders = collector::scan_placeholders(s).map_err(|placeholder| {
        SynthesisError::UnresolvedPlaceholder {
            document: document.to_string(),
            placeholder,
        }
    })?;
    if placeholders.is_empty() {
        return Ok(escape_literal(s.to_string()));
    }

    let mut segments: Vec<Segment> = Vec::new();
    let mut cursor = 0;
    for p in &placeholders {
        if p.start > cursor {
            segments.push(Segment::Literal(s[cursor..p.start].to_string()));
        }
        let segment = match ctx.resolve(document, &p.site)? {
            Address::Constant(value) => Segment::Literal(value),
            Address::Local { expression } => Segment::Expression(expression),
            Address::CrossDocument {
                producer,
                parameter,
                producer_expression,
            } => {
                bindings.register(document, &producer, &p.site, &parameter, &producer_expression);
                Segment::Expression(context::parameter_expression(&parameter))
            }
        };
        segments.push(segment);
        cursor = p.end;
    }
    if cursor < s.len() {
        segments.push(Segment::Literal(s[cursor..].to_string()));
    }

    // Literal-only results stay plain strings
    if segments.iter().all(|seg| matches!(seg, Segment::Literal(_))) {
        return Ok(escape_literal(
            segments
                .into_iter()
                .map(|seg| match seg {
                    Segment::Literal(text) | Segment::Expression(text) => text,
                })
                .collect(),
        ));
    }

    if let [Segment::Expression(expression)] = segments.as_slice() {
        return Ok(format!("[{}]", expression));
    }

    let args: Vec<String> = merge_literals(segments)
        .into_iter()
        .map(|seg| match seg {
            Segment::Literal(text) => context::quote(&text),
            Segment::Expression(expression) => expression,
        })
        .collect();
    Ok(format!("[concat({})]", args.join(", ")))
}

/// A literal shaped like `[...]` would be read as an expression; a leading
/// `[[` keeps it literal.
fn escape_literal(s: String) -> String {
    if s.starts_with('[') && s.ends_with(']') {
        format!("[{}", s)
    } else {
        s
    }
}

/// Join adjacent literals so constants inline into their neighbours.
fn merge_literals(segments: Vec<Segment>) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::with_capacity(segments.len());
    for seg in segments {
        match (merged.last_mut(), seg) {
            (Some(Segment::Literal(prev)), Segment::Literal(text)) => prev.push_str(&text),
            (_, seg) => merged.push(seg),
        }
    }
    merged
}

fn assemble(
    plan: &DocumentPlan,
    resources: Vec<serde_json::Value>,
    bindings: &Bindings,
    config: &DeployConfig,
) -> Result<GeneratedTemplate, SynthesisError> {
    let mut document = TemplateDocument::empty(config);
    let parameter_bindings = bindings.parameters_of(&plan.id);
    for binding in &parameter_bindings {
        document.parameters.insert(
            binding.parameter.clone(),
            ParameterSpec {
                param_type: "string".to_string(),
            },
        );
    }
    let outputs: IndexMap<String, OutputSpec> = bindings
        .outputs_of(&plan.id)
        .into_iter()
        .map(|(name, value)| {
            (
                name,
                OutputSpec {
                    output_type: "string".to_string(),
                    value,
                },
            )
        })
        .collect();
    document.outputs = outputs;
    document.resources = resources;

    if document.resources.len() > config.max_resources_per_template {
        return Err(SynthesisError::TooManyResources {
            document: plan.id.clone(),
            count: document.resources.len(),
            limit: config.max_resources_per_template,
        });
    }
    if document.parameters.len() > config.max_parameters_per_template {
        return Err(SynthesisError::TooManyParameters {
            document: plan.id.clone(),
            count: document.parameters.len(),
            limit: config.max_parameters_per_template,
        });
    }
    if document.outputs.len() > config.max_outputs_per_template {
        return Err(SynthesisError::TooManyOutputs {
            document: plan.id.clone(),
            count: document.outputs.len(),
            limit: config.max_outputs_per_template,
        });
    }

    let bytes = document.to_bytes()?;
    let size_bytes = bytes.len() as u64;
    if size_bytes > config.max_template_size_bytes {
        return Err(SynthesisError::SizeEstimationViolation {
            document: plan.id.clone(),
            actual: size_bytes,
            estimated: plan.estimated_size,
            limit: config.max_template_size_bytes,
        });
    }

    let text = String::from_utf8_lossy(&bytes);
    if let Some(at) = text.find("${ref:") {
        return Err(SynthesisError::UnresolvedPlaceholder {
            document: plan.id.clone(),
            placeholder: text[at..].chars().take(48).collect(),
        });
    }

    Ok(GeneratedTemplate {
        document_id: plan.id.clone(),
        content_hash: hasher::hash_bytes(&bytes),
        document,
        resources: plan.resources.clone(),
        parameter_bindings,
        size_bytes,
    })
}

fn unescape(s: &str) -> String {
    s.replace("''", "'")
}

/// Static addressing check over rendered documents: every `resourceId(...)`
/// of a graph resource targets the emitting document, and every
/// `parameters(...)` read is declared.
pub fn verify_addressing(
    synthesis: &Synthesis,
    graph: &ResourceGraph,
    assignment: &TemplateAssignment,
) -> Result<(), SynthesisError> {
    let addresses: HashMap<(String, String), &str> = graph
        .resources
        .iter()
        .map(|n| ((n.resource_type.clone(), n.effective_name()), n.id.as_str()))
        .collect();

    for template in &synthesis.templates {
        let doc = template.document_id.as_str();
        let mut failure: Option<SynthesisError> = None;
        for resource in &template.document.resources {
            visit_strings(resource, &mut |s| {
                if failure.is_some() {
                    return;
                }
                for caps in RESOURCE_ID_CALL.captures_iter(s) {
                    let key = (unescape(&caps[1]), unescape(&caps[2]));
                    if let Some(&id) = addresses.get(&key) {
                        if assignment.document_of(id) != Some(doc) {
                            failure = Some(SynthesisError::DirectCrossReference {
                                document: doc.to_string(),
                                target: id.to_string(),
                            });
                            return;
                        }
                    }
                }
                for caps in PARAMETERS_CALL.captures_iter(s) {
                    let parameter = unescape(&caps[1]);
                    if !template.document.parameters.contains_key(&parameter) {
                        failure = Some(SynthesisError::UndeclaredParameter {
                            document: doc.to_string(),
                            parameter,
                        });
                        return;
                    }
                }
            });
        }
        if let Some(err) = failure {
            return Err(err);
        }

        for binding in &template.parameter_bindings {
            let declared = synthesis
                .template(&binding.producer)
                .is_some_and(|p| p.document.outputs.contains_key(&binding.output));
            if !declared {
                return Err(SynthesisError::UndeclaredParameter {
                    document: binding.producer.clone(),
                    parameter: binding.output.clone(),
                });
            }
        }
    }
    Ok(())
}
