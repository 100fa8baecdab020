//! SF-007: Synthesis context. Who owns each resource and how to address it.
//!
//! Built from a finished assignment. Same-document references resolve to a
//! direct expression; cross-document references resolve to a parameter in
//! the consumer fed by an output of the producer.

use super::types::*;
use crate::error::SynthesisError;
use crate::provenance::hasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Attributes known at synthesis time and inlined as literals.
pub fn is_constant_attribute(attribute: Option<&str>) -> bool {
    attribute == Some("name")
}

/// Single-quoted expression literal; embedded quotes are doubled.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub fn resource_id_expression(resource_type: &str, name: &str) -> String {
    format!("resourceId({}, {})", quote(resource_type), quote(name))
}

/// Expression addressing a resource attribute from inside its own document
/// (without the surrounding brackets).
pub fn local_expression(node: &ResourceNode, attribute: Option<&str>) -> String {
    let id_expr = resource_id_expression(&node.resource_type, &node.effective_name());
    match attribute {
        None | Some("id") => id_expr,
        Some("name") => quote(&node.effective_name()),
        Some(attr) => format!("reference({}).{}", id_expr, attr),
    }
}

/// Name shared by a producer output and its consumer parameter.
pub fn parameter_name(resource: &str, attribute: Option<&str>) -> String {
    let attr = attribute.unwrap_or("id");
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    };
    let base = format!("ref_{}_{}", sanitize(resource), sanitize(attr));
    let lossless = resource.chars().all(|c| c.is_ascii_alphanumeric())
        && attr.chars().all(|c| c.is_ascii_alphanumeric());
    if lossless {
        base
    } else {
        format!("{}_{}", base, hasher::short_digest(&format!("{}.{}", resource, attr)))
    }
}

pub fn parameter_expression(parameter: &str) -> String {
    format!("parameters({})", quote(parameter))
}

/// How a consumer document addresses a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Known literal value
    Constant(String),
    /// Target lives in the consumer document
    Local { expression: String },
    /// Target lives elsewhere; routed through an output/parameter pair
    CrossDocument {
        producer: String,
        parameter: String,
        producer_expression: String,
    },
}

struct Target<'a> {
    document: &'a str,
    node: &'a ResourceNode,
}

/// Read-only lookup over a finished assignment.
pub struct SynthesisContext<'a> {
    assignment: &'a TemplateAssignment,
    targets: HashMap<&'a str, Target<'a>>,
}

impl<'a> SynthesisContext<'a> {
    pub fn new(
        graph: &'a ResourceGraph,
        assignment: &'a TemplateAssignment,
    ) -> Result<Self, SynthesisError> {
        let mut targets = HashMap::with_capacity(graph.resources.len());
        for node in &graph.resources {
            let document = assignment
                .document_of(&node.id)
                .ok_or_else(|| SynthesisError::Unassigned {
                    id: node.id.clone(),
                })?;
            targets.insert(node.id.as_str(), Target { document, node });
        }
        Ok(Self {
            assignment,
            targets,
        })
    }

    pub fn assignment(&self) -> &TemplateAssignment {
        self.assignment
    }

    pub fn owner_of(&self, resource: &str) -> Option<&str> {
        self.targets.get(resource).map(|t| t.document)
    }

    pub fn node(&self, resource: &str) -> Option<&'a ResourceNode> {
        self.targets.get(resource).map(|t| t.node)
    }

    /// Resolve a reference as seen from `consumer`.
    pub fn resolve(&self, consumer: &str, site: &ReferenceSite) -> Result<Address, SynthesisError> {
        let target = self
            .targets
            .get(site.resource.as_str())
            .ok_or_else(|| SynthesisError::Unassigned {
                id: site.resource.clone(),
            })?;
        let attribute = site.attribute.as_deref();

        if is_constant_attribute(attribute) {
            return Ok(Address::Constant(target.node.effective_name()));
        }

        let expression = local_expression(target.node, attribute);
        if target.document == consumer {
            Ok(Address::Local { expression })
        } else {
            Ok(Address::CrossDocument {
                producer: target.document.to_string(),
                parameter: parameter_name(&site.resource, attribute),
                producer_expression: expression,
            })
        }
    }

    /// `dependsOn` entry for a declared dependency, or `None` when the
    /// dependency lives in another document and is ordered by tiering.
    pub fn dependency_entry(&self, consumer: &str, resource: &str) -> Option<String> {
        let target = self.targets.get(resource)?;
        if target.document != consumer {
            return None;
        }
        Some(format!(
            "[{}]",
            resource_id_expression(&target.node.resource_type, &target.node.effective_name())
        ))
    }
}

/// Per-document declared parameters and outputs, registered while rendering.
#[derive(Debug, Default)]
pub struct Bindings {
    parameters: BTreeMap<String, BTreeMap<String, ParameterBinding>>,
    outputs: BTreeMap<String, BTreeMap<String, String>>,
    cross_references: BTreeSet<CrossReference>,
}

impl Bindings {
    /// Register a cross-document reference. Idempotent: the same reference
    /// rendered twice declares one parameter/output pair.
    pub fn register(
        &mut self,
        consumer: &str,
        producer: &str,
        site: &ReferenceSite,
        parameter: &str,
        producer_expression: &str,
    ) {
        self.parameters
            .entry(consumer.to_string())
            .or_default()
            .entry(parameter.to_string())
            .or_insert_with(|| ParameterBinding {
                parameter: parameter.to_string(),
                producer: producer.to_string(),
                output: parameter.to_string(),
            });
        self.outputs
            .entry(producer.to_string())
            .or_default()
            .entry(parameter.to_string())
            .or_insert_with(|| format!("[{}]", producer_expression));
        self.cross_references.insert(CrossReference {
            consumer: consumer.to_string(),
            producer: producer.to_string(),
            resource: site.resource.clone(),
            attribute: site.attribute.clone(),
            parameter: parameter.to_string(),
        });
    }

    pub fn parameters_of(&self, document: &str) -> Vec<ParameterBinding> {
        self.parameters
            .get(document)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Output name → value expression.
    pub fn outputs_of(&self, document: &str) -> Vec<(String, String)> {
        self.outputs
            .get(document)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn cross_references(&self) -> Vec<CrossReference> {
        self.cross_references.iter().cloned().collect()
    }
}
