//! SF-006: Metadata collection. One lightweight fact sheet per resource.
//!
//! Pure and cheap: validates the graph, normalizes dependencies, extracts
//! `${ref:<id>.<attribute>}` references and estimates rendered size. Never
//! renders output; the generator re-measures real sizes later.

use super::context;
use super::parser;
use super::types::*;
use crate::error::ValidationError;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

/// `dependsOn` key, array brackets and separators per resource.
const RESOURCE_ENVELOPE_BYTES: u64 = 32;

/// Quotes, brackets and `concat(...)` glue per rendered reference.
const REFERENCE_SLACK_BYTES: u64 = 24;

/// JSON framing of one `"p":{"type":"string"}` parameter entry.
const PARAMETER_ENTRY_BYTES: u64 = 24;

/// JSON framing of one `"o":{"type":"string","value":"[...]"}` output entry.
const OUTPUT_ENTRY_BYTES: u64 = 40;

static REF_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{ref:([A-Za-z0-9_-]+)(?:\.([A-Za-z0-9_.-]+))?\}")
        .expect("reference pattern is a valid regex")
});

/// One placeholder occurrence inside a string, with its byte span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub start: usize,
    pub end: usize,
    pub site: ReferenceSite,
}

/// Find every `${ref:...}` placeholder in a string.
/// Returns the offending fragment if a placeholder is malformed.
pub fn scan_placeholders(s: &str) -> Result<Vec<Placeholder>, String> {
    let mut found = Vec::new();
    for caps in REF_PATTERN.captures_iter(s) {
        let Some(whole) = caps.get(0) else { continue };
        found.push(Placeholder {
            start: whole.start(),
            end: whole.end(),
            site: ReferenceSite {
                resource: caps[1].to_string(),
                attribute: caps.get(2).map(|m| m.as_str().to_string()),
            },
        });
    }

    for (idx, _) in s.match_indices("${ref:") {
        if !found.iter().any(|p| p.start == idx) {
            let fragment: String = s[idx..].chars().take(32).collect();
            return Err(fragment);
        }
    }

    Ok(found)
}

/// Call `f` on every string value inside a JSON value.
pub fn visit_strings<'a>(value: &'a serde_json::Value, f: &mut dyn FnMut(&'a str)) {
    match value {
        serde_json::Value::String(s) => f(s),
        serde_json::Value::Array(items) => {
            for item in items {
                visit_strings(item, f);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                visit_strings(item, f);
            }
        }
        _ => {}
    }
}

/// Every placeholder occurrence in a properties tree, in visitation order.
pub fn placeholders_in(value: &serde_json::Value) -> Result<Vec<ReferenceSite>, String> {
    let mut sites = Vec::new();
    let mut error = None;
    visit_strings(value, &mut |s| {
        if error.is_some() {
            return;
        }
        match scan_placeholders(s) {
            Ok(found) => sites.extend(found.into_iter().map(|p| p.site)),
            Err(fragment) => error = Some(fragment),
        }
    });
    match error {
        Some(fragment) => Err(fragment),
        None => Ok(sites),
    }
}

/// Distinct references in a properties tree, first-seen order.
pub fn references_in(value: &serde_json::Value) -> Result<Vec<ReferenceSite>, String> {
    let mut seen = BTreeSet::new();
    Ok(placeholders_in(value)?
        .into_iter()
        .filter(|site| seen.insert(site.clone()))
        .collect())
}

/// Collect metadata for every resource. Fails fast on the first
/// validation error; no partial result is returned.
pub fn collect(graph: &ResourceGraph) -> Result<Vec<ResourceMetadata>, ValidationError> {
    if let Some(err) = parser::validate_graph(graph).into_iter().next() {
        return Err(err);
    }

    let nodes: HashMap<&str, &ResourceNode> =
        graph.resources.iter().map(|n| (n.id.as_str(), n)).collect();

    // Incoming value references per producer, for output allowances
    let mut incoming: HashMap<&str, BTreeSet<ReferenceSite>> = HashMap::new();
    let mut occurrences: HashMap<&str, Vec<ReferenceSite>> = HashMap::new();
    for node in &graph.resources {
        let sites = placeholders_in(&node.properties).map_err(|placeholder| {
            ValidationError::MalformedReference {
                id: node.id.clone(),
                placeholder,
            }
        })?;
        for site in &sites {
            if !context::is_constant_attribute(site.attribute.as_deref()) {
                if let Some(target) = nodes.get(site.resource.as_str()) {
                    incoming.entry(target.id.as_str()).or_default().insert(site.clone());
                }
            }
        }
        occurrences.insert(node.id.as_str(), sites);
    }

    let mut metadata = Vec::with_capacity(graph.resources.len());
    for (index, node) in graph.resources.iter().enumerate() {
        let sites = occurrences.remove(node.id.as_str()).unwrap_or_default();

        let mut seen = BTreeSet::new();
        let references: Vec<ReferenceSite> = sites
            .iter()
            .filter(|s| seen.insert((*s).clone()))
            .cloned()
            .collect();

        let mut dependencies: Vec<String> = Vec::new();
        for dep in node
            .depends_on
            .iter()
            .chain(references.iter().map(|r| &r.resource))
        {
            if !dependencies.contains(dep) {
                dependencies.push(dep.clone());
            }
        }

        let estimated_size = estimate_size(
            node,
            &dependencies,
            &sites,
            &references,
            incoming.get(node.id.as_str()),
            &nodes,
        );

        metadata.push(ResourceMetadata {
            id: node.id.clone(),
            resource_type: node.resource_type.clone(),
            index,
            dependencies,
            references,
            estimated_size,
            colocate: node.colocate.clone(),
            affinity: node.affinity,
        });
    }

    Ok(metadata)
}

/// Upper-bound estimate of a resource's contribution to a document.
fn estimate_size(
    node: &ResourceNode,
    dependencies: &[String],
    occurrences: &[ReferenceSite],
    distinct: &[ReferenceSite],
    incoming: Option<&BTreeSet<ReferenceSite>>,
    nodes: &HashMap<&str, &ResourceNode>,
) -> u64 {
    let skeleton = serde_json::json!({
        "apiVersion": node.api_version,
        "name": node.effective_name(),
        "properties": node.properties,
        "type": node.resource_type,
    });
    let mut size = serde_json::to_vec(&skeleton).map_or(0, |b| b.len() as u64);
    size += RESOURCE_ENVELOPE_BYTES;

    // One byte per literal that may need a `[[` escape
    let mut escapes = u64::from(node.effective_name().starts_with('['));
    visit_strings(&node.properties, &mut |s| {
        if s.starts_with('[') || s.starts_with("${ref:") {
            escapes += 1;
        }
    });
    size += escapes;

    for dep in dependencies {
        if let Some(target) = nodes.get(dep.as_str()) {
            let expr =
                context::resource_id_expression(&target.resource_type, &target.effective_name());
            size += expr.len() as u64 + 4;
        }
    }

    for site in occurrences {
        let Some(target) = nodes.get(site.resource.as_str()) else {
            continue;
        };
        let local = context::local_expression(target, site.attribute.as_deref());
        let param = context::parameter_name(&site.resource, site.attribute.as_deref());
        let routed = context::parameter_expression(&param);
        size += local.len().max(routed.len()) as u64 + REFERENCE_SLACK_BYTES;
    }

    for site in distinct {
        if !context::is_constant_attribute(site.attribute.as_deref()) {
            let param = context::parameter_name(&site.resource, site.attribute.as_deref());
            size += param.len() as u64 + PARAMETER_ENTRY_BYTES;
        }
    }

    for site in incoming.into_iter().flatten() {
        let param = context::parameter_name(&site.resource, site.attribute.as_deref());
        let expr = context::local_expression(node, site.attribute.as_deref());
        size += (param.len() + expr.len()) as u64 + OUTPUT_ENTRY_BYTES;
    }

    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_graph;

    fn graph() -> ResourceGraph {
        parse_graph(
            r#"
name: shop
resources:
  - id: plan
    type: Microsoft.Web/serverfarms
    properties: { sku: B1 }
  - id: site
    type: Microsoft.Web/sites
    depends_on: [plan]
    properties:
      serverFarmId: "${ref:plan.id}"
      hostUrl: "https://${ref:plan.properties.host}/api"
      tags: ["${ref:plan.id}"]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_sf006_scan_placeholders() {
        let found = scan_placeholders("a ${ref:x.id} b ${ref:y} c").unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].site.resource, "x");
        assert_eq!(found[0].site.attribute.as_deref(), Some("id"));
        assert_eq!(found[1].site.attribute, None);
        assert_eq!(&"a ${ref:x.id} b"[found[0].start..found[0].end], "${ref:x.id}");
    }

    #[test]
    fn test_sf006_scan_nested_attribute() {
        let found = scan_placeholders("${ref:x.properties.outboundIpAddresses}").unwrap();
        assert_eq!(
            found[0].site.attribute.as_deref(),
            Some("properties.outboundIpAddresses")
        );
    }

    #[test]
    fn test_sf006_scan_malformed() {
        assert!(scan_placeholders("${ref:x.id").is_err());
        assert!(scan_placeholders("${ref:}").is_err());
        assert!(scan_placeholders("no references here").unwrap().is_empty());
    }

    #[test]
    fn test_sf006_collect_normalizes_dependencies() {
        let meta = collect(&graph()).unwrap();
        assert_eq!(meta.len(), 2);
        assert_eq!(meta[0].id, "plan");
        assert_eq!(meta[0].index, 0);
        assert!(meta[0].dependencies.is_empty());
        // depends_on and the references collapse to one entry
        assert_eq!(meta[1].dependencies, vec!["plan"]);
        assert_eq!(meta[1].references.len(), 2);
    }

    #[test]
    fn test_sf006_estimate_includes_reference_allowances() {
        let meta = collect(&graph()).unwrap();
        // The referenced resource carries output allowances
        let bare = serde_json::to_vec(&serde_json::json!({
            "apiVersion": null, "name": "plan", "properties": {"sku": "B1"},
            "type": "Microsoft.Web/serverfarms"
        }))
        .unwrap()
        .len() as u64;
        assert!(meta[0].estimated_size > bare + RESOURCE_ENVELOPE_BYTES);
        assert!(meta[1].estimated_size > meta[0].estimated_size);
    }

    #[test]
    fn test_sf006_collect_is_deterministic() {
        let a = collect(&graph()).unwrap();
        let b = collect(&graph()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sf006_collect_fails_fast() {
        let g = parse_graph(
            r#"
name: bad
resources:
  - { id: a, type: t }
  - { id: a, type: t, name: again }
"#,
        )
        .unwrap();
        assert!(matches!(
            collect(&g),
            Err(ValidationError::DuplicateId { .. })
        ));
    }

    #[test]
    fn test_sf006_references_in_dedupes() {
        let v = serde_json::json!({"a": "${ref:x.id}", "b": ["${ref:x.id}", "${ref:x.name}"]});
        let refs = references_in(&v).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(placeholders_in(&v).unwrap().len(), 3);
    }
}
