//! SF-002: YAML parsing and structural validation.
//!
//! Parses the resource graph and deployment config, and validates:
//! - ids are present, well-formed and unique
//! - type tags are present and (type, name) pairs are unique
//! - depends_on and `${ref:...}` targets exist and are not self references
//! - platform limits are usable

use super::collector;
use super::types::*;
use crate::error::ValidationError;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Parse a resource graph file from disk.
pub fn parse_graph_file(path: &Path) -> Result<ResourceGraph, ValidationError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ValidationError::Parse(format!("failed to read {}: {}", path.display(), e)))?;
    parse_graph(&content)
}

/// Parse a resource graph from a YAML string.
pub fn parse_graph(yaml: &str) -> Result<ResourceGraph, ValidationError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| ValidationError::Parse(format!("YAML parse error: {}", e)))
}

/// Parse a standalone deployment config file.
pub fn parse_config_file(path: &Path) -> Result<DeployConfig, ValidationError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ValidationError::Parse(format!("failed to read {}: {}", path.display(), e)))?;
    serde_yaml_ng::from_str(&content)
        .map_err(|e| ValidationError::Parse(format!("config parse error: {}", e)))
}

fn is_valid_id(id: &str) -> bool {
    id.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validate a parsed graph. Returns every error found (empty = valid).
pub fn validate_graph(graph: &ResourceGraph) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut addresses: HashMap<(String, String), &str> = HashMap::new();

    for (index, node) in graph.resources.iter().enumerate() {
        if node.id.is_empty() {
            errors.push(ValidationError::EmptyId { index });
            continue;
        }
        if !is_valid_id(&node.id) {
            errors.push(ValidationError::InvalidId {
                id: node.id.clone(),
            });
        }
        if let Some(&first) = seen.get(node.id.as_str()) {
            errors.push(ValidationError::DuplicateId {
                id: node.id.clone(),
                first,
                second: index,
            });
            continue;
        }
        seen.insert(&node.id, index);

        if node.resource_type.trim().is_empty() {
            errors.push(ValidationError::EmptyType {
                id: node.id.clone(),
            });
        }

        let address = (node.resource_type.clone(), node.effective_name());
        if let Some(first) = addresses.get(&address) {
            errors.push(ValidationError::DuplicateAddress {
                first: first.to_string(),
                second: node.id.clone(),
                name: address.1.clone(),
            });
        } else {
            addresses.insert(address, &node.id);
        }
    }

    let ids: HashSet<&str> = graph.resources.iter().map(|n| n.id.as_str()).collect();

    for node in &graph.resources {
        if node.id.is_empty() {
            continue;
        }
        for dep in &node.depends_on {
            if dep == &node.id {
                errors.push(ValidationError::SelfDependency {
                    id: node.id.clone(),
                });
            } else if !ids.contains(dep.as_str()) {
                errors.push(ValidationError::UnknownDependency {
                    id: node.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        match collector::references_in(&node.properties) {
            Ok(sites) => {
                for site in sites {
                    if site.resource == node.id {
                        errors.push(ValidationError::SelfDependency {
                            id: node.id.clone(),
                        });
                    } else if !ids.contains(site.resource.as_str()) {
                        errors.push(ValidationError::UnknownDependency {
                            id: node.id.clone(),
                            dependency: site.resource.clone(),
                        });
                    }
                }
            }
            Err(placeholder) => errors.push(ValidationError::MalformedReference {
                id: node.id.clone(),
                placeholder,
            }),
        }
    }

    errors
}

/// Validate platform limits before any assignment work.
pub fn validate_limits(config: &DeployConfig) -> Result<(), ValidationError> {
    let base = TemplateDocument::empty(config)
        .to_bytes()
        .map(|b| b.len() as u64)
        .map_err(|e| ValidationError::InvalidLimits(e.to_string()))?;

    if config.max_template_size_bytes <= base {
        return Err(ValidationError::InvalidLimits(format!(
            "max_template_size_bytes ({}) must exceed the empty document size ({})",
            config.max_template_size_bytes, base
        )));
    }
    if config.max_resources_per_template == 0 {
        return Err(ValidationError::InvalidLimits(
            "max_resources_per_template must be at least 1".to_string(),
        ));
    }
    if config.max_upload_concurrency == 0 || config.max_deploy_concurrency == 0 {
        return Err(ValidationError::InvalidLimits(
            "upload and deploy concurrency must be at least 1".to_string(),
        ));
    }
    if config.retry_policy.max_attempts == 0 {
        return Err(ValidationError::InvalidLimits(
            "retry_policy.max_attempts must be at least 1".to_string(),
        ));
    }
    if config.retry_policy.backoff_multiplier < 1.0 {
        return Err(ValidationError::InvalidLimits(
            "retry_policy.backoff_multiplier must be >= 1.0".to_string(),
        ));
    }
    if config.template_prefix.is_empty() {
        return Err(ValidationError::InvalidLimits(
            "template_prefix must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sf002_parse_valid() {
        let graph = parse_graph(
            r#"
name: shop
resources:
  - id: plan
    type: Microsoft.Web/serverfarms
  - id: site
    type: Microsoft.Web/sites
    depends_on: [plan]
    properties:
      serverFarmId: "${ref:plan.id}"
"#,
        )
        .unwrap();
        let errors = validate_graph(&graph);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    }

    #[test]
    fn test_sf002_parse_invalid_yaml() {
        assert!(matches!(
            parse_graph("not: [valid: yaml: {{"),
            Err(ValidationError::Parse(_))
        ));
    }

    #[test]
    fn test_sf002_duplicate_id() {
        let graph = parse_graph(
            r#"
name: dup
resources:
  - { id: a, type: t }
  - { id: a, type: t, name: other }
"#,
        )
        .unwrap();
        let errors = validate_graph(&graph);
        assert!(errors.contains(&ValidationError::DuplicateId {
            id: "a".to_string(),
            first: 0,
            second: 1
        }));
    }

    #[test]
    fn test_sf002_empty_id_and_type() {
        let graph = parse_graph(
            r#"
name: bad
resources:
  - { id: "", type: t }
  - { id: b, type: "" }
"#,
        )
        .unwrap();
        let errors = validate_graph(&graph);
        assert!(errors.contains(&ValidationError::EmptyId { index: 0 }));
        assert!(errors.contains(&ValidationError::EmptyType {
            id: "b".to_string()
        }));
    }

    #[test]
    fn test_sf002_invalid_id_chars() {
        let graph = parse_graph("name: x\nresources:\n  - { id: a.b, type: t }\n").unwrap();
        let errors = validate_graph(&graph);
        assert!(matches!(errors[0], ValidationError::InvalidId { .. }));
    }

    #[test]
    fn test_sf002_duplicate_address() {
        let graph = parse_graph(
            r#"
name: x
resources:
  - { id: a, type: t, name: shared }
  - { id: b, type: t, name: shared }
"#,
        )
        .unwrap();
        let errors = validate_graph(&graph);
        assert!(matches!(
            errors[0],
            ValidationError::DuplicateAddress { .. }
        ));
    }

    #[test]
    fn test_sf002_unknown_and_self_dependency() {
        let graph = parse_graph(
            r#"
name: x
resources:
  - id: a
    type: t
    depends_on: [ghost, a]
  - id: b
    type: t
    properties:
      x: "${ref:phantom.id}"
"#,
        )
        .unwrap();
        let errors = validate_graph(&graph);
        assert!(errors.contains(&ValidationError::UnknownDependency {
            id: "a".to_string(),
            dependency: "ghost".to_string()
        }));
        assert!(errors.contains(&ValidationError::SelfDependency {
            id: "a".to_string()
        }));
        assert!(errors.contains(&ValidationError::UnknownDependency {
            id: "b".to_string(),
            dependency: "phantom".to_string()
        }));
    }

    #[test]
    fn test_sf002_malformed_reference() {
        let graph = parse_graph(
            r#"
name: x
resources:
  - { id: a, type: t }
  - id: b
    type: t
    properties:
      x: "prefix-${ref:a.id"
"#,
        )
        .unwrap();
        let errors = validate_graph(&graph);
        assert!(matches!(
            errors[0],
            ValidationError::MalformedReference { .. }
        ));
    }

    #[test]
    fn test_sf002_limits() {
        assert!(validate_limits(&DeployConfig::default()).is_ok());

        let mut c = DeployConfig::default();
        c.max_template_size_bytes = 10;
        assert!(validate_limits(&c).is_err());

        let mut c = DeployConfig::default();
        c.max_resources_per_template = 0;
        assert!(validate_limits(&c).is_err());

        let mut c = DeployConfig::default();
        c.retry_policy.backoff_multiplier = 0.5;
        assert!(validate_limits(&c).is_err());
    }

    #[test]
    fn test_sf002_parse_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.yaml");
        std::fs::write(
            &path,
            "max_deploy_concurrency: 2\nretry_policy:\n  max_attempts: 5\n",
        )
        .unwrap();
        let config = parse_config_file(&path).unwrap();
        assert_eq!(config.max_deploy_concurrency, 2);
        assert_eq!(config.retry_policy.max_attempts, 5);
        assert_eq!(config.retry_policy.backoff_multiplier, 2.0);
    }
}
