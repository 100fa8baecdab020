//! SF-008: Template assignment. Pack resources into size-limited documents.
//!
//! Works on metadata only and never renders. Co-location groups are placed
//! as one unit; units are visited in topological order (Kahn's algorithm,
//! declaration-order tie-breaking) and packed into the current document until
//! a limit would be breached. Every dependency therefore lands in the same or
//! an earlier document.

use super::parser;
use super::types::*;
use crate::error::ValidationError;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A set of resources that must share a document.
#[derive(Debug)]
struct Unit<'a> {
    group: Option<&'a str>,
    /// Indices into the metadata slice, declaration order
    members: Vec<usize>,
    size: u64,
    prefers_root: bool,
    /// Units this unit depends on
    deps: BTreeSet<usize>,
}

impl Unit<'_> {
    fn first_index(&self, metadata: &[ResourceMetadata]) -> usize {
        self.members
            .iter()
            .map(|&m| metadata[m].index)
            .min()
            .unwrap_or(usize::MAX)
    }
}

/// Assign every resource to exactly one document.
pub fn assign(
    metadata: &[ResourceMetadata],
    config: &DeployConfig,
) -> Result<TemplateAssignment, ValidationError> {
    parser::validate_limits(config)?;
    let base = TemplateDocument::empty(config)
        .to_bytes()
        .map(|b| b.len() as u64)
        .map_err(|e| ValidationError::InvalidLimits(e.to_string()))?;

    let mut order: Vec<usize> = (0..metadata.len()).collect();
    order.sort_by_key(|&i| metadata[i].index);

    let position: HashMap<&str, usize> = metadata
        .iter()
        .enumerate()
        .map(|(i, m)| (m.id.as_str(), i))
        .collect();

    let (mut units, unit_of) = build_units(metadata, &order);
    link_units(metadata, &position, &unit_of, &mut units)?;

    let unit_order = order_units(metadata, &units)?;

    let mut documents: Vec<DocumentPlan> = Vec::new();
    let mut placements: BTreeMap<String, String> = BTreeMap::new();

    for u in unit_order {
        let unit = &units[u];
        check_unit_fits(metadata, unit, base, config)?;
        let members = order_members(metadata, &position, unit)?;

        let fits = |doc: &DocumentPlan| {
            doc.estimated_size + unit.size <= config.max_template_size_bytes
                && doc.resources.len() + unit.members.len() <= config.max_resources_per_template
        };

        let root_ok = unit.prefers_root
            && documents.first().is_some_and(|root| {
                fits(root)
                    && unit.members.iter().all(|&m| {
                        metadata[m].dependencies.iter().all(|d| {
                            placements.get(d).is_none_or(|doc| doc == &root.id)
                        })
                    })
            });

        let target = if root_ok {
            0
        } else if documents.last().is_some_and(&fits) {
            documents.len() - 1
        } else {
            documents.push(DocumentPlan {
                id: format!("{}{}", config.template_prefix, documents.len() + 1),
                resources: Vec::new(),
                estimated_size: base,
            });
            documents.len() - 1
        };

        let doc = &mut documents[target];
        for m in members {
            placements.insert(metadata[m].id.clone(), doc.id.clone());
            doc.resources.push(metadata[m].id.clone());
        }
        doc.estimated_size += unit.size;
    }

    tracing::debug!(
        resources = placements.len(),
        documents = documents.len(),
        "assignment complete"
    );

    Ok(TemplateAssignment {
        placements,
        documents,
    })
}

/// Group resources into placement units, first-seen order.
fn build_units<'a>(
    metadata: &'a [ResourceMetadata],
    order: &[usize],
) -> (Vec<Unit<'a>>, Vec<usize>) {
    let mut units: Vec<Unit<'a>> = Vec::new();
    let mut unit_of = vec![0usize; metadata.len()];
    let mut groups: HashMap<&str, usize> = HashMap::new();

    for &i in order {
        let m = &metadata[i];
        let slot = match m.colocate.as_deref() {
            Some(group) => *groups.entry(group).or_insert_with(|| {
                units.push(Unit {
                    group: Some(group),
                    members: Vec::new(),
                    size: 0,
                    prefers_root: false,
                    deps: BTreeSet::new(),
                });
                units.len() - 1
            }),
            None => {
                units.push(Unit {
                    group: None,
                    members: Vec::new(),
                    size: 0,
                    prefers_root: false,
                    deps: BTreeSet::new(),
                });
                units.len() - 1
            }
        };
        let unit = &mut units[slot];
        unit.members.push(i);
        unit.size += m.estimated_size;
        unit.prefers_root |= m.affinity == Affinity::Root;
        unit_of[i] = slot;
    }

    (units, unit_of)
}

fn link_units(
    metadata: &[ResourceMetadata],
    position: &HashMap<&str, usize>,
    unit_of: &[usize],
    units: &mut [Unit<'_>],
) -> Result<(), ValidationError> {
    for (i, m) in metadata.iter().enumerate() {
        for dep in &m.dependencies {
            let &j = position
                .get(dep.as_str())
                .ok_or_else(|| ValidationError::UnknownDependency {
                    id: m.id.clone(),
                    dependency: dep.clone(),
                })?;
            if unit_of[j] != unit_of[i] {
                units[unit_of[i]].deps.insert(unit_of[j]);
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm over units; ties go to the smallest declaration index.
fn order_units(
    metadata: &[ResourceMetadata],
    units: &[Unit<'_>],
) -> Result<Vec<usize>, ValidationError> {
    let mut in_degree: Vec<usize> = units.iter().map(|u| u.deps.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); units.len()];
    for (u, unit) in units.iter().enumerate() {
        for &d in &unit.deps {
            dependents[d].push(u);
        }
    }

    let mut ready: BTreeSet<(usize, usize)> = units
        .iter()
        .enumerate()
        .filter(|(u, _)| in_degree[*u] == 0)
        .map(|(u, unit)| (unit.first_index(metadata), u))
        .collect();

    let mut order = Vec::with_capacity(units.len());
    while let Some((_, u)) = ready.pop_first() {
        order.push(u);
        for &next in &dependents[u] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert((units[next].first_index(metadata), next));
            }
        }
    }

    if order.len() < units.len() {
        let mut members: Vec<(usize, String)> = units
            .iter()
            .enumerate()
            .filter(|(u, _)| in_degree[*u] > 0)
            .flat_map(|(_, unit)| unit.members.iter())
            .map(|&m| (metadata[m].index, metadata[m].id.clone()))
            .collect();
        members.sort();
        return Err(ValidationError::DependencyCycle {
            members: members.into_iter().map(|(_, id)| id).collect(),
        });
    }

    Ok(order)
}

fn check_unit_fits(
    metadata: &[ResourceMetadata],
    unit: &Unit<'_>,
    base: u64,
    config: &DeployConfig,
) -> Result<(), ValidationError> {
    let too_big = base + unit.size > config.max_template_size_bytes
        || unit.members.len() > config.max_resources_per_template;
    if !too_big {
        return Ok(());
    }
    match unit.group {
        Some(group) => Err(ValidationError::ColocationOverflow {
            group: group.to_string(),
            members: unit.members.len(),
            size: unit.size,
            max_resources: config.max_resources_per_template,
            max_size: config.max_template_size_bytes,
        }),
        None => {
            let m = &metadata[unit.members[0]];
            Err(ValidationError::ResourceTooLarge {
                id: m.id.clone(),
                size: base + m.estimated_size,
                max_size: config.max_template_size_bytes,
            })
        }
    }
}

/// Topological order of a unit's members, declaration-order ties.
fn order_members(
    metadata: &[ResourceMetadata],
    position: &HashMap<&str, usize>,
    unit: &Unit<'_>,
) -> Result<Vec<usize>, ValidationError> {
    if unit.members.len() == 1 {
        return Ok(unit.members.clone());
    }
    let inside: BTreeSet<usize> = unit.members.iter().copied().collect();
    let mut in_degree: HashMap<usize, usize> = HashMap::new();
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    for &m in &unit.members {
        let local: BTreeSet<usize> = metadata[m]
            .dependencies
            .iter()
            .filter_map(|d| position.get(d.as_str()).copied())
            .filter(|j| inside.contains(j))
            .collect();
        in_degree.insert(m, local.len());
        for j in local {
            dependents.entry(j).or_default().push(m);
        }
    }

    let mut ready: BTreeSet<(usize, usize)> = unit
        .members
        .iter()
        .filter(|m| in_degree.get(m).copied() == Some(0))
        .map(|&m| (metadata[m].index, m))
        .collect();
    let mut order = Vec::with_capacity(unit.members.len());
    while let Some((_, m)) = ready.pop_first() {
        order.push(m);
        for &next in dependents.get(&m).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(&next) {
                *d -= 1;
                if *d == 0 {
                    ready.insert((metadata[next].index, next));
                }
            }
        }
    }

    if order.len() < unit.members.len() {
        let members = unit
            .members
            .iter()
            .filter(|m| !order.contains(m))
            .map(|&m| metadata[m].id.clone())
            .collect();
        return Err(ValidationError::DependencyCycle { members });
    }
    Ok(order)
}
