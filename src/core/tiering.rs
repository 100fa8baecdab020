//! SF-010: Document dependency graph and deployment tiers.
//!
//! Edges run producer → consumer and are keyed by document id. Cycle
//! detection is a standalone DFS so it can be tested without tiering.
//! Tiers come from repeated Kahn layering: tier 0 has no predecessors,
//! tier k only has predecessors in tiers < k.

use super::types::*;
use crate::error::ValidationError;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Directed graph over document ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentGraph {
    /// Documents in assignment order
    nodes: Vec<String>,
    /// producer → consumers
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DocumentGraph {
    pub fn new(nodes: Vec<String>) -> Self {
        Self {
            nodes,
            edges: BTreeMap::new(),
        }
    }

    /// Edges from cross-document references and declared ordering.
    pub fn from_synthesis(assignment: &TemplateAssignment, synthesis: &Synthesis) -> Self {
        let mut graph = Self::new(assignment.document_ids());
        for r in &synthesis.cross_references {
            graph.add_edge(&r.producer, &r.consumer);
        }
        for (producer, consumer) in &synthesis.ordering_edges {
            graph.add_edge(producer, consumer);
        }
        graph
    }

    /// Projection from resource dependencies, before anything is rendered.
    pub fn from_metadata(assignment: &TemplateAssignment, metadata: &[ResourceMetadata]) -> Self {
        let mut graph = Self::new(assignment.document_ids());
        for m in metadata {
            let Some(consumer) = assignment.document_of(&m.id) else {
                continue;
            };
            for dep in &m.dependencies {
                if let Some(producer) = assignment.document_of(dep) {
                    graph.add_edge(producer, consumer);
                }
            }
        }
        graph
    }

    /// Add `from → to`. Self edges are ignored; unknown ids become nodes.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        for id in [from, to] {
            if !self.nodes.iter().any(|n| n == id) {
                self.nodes.push(id.to_string());
            }
        }
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    }

    pub fn documents(&self) -> &[String] {
        &self.nodes
    }

    pub fn successors(&self, doc: &str) -> impl DoubleEndedIterator<Item = &String> {
        self.edges.get(doc).into_iter().flatten()
    }

    /// Producers a document waits for, sorted.
    pub fn predecessors(&self, doc: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|(_, consumers)| consumers.contains(doc))
            .map(|(producer, _)| producer.as_str())
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Find a cycle, returned as a closed path (`[a, b, a]`).
pub fn detect_cycle(graph: &DocumentGraph) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = graph
        .nodes
        .iter()
        .map(|n| (n.as_str(), Mark::Unvisited))
        .collect();

    for start in &graph.nodes {
        if marks.get(start.as_str()) != Some(&Mark::Unvisited) {
            continue;
        }
        // Iterative DFS: (node, successors not yet explored)
        let mut stack: Vec<(&str, Vec<&str>)> = Vec::new();
        let mut path: Vec<&str> = Vec::new();
        let start = start.as_str();
        marks.insert(start, Mark::OnStack);
        stack.push((start, graph.successors(start).rev().map(String::as_str).collect()));
        path.push(start);

        while let Some((node, pending)) = stack.last_mut() {
            match pending.pop() {
                Some(next) => match marks.get(next).copied().unwrap_or(Mark::Unvisited) {
                    Mark::OnStack => {
                        let from = path.iter().position(|p| *p == next).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[from..].iter().map(|s| s.to_string()).collect();
                        cycle.push(next.to_string());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        marks.insert(next, Mark::OnStack);
                        let succ = graph.successors(next).rev().map(String::as_str).collect();
                        stack.push((next, succ));
                        path.push(next);
                    }
                    Mark::Done => {}
                },
                None => {
                    let done = *node;
                    marks.insert(done, Mark::Done);
                    stack.pop();
                    path.pop();
                }
            }
        }
    }
    None
}

/// Layer documents into tiers. Within a tier, documents keep assignment order.
pub fn compute_tiers(graph: &DocumentGraph) -> Result<Vec<DeploymentTier>, ValidationError> {
    if let Some(path) = detect_cycle(graph) {
        return Err(ValidationError::DocumentCycle { path });
    }

    let position: HashMap<&str, usize> = graph
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();
    let mut in_degree: HashMap<&str, usize> =
        graph.nodes.iter().map(|n| (n.as_str(), 0)).collect();
    for consumers in graph.edges.values() {
        for c in consumers {
            if let Some(d) = in_degree.get_mut(c.as_str()) {
                *d += 1;
            }
        }
    }

    let mut current: Vec<&str> = graph
        .nodes
        .iter()
        .map(String::as_str)
        .filter(|n| in_degree.get(n).copied() == Some(0))
        .collect();

    let mut tiers = Vec::new();
    while !current.is_empty() {
        current.sort_by_key(|n| position.get(n).copied().unwrap_or(usize::MAX));
        let mut next: Vec<&str> = Vec::new();
        for doc in &current {
            for consumer in graph.successors(doc) {
                if let Some(d) = in_degree.get_mut(consumer.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        next.push(consumer.as_str());
                    }
                }
            }
        }
        tiers.push(DeploymentTier {
            index: tiers.len(),
            documents: current.iter().map(|s| s.to_string()).collect(),
        });
        current = next;
    }

    Ok(tiers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[&str], edges: &[(&str, &str)]) -> DocumentGraph {
        let mut g = DocumentGraph::new(nodes.iter().map(|s| s.to_string()).collect());
        for (a, b) in edges {
            g.add_edge(a, b);
        }
        g
    }

    fn tier_docs(tiers: &[DeploymentTier]) -> Vec<Vec<&str>> {
        tiers
            .iter()
            .map(|t| t.documents.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn test_sf010_chain() {
        let g = graph(&["T1", "T2", "T3"], &[("T1", "T2"), ("T2", "T3")]);
        let tiers = compute_tiers(&g).unwrap();
        assert_eq!(tier_docs(&tiers), vec![vec!["T1"], vec!["T2"], vec!["T3"]]);
        assert_eq!(tiers[2].index, 2);
    }

    #[test]
    fn test_sf010_independent_documents_share_tier() {
        let g = graph(&["T1", "T2", "T3"], &[]);
        let tiers = compute_tiers(&g).unwrap();
        assert_eq!(tier_docs(&tiers), vec![vec!["T1", "T2", "T3"]]);
    }

    #[test]
    fn test_sf010_diamond() {
        let g = graph(
            &["T1", "T2", "T3", "T4"],
            &[("T1", "T3"), ("T1", "T2"), ("T2", "T4"), ("T3", "T4")],
        );
        let tiers = compute_tiers(&g).unwrap();
        assert_eq!(
            tier_docs(&tiers),
            vec![vec!["T1"], vec!["T2", "T3"], vec!["T4"]]
        );
    }

    #[test]
    fn test_sf010_longest_path_decides_tier() {
        // T4 waits for T1 directly and for T3 through T2
        let g = graph(
            &["T1", "T2", "T3", "T4"],
            &[("T1", "T4"), ("T1", "T2"), ("T2", "T3"), ("T3", "T4")],
        );
        let tiers = compute_tiers(&g).unwrap();
        assert_eq!(tier_docs(&tiers).last().unwrap(), &vec!["T4"]);
        assert_eq!(tiers.len(), 4);
    }

    #[test]
    fn test_sf010_detect_cycle_path() {
        let g = graph(&["T1", "T2", "T3"], &[("T1", "T2"), ("T2", "T3"), ("T3", "T1")]);
        let cycle = detect_cycle(&g).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn test_sf010_no_cycle() {
        let g = graph(&["T1", "T2"], &[("T1", "T2")]);
        assert_eq!(detect_cycle(&g), None);
    }

    #[test]
    fn test_sf010_cycle_is_fatal() {
        let g = graph(&["T1", "T2"], &[("T1", "T2"), ("T2", "T1")]);
        assert!(matches!(
            compute_tiers(&g),
            Err(ValidationError::DocumentCycle { .. })
        ));
    }

    #[test]
    fn test_sf010_self_edges_ignored() {
        let g = graph(&["T1"], &[("T1", "T1")]);
        assert_eq!(g.edge_count(), 0);
        assert_eq!(compute_tiers(&g).unwrap().len(), 1);
    }

    #[test]
    fn test_sf010_tier_soundness() {
        let g = graph(
            &["T1", "T2", "T3", "T4", "T5"],
            &[("T2", "T1"), ("T3", "T1"), ("T5", "T4"), ("T1", "T4")],
        );
        let tiers = compute_tiers(&g).unwrap();
        let tier_of: HashMap<&str, usize> = tiers
            .iter()
            .flat_map(|t| t.documents.iter().map(move |d| (d.as_str(), t.index)))
            .collect();
        for doc in g.documents() {
            for pred in g.predecessors(doc) {
                assert!(tier_of[pred] < tier_of[doc.as_str()]);
            }
        }
    }

    #[test]
    fn test_sf010_from_metadata() {
        let assignment = TemplateAssignment {
            placements: BTreeMap::from([
                ("a".to_string(), "T1".to_string()),
                ("b".to_string(), "T2".to_string()),
                ("c".to_string(), "T2".to_string()),
            ]),
            documents: vec![
                DocumentPlan {
                    id: "T1".to_string(),
                    resources: vec!["a".to_string()],
                    estimated_size: 0,
                },
                DocumentPlan {
                    id: "T2".to_string(),
                    resources: vec!["b".to_string(), "c".to_string()],
                    estimated_size: 0,
                },
            ],
        };
        let meta = |id: &str, deps: &[&str]| ResourceMetadata {
            id: id.to_string(),
            resource_type: "t".to_string(),
            index: 0,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            references: vec![],
            estimated_size: 0,
            colocate: None,
            affinity: Affinity::Any,
        };
        let metadata = vec![meta("a", &[]), meta("b", &["a"]), meta("c", &["b"])];
        let g = DocumentGraph::from_metadata(&assignment, &metadata);
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.predecessors("T2"), vec!["T1"]);
    }
}
