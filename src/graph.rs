//! Cross-reference graph construction
//!
//! Projects a repository's chunks onto a directed graph in two passes:
//!
//! 1. **Declaration pass**: one node per nameable chunk, keyed by its
//!    fully-qualified name within the repository.
//! 2. **Reference pass**: each chunk's extracted references are resolved
//!    against the declaration table (same file > same directory >
//!    repository-wide) and become typed edges. Unresolved references are
//!    dropped; repeated references increment `call_count`.
//!
//! Cycles are expected (mutual recursion) and represented as plain directed
//! edges. Pagerank (damping 0.85) runs over the `calls` subgraph afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::chunker::Chunk;
use crate::language::ChunkKind;

/// Directed reference kind between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Calls,
    Imports,
    Inherits,
    Implements,
    References,
}

impl EdgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::Calls => "calls",
            EdgeKind::Imports => "imports",
            EdgeKind::Inherits => "inherits",
            EdgeKind::Implements => "implements",
            EdgeKind::References => "references",
        }
    }

    /// Kinds for which a self-loop is structurally invalid.
    pub fn forbids_self_loop(self) -> bool {
        matches!(self, EdgeKind::Inherits | EdgeKind::Implements)
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EdgeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calls" => Ok(EdgeKind::Calls),
            "imports" => Ok(EdgeKind::Imports),
            "inherits" => Ok(EdgeKind::Inherits),
            "implements" => Ok(EdgeKind::Implements),
            "references" => Ok(EdgeKind::References),
            other => Err(format!("unknown edge kind: '{}'", other)),
        }
    }
}

/// Graph projection of a nameable chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Back-reference to the chunk identity
    pub chunk_id: String,
    pub repository: String,
    pub kind: ChunkKind,
    /// `file_path::name`, unique within the repository snapshot
    pub qualified_name: String,
    pub file_path: String,
    pub name: String,
    /// Pagerank over the calls subgraph; None until computed
    pub pagerank: Option<f64>,
    /// Distinct nodes referencing this one
    pub afferent_coupling: u32,
    /// Distinct nodes this one references
    pub efferent_coupling: u32,
}

/// Directed reference between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub src_chunk_id: String,
    pub dst_chunk_id: String,
    pub kind: EdgeKind,
    /// Number of reference sites collapsed into this edge
    pub call_count: u32,
    /// Normalized reference weight in [0, 1]
    pub importance_score: f32,
    /// Both endpoints sit in the top pagerank decile
    pub critical_path: bool,
}

/// Nodes and deduplicated edges for one repository snapshot.
#[derive(Debug, Default)]
pub struct CodeGraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// Pagerank damping factor
const DAMPING: f64 = 0.85;
/// Iteration cap for pagerank convergence
const MAX_ITERATIONS: usize = 50;
/// L1 convergence threshold
const CONVERGENCE: f64 = 1e-6;
/// Pagerank percentile above which edges are flagged critical
const CRITICAL_PERCENTILE: f64 = 0.90;

/// Build the reference graph for one repository's chunks.
pub fn build_graph(chunks: &[Chunk]) -> CodeGraph {
    let _span = tracing::info_span!("build_graph", chunks = chunks.len()).entered();

    // Declaration pass: nodes for nameable chunks only
    let declared: Vec<&Chunk> = chunks.iter().filter(|c| c.nameable).collect();
    let mut nodes: Vec<Node> = declared
        .iter()
        .map(|c| Node {
            chunk_id: c.chunk_id(),
            repository: c.repository.clone(),
            kind: c.kind,
            qualified_name: c.qualified_name(),
            file_path: c.file_path.clone(),
            name: c.name.clone(),
            pagerank: None,
            afferent_coupling: 0,
            efferent_coupling: 0,
        })
        .collect();

    // Declaration table: simple name -> declaring chunk indexes
    let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, chunk) in declared.iter().enumerate() {
        by_name.entry(chunk.name.as_str()).or_default().push(idx);
    }

    // Reference pass: anonymous chunks never originate edges
    let mut edge_map: HashMap<(String, String, EdgeKind), u32> = HashMap::new();
    for chunk in chunks.iter().filter(|c| c.nameable) {
        let src_id = chunk.chunk_id();
        for reference in &chunk.references {
            let Some(target) = resolve(&by_name, &declared, chunk, &reference.name) else {
                continue; // unresolved references are silently dropped
            };
            let dst_id = declared[target].chunk_id();
            if src_id == dst_id && reference.kind.forbids_self_loop() {
                continue;
            }
            *edge_map
                .entry((src_id.clone(), dst_id, reference.kind))
                .or_insert(0) += 1;
        }
    }

    let max_count = edge_map.values().copied().max().unwrap_or(1) as f32;
    let mut edges: Vec<Edge> = edge_map
        .into_iter()
        .map(|((src, dst, kind), count)| Edge {
            src_chunk_id: src,
            dst_chunk_id: dst,
            kind,
            call_count: count,
            importance_score: (count as f32 / max_count).clamp(0.0, 1.0),
            critical_path: false,
        })
        .collect();
    edges.sort_by(|a, b| {
        (&a.src_chunk_id, &a.dst_chunk_id, a.kind.as_str()).cmp(&(
            &b.src_chunk_id,
            &b.dst_chunk_id,
            b.kind.as_str(),
        ))
    });

    compute_coupling(&mut nodes, &edges);
    compute_pagerank(&mut nodes, &edges);
    flag_critical_edges(&nodes, &mut edges);

    CodeGraph { nodes, edges }
}

/// Resolve a referenced name against the declaration table.
///
/// Precedence: same file > same directory > repository-wide, with
/// lexicographic tie-breaking inside a scope so resolution is deterministic.
fn resolve(
    by_name: &HashMap<&str, Vec<usize>>,
    declared: &[&Chunk],
    from: &Chunk,
    name: &str,
) -> Option<usize> {
    let candidates = by_name.get(name)?;

    let pick = |pred: &dyn Fn(&Chunk) -> bool| -> Option<usize> {
        candidates
            .iter()
            .copied()
            .filter(|&i| pred(declared[i]))
            .min_by_key(|&i| (declared[i].file_path.clone(), declared[i].line_start))
    };

    pick(&|c: &Chunk| c.file_path == from.file_path)
        .or_else(|| pick(&|c: &Chunk| c.dir_path() == from.dir_path()))
        .or_else(|| pick(&|_| true))
}

fn compute_coupling(nodes: &mut [Node], edges: &[Edge]) {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.chunk_id.as_str(), i))
        .collect();
    let mut afferent: HashMap<usize, std::collections::HashSet<&str>> = HashMap::new();
    let mut efferent: HashMap<usize, std::collections::HashSet<&str>> = HashMap::new();

    for edge in edges {
        if let Some(&src) = index.get(edge.src_chunk_id.as_str()) {
            efferent.entry(src).or_default().insert(&edge.dst_chunk_id);
        }
        if let Some(&dst) = index.get(edge.dst_chunk_id.as_str()) {
            afferent.entry(dst).or_default().insert(&edge.src_chunk_id);
        }
    }

    for (i, node) in nodes.iter_mut().enumerate() {
        node.afferent_coupling = afferent.get(&i).map_or(0, |s| s.len() as u32);
        node.efferent_coupling = efferent.get(&i).map_or(0, |s| s.len() as u32);
    }
}

/// Pagerank with damping 0.85 over the `calls` edge subgraph.
///
/// Dangling mass is redistributed uniformly; iteration stops at convergence
/// or [`MAX_ITERATIONS`].
fn compute_pagerank(nodes: &mut [Node], edges: &[Edge]) {
    let n = nodes.len();
    if n == 0 {
        return;
    }

    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.chunk_id.as_str(), i))
        .collect();

    // Out-links over the calls subgraph only
    let mut out_links: Vec<Vec<usize>> = vec![Vec::new(); n];
    for edge in edges.iter().filter(|e| e.kind == EdgeKind::Calls) {
        if let (Some(&src), Some(&dst)) = (
            index.get(edge.src_chunk_id.as_str()),
            index.get(edge.dst_chunk_id.as_str()),
        ) {
            out_links[src].push(dst);
        }
    }

    let uniform = 1.0 / n as f64;
    let mut ranks = vec![uniform; n];

    for _ in 0..MAX_ITERATIONS {
        let mut next = vec![(1.0 - DAMPING) / n as f64; n];
        let mut dangling = 0.0;

        for (src, targets) in out_links.iter().enumerate() {
            if targets.is_empty() {
                dangling += ranks[src];
            } else {
                let share = ranks[src] / targets.len() as f64;
                for &dst in targets {
                    next[dst] += DAMPING * share;
                }
            }
        }

        let dangling_share = DAMPING * dangling / n as f64;
        for rank in next.iter_mut() {
            *rank += dangling_share;
        }

        let diff: f64 = ranks
            .iter()
            .zip(next.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        ranks = next;
        if diff < CONVERGENCE {
            break;
        }
    }

    for (node, rank) in nodes.iter_mut().zip(ranks) {
        node.pagerank = Some(rank);
    }
}

/// Flag edges whose endpoints both sit in the top pagerank decile.
fn flag_critical_edges(nodes: &[Node], edges: &mut [Edge]) {
    let mut ranks: Vec<f64> = nodes.iter().filter_map(|n| n.pagerank).collect();
    if ranks.is_empty() {
        return;
    }
    ranks.sort_by(|a, b| a.total_cmp(b));
    let cut_idx = ((ranks.len() as f64 - 1.0) * CRITICAL_PERCENTILE) as usize;
    let threshold = ranks[cut_idx];

    let rank_of: HashMap<&str, f64> = nodes
        .iter()
        .filter_map(|n| n.pagerank.map(|r| (n.chunk_id.as_str(), r)))
        .collect();

    for edge in edges.iter_mut() {
        let src = rank_of.get(edge.src_chunk_id.as_str()).copied();
        let dst = rank_of.get(edge.dst_chunk_id.as_str()).copied();
        edge.critical_path = matches!((src, dst), (Some(s), Some(d)) if s >= threshold && d >= threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkMetrics, RawReference};
    use crate::language::Language;

    fn chunk(file: &str, name: &str, kind: ChunkKind, line: u32, nameable: bool) -> Chunk {
        Chunk {
            repository: "repo".to_string(),
            file_path: file.to_string(),
            language: Language::Python,
            kind,
            name: name.to_string(),
            nameable,
            source: format!("def {}(): pass", name),
            byte_start: 0,
            byte_end: 10,
            line_start: line,
            line_end: line + 1,
            content_hash: blake3::hash(name.as_bytes()).to_hex().to_string(),
            signature: None,
            doc: None,
            metrics: ChunkMetrics::default(),
            references: Vec::new(),
        }
    }

    fn with_refs(mut c: Chunk, refs: Vec<(&str, EdgeKind)>) -> Chunk {
        c.references = refs
            .into_iter()
            .map(|(name, kind)| RawReference {
                name: name.to_string(),
                kind,
                line: c.line_start,
            })
            .collect();
        c
    }

    #[test]
    fn test_declaration_pass_skips_anonymous() {
        let chunks = vec![
            chunk("a.py", "alpha", ChunkKind::Function, 1, true),
            chunk("a.py", "function@9", ChunkKind::Function, 9, false),
        ];
        let graph = build_graph(&chunks);
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].qualified_name, "a.py::alpha");
    }

    #[test]
    fn test_anonymous_callers_originate_no_edges() {
        let chunks = vec![
            chunk("a.py", "alpha", ChunkKind::Function, 1, true),
            with_refs(
                chunk("a.py", "function@9", ChunkKind::Function, 9, false),
                vec![("alpha", EdgeKind::Calls)],
            ),
        ];
        let graph = build_graph(&chunks);
        assert!(graph.edges.is_empty());
    }

    #[test]
    fn test_resolution_prefers_same_file() {
        let chunks = vec![
            chunk("pkg/a.py", "helper", ChunkKind::Function, 1, true),
            chunk("pkg/b.py", "helper", ChunkKind::Function, 1, true),
            chunk("other/c.py", "helper", ChunkKind::Function, 1, true),
            with_refs(
                chunk("pkg/a.py", "caller", ChunkKind::Function, 10, true),
                vec![("helper", EdgeKind::Calls)],
            ),
        ];
        let graph = build_graph(&chunks);
        assert_eq!(graph.edges.len(), 1);
        let target = graph
            .nodes
            .iter()
            .find(|n| n.chunk_id == graph.edges[0].dst_chunk_id)
            .unwrap();
        assert_eq!(target.qualified_name, "pkg/a.py::helper");
    }

    #[test]
    fn test_resolution_falls_back_to_same_directory_then_repo() {
        let chunks = vec![
            chunk("pkg/b.py", "helper", ChunkKind::Function, 1, true),
            chunk("other/c.py", "helper", ChunkKind::Function, 1, true),
            with_refs(
                chunk("pkg/a.py", "caller", ChunkKind::Function, 10, true),
                vec![("helper", EdgeKind::Calls)],
            ),
            with_refs(
                chunk("third/d.py", "distant", ChunkKind::Function, 10, true),
                vec![("helper", EdgeKind::Calls)],
            ),
        ];
        let graph = build_graph(&chunks);

        let node_name = |id: &str| {
            graph
                .nodes
                .iter()
                .find(|n| n.chunk_id == id)
                .unwrap()
                .qualified_name
                .clone()
        };

        let from_pkg = graph
            .edges
            .iter()
            .find(|e| node_name(&e.src_chunk_id) == "pkg/a.py::caller")
            .unwrap();
        assert_eq!(node_name(&from_pkg.dst_chunk_id), "pkg/b.py::helper");

        // Repo-wide fallback is deterministic: lexicographically first file
        let from_third = graph
            .edges
            .iter()
            .find(|e| node_name(&e.src_chunk_id) == "third/d.py::distant")
            .unwrap();
        assert_eq!(node_name(&from_third.dst_chunk_id), "other/c.py::helper");
    }

    #[test]
    fn test_unresolved_references_dropped() {
        let chunks = vec![with_refs(
            chunk("a.py", "caller", ChunkKind::Function, 1, true),
            vec![("does_not_exist", EdgeKind::Calls)],
        )];
        let graph = build_graph(&chunks);
        assert!(graph.edges.is_empty());
    }

    #[test]
    fn test_repeated_references_increment_call_count() {
        let chunks = vec![
            chunk("a.py", "helper", ChunkKind::Function, 1, true),
            with_refs(
                chunk("a.py", "caller", ChunkKind::Function, 10, true),
                vec![("helper", EdgeKind::Calls), ("helper", EdgeKind::Calls)],
            ),
        ];
        let graph = build_graph(&chunks);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].call_count, 2);
        assert!((graph.edges[0].importance_score - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_no_self_loops_for_inheritance() {
        // A class whose reference resolves back to itself (name shadowing)
        let chunks = vec![with_refs(
            chunk("a.py", "Base", ChunkKind::Class, 1, true),
            vec![("Base", EdgeKind::Inherits), ("Base", EdgeKind::Calls)],
        )];
        let graph = build_graph(&chunks);
        // inherits self-loop dropped; calls self-loop kept (recursion)
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].kind, EdgeKind::Calls);
    }

    #[test]
    fn test_pagerank_favors_called_nodes() {
        let chunks = vec![
            chunk("a.py", "hub", ChunkKind::Function, 1, true),
            with_refs(
                chunk("a.py", "c1", ChunkKind::Function, 10, true),
                vec![("hub", EdgeKind::Calls)],
            ),
            with_refs(
                chunk("a.py", "c2", ChunkKind::Function, 20, true),
                vec![("hub", EdgeKind::Calls)],
            ),
            with_refs(
                chunk("a.py", "c3", ChunkKind::Function, 30, true),
                vec![("hub", EdgeKind::Calls)],
            ),
        ];
        let graph = build_graph(&chunks);

        let rank = |name: &str| {
            graph
                .nodes
                .iter()
                .find(|n| n.name == name)
                .unwrap()
                .pagerank
                .unwrap()
        };
        assert!(rank("hub") > rank("c1"));

        let total: f64 = graph.nodes.iter().filter_map(|n| n.pagerank).sum();
        assert!((total - 1.0).abs() < 1e-6, "pagerank sums to 1, got {total}");
    }

    #[test]
    fn test_pagerank_handles_cycles() {
        let chunks = vec![
            with_refs(
                chunk("a.py", "ping", ChunkKind::Function, 1, true),
                vec![("pong", EdgeKind::Calls)],
            ),
            with_refs(
                chunk("a.py", "pong", ChunkKind::Function, 10, true),
                vec![("ping", EdgeKind::Calls)],
            ),
        ];
        let graph = build_graph(&chunks);
        for node in &graph.nodes {
            let rank = node.pagerank.unwrap();
            assert!(rank.is_finite() && rank > 0.0);
        }
    }

    #[test]
    fn test_coupling_counts() {
        let chunks = vec![
            chunk("a.py", "hub", ChunkKind::Function, 1, true),
            with_refs(
                chunk("a.py", "c1", ChunkKind::Function, 10, true),
                vec![("hub", EdgeKind::Calls)],
            ),
            with_refs(
                chunk("a.py", "c2", ChunkKind::Function, 20, true),
                vec![("hub", EdgeKind::Calls)],
            ),
        ];
        let graph = build_graph(&chunks);
        let hub = graph.nodes.iter().find(|n| n.name == "hub").unwrap();
        assert_eq!(hub.afferent_coupling, 2);
        assert_eq!(hub.efferent_coupling, 0);
        let c1 = graph.nodes.iter().find(|n| n.name == "c1").unwrap();
        assert_eq!(c1.efferent_coupling, 1);
    }
}
