//! Node and edge persistence for the reference graph
//!
//! The graph builder owns these tables; a rebuild replaces the repository's
//! rows wholesale in one transaction. Reads serve graph navigation
//! (neighbors of a chunk, node lookup by qualified name).

use sqlx::Row;

use crate::graph::{CodeGraph, Edge, EdgeKind, Node};
use crate::language::ChunkKind;

use super::{Store, StoreError};

/// Edge traversal direction for neighbor queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Edges originating at the chunk
    Outgoing,
    /// Edges pointing at the chunk
    Incoming,
}

/// A neighbor edge joined with the node on its far side.
#[derive(Debug, Clone)]
pub struct NeighborEdge {
    pub edge: Edge,
    pub node: Node,
}

fn node_from_row(row: &sqlx::postgres::PgRow) -> Result<Node, StoreError> {
    let kind: String = row.get("node_kind");
    Ok(Node {
        chunk_id: row.get("chunk_id"),
        repository: row.get("repository"),
        kind: kind
            .parse::<ChunkKind>()
            .map_err(StoreError::Invalid)?,
        qualified_name: row.get("qualified_name"),
        file_path: row.get("file_path"),
        name: row.get("name"),
        pagerank: row.get("pagerank"),
        afferent_coupling: row.get::<i32, _>("afferent_coupling") as u32,
        efferent_coupling: row.get::<i32, _>("efferent_coupling") as u32,
    })
}

impl Store {
    /// Replace a repository's graph projection in one transaction.
    pub async fn replace_graph(
        &self,
        repository: &str,
        graph: &CodeGraph,
    ) -> Result<(), StoreError> {
        let _span = tracing::info_span!(
            "replace_graph",
            repository,
            nodes = graph.nodes.len(),
            edges = graph.edges.len()
        )
        .entered();

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM edges WHERE repository = $1")
            .bind(repository)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM nodes WHERE repository = $1")
            .bind(repository)
            .execute(&mut *tx)
            .await?;

        for node in &graph.nodes {
            sqlx::query(
                "INSERT INTO nodes \
                 (chunk_id, repository, node_kind, qualified_name, file_path, name, \
                  pagerank, afferent_coupling, efferent_coupling) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (chunk_id) DO UPDATE SET \
                  qualified_name = EXCLUDED.qualified_name, \
                  pagerank = EXCLUDED.pagerank, \
                  afferent_coupling = EXCLUDED.afferent_coupling, \
                  efferent_coupling = EXCLUDED.efferent_coupling",
            )
            .bind(&node.chunk_id)
            .bind(&node.repository)
            .bind(node.kind.as_str())
            .bind(&node.qualified_name)
            .bind(&node.file_path)
            .bind(&node.name)
            .bind(node.pagerank)
            .bind(node.afferent_coupling as i32)
            .bind(node.efferent_coupling as i32)
            .execute(&mut *tx)
            .await?;
        }

        for edge in &graph.edges {
            sqlx::query(
                "INSERT INTO edges \
                 (repository, src_chunk_id, dst_chunk_id, edge_kind, call_count, \
                  importance_score, critical_path) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(repository)
            .bind(&edge.src_chunk_id)
            .bind(&edge.dst_chunk_id)
            .bind(edge.kind.as_str())
            .bind(edge.call_count as i32)
            .bind(edge.importance_score)
            .bind(edge.critical_path)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Look a node up by its fully-qualified name.
    pub async fn node_by_qualified_name(
        &self,
        repository: &str,
        qualified_name: &str,
    ) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query(
            "SELECT chunk_id, repository, node_kind, qualified_name, file_path, name, \
             pagerank, afferent_coupling, efferent_coupling \
             FROM nodes WHERE repository = $1 AND qualified_name = $2",
        )
        .bind(repository)
        .bind(qualified_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    /// Neighbors of a chunk in the given direction, most important first.
    pub async fn neighbors(
        &self,
        repository: &str,
        chunk_id: &str,
        direction: Direction,
        kind: Option<EdgeKind>,
        limit: i64,
    ) -> Result<Vec<NeighborEdge>, StoreError> {
        let (match_col, join_col) = match direction {
            Direction::Outgoing => ("src_chunk_id", "dst_chunk_id"),
            Direction::Incoming => ("dst_chunk_id", "src_chunk_id"),
        };

        let kind_clause = if kind.is_some() {
            " AND e.edge_kind = $3"
        } else {
            ""
        };
        let sql = format!(
            "SELECT e.src_chunk_id, e.dst_chunk_id, e.edge_kind, e.call_count, \
             e.importance_score, e.critical_path, \
             n.chunk_id, n.repository, n.node_kind, n.qualified_name, n.file_path, n.name, \
             n.pagerank, n.afferent_coupling, n.efferent_coupling \
             FROM edges e JOIN nodes n ON n.chunk_id = e.{join_col} \
             WHERE e.repository = $1 AND e.{match_col} = $2{kind_clause} \
             ORDER BY e.importance_score DESC, e.call_count DESC LIMIT {limit}"
        );

        let mut query = sqlx::query(&sql).bind(repository).bind(chunk_id);
        if let Some(kind) = kind {
            query = query.bind(kind.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                let edge_kind: String = row.get("edge_kind");
                Ok(NeighborEdge {
                    edge: Edge {
                        src_chunk_id: row.get("src_chunk_id"),
                        dst_chunk_id: row.get("dst_chunk_id"),
                        kind: edge_kind
                            .parse::<EdgeKind>()
                            .map_err(StoreError::Invalid)?,
                        call_count: row.get::<i32, _>("call_count") as u32,
                        importance_score: row.get("importance_score"),
                        critical_path: row.get("critical_path"),
                    },
                    node: node_from_row(row)?,
                })
            })
            .collect()
    }
}
