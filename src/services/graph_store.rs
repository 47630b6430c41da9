//! Traversal-optimized projection of configuration items and relationships.
//!
//! The graph store is a derived view: the relational store owns the data and
//! the dispatcher projects it here through idempotent merge/delete
//! operations keyed by stable entity ids. Re-applying a completed event is a
//! no-op; deletes tolerate absent nodes and edges.

use crate::error::{Result, SyncError};
use crate::types::{ConfigurationItem, EntityType, GraphView, Relationship};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Projected configuration item node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub ci_type: String,
    pub attributes: Map<String, Value>,
    pub tags: Vec<String>,
    pub updated_at: i64,
    pub synced_at: i64,
}

impl GraphNode {
    pub fn from_ci(ci: &ConfigurationItem, synced_at: i64) -> Self {
        Self {
            id: ci.id,
            name: ci.name.clone(),
            ci_type: ci.ci_type.clone(),
            attributes: ci.attributes.clone(),
            tags: ci.tags.clone(),
            updated_at: ci.updated_at,
            synced_at,
        }
    }

    /// Owned JSON snapshot for conflict records.
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Projected relationship edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub attributes: Map<String, Value>,
    pub updated_at: i64,
    pub synced_at: i64,
}

impl GraphEdge {
    pub fn from_relationship(rel: &Relationship, synced_at: i64) -> Self {
        Self {
            id: rel.id,
            rel_type: rel.rel_type.clone(),
            source_id: rel.source_id,
            target_id: rel.target_id,
            attributes: rel.attributes.clone(),
            updated_at: rel.updated_at,
            synced_at,
        }
    }

    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// In-process graph projection store.
///
/// Nodes and edges are keyed by id with a unique constraint, with an
/// adjacency index for traversal. All operations observe the availability
/// flag so outages (maintenance or failover drills) surface as transient
/// errors exactly like a remote graph store would.
pub struct GraphStore {
    nodes: DashMap<Uuid, GraphNode>,
    edges: DashMap<Uuid, GraphEdge>,
    /// Adjacency: node id -> incident edge ids.
    adjacency: DashMap<Uuid, HashSet<Uuid>>,
    available: AtomicBool,
}

impl GraphStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            edges: DashMap::new(),
            adjacency: DashMap::new(),
            available: AtomicBool::new(true),
        })
    }

    /// Take the store offline or bring it back (failover drills, tests).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Connectivity probe used by the monitor.
    pub fn ping(&self) -> Result<()> {
        self.ensure_available()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::TransientIo("graph store unavailable".to_string()))
        }
    }

    // ========== Idempotent apply procedures ==========

    /// MERGE a node by id, overwriting projected fields.
    pub fn merge_node(&self, node: GraphNode) -> Result<()> {
        self.ensure_available()?;
        self.adjacency.entry(node.id).or_default();
        self.nodes.insert(node.id, node);
        Ok(())
    }

    /// DETACH DELETE a node: removes the node and every incident edge.
    /// Absent nodes are a no-op.
    pub fn delete_node(&self, id: Uuid) -> Result<()> {
        self.ensure_available()?;
        if let Some((_, incident)) = self.adjacency.remove(&id) {
            for edge_id in incident {
                if let Some((_, edge)) = self.edges.remove(&edge_id) {
                    let other = if edge.source_id == id {
                        edge.target_id
                    } else {
                        edge.source_id
                    };
                    if let Some(mut set) = self.adjacency.get_mut(&other) {
                        set.remove(&edge_id);
                    }
                }
            }
        }
        if self.nodes.remove(&id).is_some() {
            debug!("Detach-deleted graph node {}", id);
        }
        Ok(())
    }

    /// MERGE an edge by id. Both endpoints must already be projected.
    pub fn merge_edge(&self, edge: GraphEdge) -> Result<()> {
        self.ensure_available()?;
        if !self.nodes.contains_key(&edge.source_id) {
            return Err(SyncError::Dependency {
                entity_type: EntityType::ConfigurationItem,
                entity_id: edge.source_id,
            });
        }
        if !self.nodes.contains_key(&edge.target_id) {
            return Err(SyncError::Dependency {
                entity_type: EntityType::ConfigurationItem,
                entity_id: edge.target_id,
            });
        }

        // Re-merging under the same id replaces the edge; stale endpoint
        // links are unhooked first.
        if let Some(previous) = self.edges.get(&edge.id).map(|e| e.value().clone()) {
            if previous.source_id != edge.source_id || previous.target_id != edge.target_id {
                for endpoint in [previous.source_id, previous.target_id] {
                    if let Some(mut set) = self.adjacency.get_mut(&endpoint) {
                        set.remove(&edge.id);
                    }
                }
            }
        }

        self.adjacency.entry(edge.source_id).or_default().insert(edge.id);
        self.adjacency.entry(edge.target_id).or_default().insert(edge.id);
        self.edges.insert(edge.id, edge);
        Ok(())
    }

    /// DELETE an edge; absent edges are a no-op.
    pub fn delete_edge(&self, id: Uuid) -> Result<()> {
        self.ensure_available()?;
        if let Some((_, edge)) = self.edges.remove(&id) {
            for endpoint in [edge.source_id, edge.target_id] {
                if let Some(mut set) = self.adjacency.get_mut(&endpoint) {
                    set.remove(&id);
                }
            }
        }
        Ok(())
    }

    // ========== Reads ==========

    pub fn get_node(&self, id: Uuid) -> Result<Option<GraphNode>> {
        self.ensure_available()?;
        Ok(self.nodes.get(&id).map(|n| n.value().clone()))
    }

    pub fn get_edge(&self, id: Uuid) -> Result<Option<GraphEdge>> {
        self.ensure_available()?;
        Ok(self.edges.get(&id).map(|e| e.value().clone()))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edges incident to a node.
    pub fn edges_of(&self, node_id: Uuid) -> Result<Vec<GraphEdge>> {
        self.ensure_available()?;
        let Some(incident) = self.adjacency.get(&node_id) else {
            return Ok(Vec::new());
        };
        Ok(incident
            .iter()
            .filter_map(|edge_id| self.edges.get(edge_id).map(|e| e.value().clone()))
            .collect())
    }

    /// Breadth-first traversal from a root, bounded by depth, optionally
    /// filtered to one relationship type.
    pub fn traverse(
        &self,
        root_id: Uuid,
        depth: usize,
        type_filter: Option<&str>,
    ) -> Result<GraphView> {
        self.ensure_available()?;

        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut seen_nodes = HashSet::new();
        let mut seen_edges = HashSet::new();
        let mut frontier = VecDeque::new();

        if let Some(root) = self.nodes.get(&root_id) {
            nodes.push(node_to_ci(&root));
            seen_nodes.insert(root_id);
            frontier.push_back((root_id, 0usize));
        }

        while let Some((current, level)) = frontier.pop_front() {
            if level >= depth {
                continue;
            }
            let Some(incident) = self.adjacency.get(&current) else {
                continue;
            };
            let incident: Vec<Uuid> = incident.iter().copied().collect();
            for edge_id in incident {
                let Some(edge) = self.edges.get(&edge_id).map(|e| e.value().clone()) else {
                    continue;
                };
                if let Some(filter) = type_filter {
                    if edge.rel_type != filter {
                        continue;
                    }
                }
                if seen_edges.insert(edge_id) {
                    edges.push(edge_to_relationship(&edge));
                }
                let neighbor = if edge.source_id == current {
                    edge.target_id
                } else {
                    edge.source_id
                };
                if seen_nodes.insert(neighbor) {
                    if let Some(node) = self.nodes.get(&neighbor) {
                        nodes.push(node_to_ci(&node));
                        frontier.push_back((neighbor, level + 1));
                    }
                }
            }
        }

        Ok(GraphView { nodes, edges })
    }

    /// Ids of every projected node, for the periodic conflict sweep.
    pub fn node_ids(&self) -> Vec<Uuid> {
        self.nodes.iter().map(|n| *n.key()).collect()
    }

    pub fn edge_ids(&self) -> Vec<Uuid> {
        self.edges.iter().map(|e| *e.key()).collect()
    }
}

/// Project a node back into the entity shape for traversal responses and
/// graph-wins resolution. Creator/updater identity is not projected.
fn node_to_ci(node: &GraphNode) -> ConfigurationItem {
    ConfigurationItem {
        id: node.id,
        name: node.name.clone(),
        ci_type: node.ci_type.clone(),
        attributes: node.attributes.clone(),
        tags: node.tags.clone(),
        created_at: node.synced_at,
        updated_at: node.updated_at,
        created_by: Uuid::nil(),
        updated_by: Uuid::nil(),
    }
}

fn edge_to_relationship(edge: &GraphEdge) -> Relationship {
    Relationship {
        id: edge.id,
        rel_type: edge.rel_type.clone(),
        source_id: edge.source_id,
        target_id: edge.target_id,
        attributes: edge.attributes.clone(),
        created_at: edge.synced_at,
        updated_at: edge.updated_at,
        created_by: Uuid::nil(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: Uuid, name: &str) -> GraphNode {
        GraphNode {
            id,
            name: name.to_string(),
            ci_type: "server".to_string(),
            attributes: Map::new(),
            tags: vec![],
            updated_at: 1,
            synced_at: 1,
        }
    }

    fn edge(id: Uuid, source: Uuid, target: Uuid) -> GraphEdge {
        GraphEdge {
            id,
            rel_type: "DEPENDS_ON".to_string(),
            source_id: source,
            target_id: target,
            attributes: Map::new(),
            updated_at: 1,
            synced_at: 1,
        }
    }

    #[test]
    fn test_merge_node_is_idempotent() {
        let store = GraphStore::new();
        let id = Uuid::new_v4();
        store.merge_node(node(id, "web-01")).unwrap();
        store.merge_node(node(id, "web-01")).unwrap();
        assert_eq!(store.node_count(), 1);
    }

    #[test]
    fn test_merge_edge_requires_endpoints() {
        let store = GraphStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.merge_node(node(a, "a")).unwrap();

        let result = store.merge_edge(edge(Uuid::new_v4(), a, b));
        assert!(matches!(result, Err(SyncError::Dependency { .. })));

        store.merge_node(node(b, "b")).unwrap();
        store.merge_edge(edge(Uuid::new_v4(), a, b)).unwrap();
        assert_eq!(store.edge_count(), 1);
    }

    #[test]
    fn test_detach_delete_removes_incident_edges() {
        let store = GraphStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.merge_node(node(a, "a")).unwrap();
        store.merge_node(node(b, "b")).unwrap();
        store.merge_edge(edge(Uuid::new_v4(), a, b)).unwrap();

        store.delete_node(a).unwrap();
        assert_eq!(store.node_count(), 1);
        assert_eq!(store.edge_count(), 0);
        assert!(store.edges_of(b).unwrap().is_empty());
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let store = GraphStore::new();
        store.delete_node(Uuid::new_v4()).unwrap();
        store.delete_edge(Uuid::new_v4()).unwrap();
    }

    #[test]
    fn test_unavailable_store_errors() {
        let store = GraphStore::new();
        store.set_available(false);
        let result = store.merge_node(node(Uuid::new_v4(), "x"));
        assert!(matches!(result, Err(SyncError::TransientIo(_))));
        assert!(store.ping().is_err());

        store.set_available(true);
        assert!(store.ping().is_ok());
    }

    #[test]
    fn test_traverse_depth_and_filter() {
        let store = GraphStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        store.merge_node(node(a, "a")).unwrap();
        store.merge_node(node(b, "b")).unwrap();
        store.merge_node(node(c, "c")).unwrap();
        store.merge_edge(edge(Uuid::new_v4(), a, b)).unwrap();
        let mut hosted = edge(Uuid::new_v4(), b, c);
        hosted.rel_type = "HOSTS".to_string();
        store.merge_edge(hosted).unwrap();

        let view = store.traverse(a, 1, None).unwrap();
        assert_eq!(view.nodes.len(), 2);
        assert_eq!(view.edges.len(), 1);

        let view = store.traverse(a, 2, None).unwrap();
        assert_eq!(view.nodes.len(), 3);
        assert_eq!(view.edges.len(), 2);

        let view = store.traverse(a, 2, Some("DEPENDS_ON")).unwrap();
        assert_eq!(view.nodes.len(), 2);
        assert_eq!(view.edges.len(), 1);
    }

    #[test]
    fn test_edge_remerge_moves_endpoints() {
        let store = GraphStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        for (id, name) in [(a, "a"), (b, "b"), (c, "c")] {
            store.merge_node(node(id, name)).unwrap();
        }
        let edge_id = Uuid::new_v4();
        store.merge_edge(edge(edge_id, a, b)).unwrap();
        store.merge_edge(edge(edge_id, a, c)).unwrap();

        assert_eq!(store.edge_count(), 1);
        assert!(store.edges_of(b).unwrap().is_empty());
        assert_eq!(store.edges_of(c).unwrap().len(), 1);
    }
}
