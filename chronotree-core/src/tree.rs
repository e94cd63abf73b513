//! The tree repository: owns the root node and a node-id index over
//! the whole subtree, and persists/reconstructs it against storage.

use crate::address::Address;
use crate::allocator::AddressAllocator;
use crate::dimension::DimensionRegistry;
use crate::node::Node;
use chrono::{DateTime, Utc};
use chronotree_error::{EngineError, Result};
use chronotree_storage::{NodeRecord, StorageAdapter, TreeRecord};
use std::collections::HashMap;
use std::sync::Arc;

/// Pre-order or post-order traversal, deterministic by child
/// insertion order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraversalOrder {
    Pre,
    Post,
}

/// Criteria for `TreeRepository::find`; every set field must match.
#[derive(Clone, Debug, Default)]
pub struct NodeQuery {
    pub name: Option<String>,
    pub depth: Option<usize>,
    pub tags: Vec<String>,
}

/// Owns exactly one root node and a `node_id -> Node` index covering
/// the whole subtree, plus the allocator and dimension registry shared
/// across the tree.
pub struct TreeRepository {
    pub tree_id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    root_id: String,
    nodes: HashMap<String, Node>,
    allocator: AddressAllocator,
    registry: Arc<DimensionRegistry>,
    store: Option<Arc<dyn StorageAdapter>>,
}

impl TreeRepository {
    /// Build a repository around a freshly-allocated root node.
    pub fn new(tree_id: impl Into<String>, name: impl Into<String>, registry: Arc<DimensionRegistry>) -> Self {
        let allocator = AddressAllocator::with_defaults();
        let root_address = allocator.allocate_root();
        let root_id = format!("node-{root_address}");
        let root = Node::new(root_id.clone(), "root", root_address, registry.clone());

        let mut nodes = HashMap::new();
        nodes.insert(root_id.clone(), root);

        Self {
            tree_id: tree_id.into(),
            name: name.into(),
            description: None,
            created_at: Utc::now(),
            root_id,
            nodes,
            allocator,
            registry,
            store: None,
        }
    }

    /// Attach a storage adapter; every held and future node's
    /// timelines write through to it under this tree's id.
    pub fn attach_store(&mut self, store: Arc<dyn StorageAdapter>) {
        for node in self.nodes.values_mut() {
            node.attach_store(store.clone(), self.tree_id.clone());
        }
        self.store = Some(store);
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn get_node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn get_node_mut(&mut self, node_id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(node_id)
    }

    pub fn get_node_by_address(&self, address: &Address) -> Option<&Node> {
        self.nodes.values().find(|n| &n.address == address)
    }

    /// Nodes matching every set criterion in `query`.
    pub fn find(&self, query: &NodeQuery) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| {
                query.name.as_deref().map(|n| n == node.name).unwrap_or(true)
                    && query.depth.map(|d| d == node.depth()).unwrap_or(true)
                    && query.tags.iter().all(|tag| node.tags.contains(tag))
            })
            .collect()
    }

    /// Allocate a child address under `parent_id`, create the node,
    /// and attach it to the tree's parent/child index.
    pub fn add_node(&mut self, parent_id: &str, name: impl Into<String>, tags: Vec<String>) -> Result<String> {
        let parent_address = self
            .nodes
            .get(parent_id)
            .ok_or_else(|| EngineError::NodeNotFound {
                node_id: parent_id.to_string(),
            })?
            .address
            .clone();

        let child_address = self.allocator.allocate_child(&parent_address)?;
        let node_id = format!("node-{child_address}");

        let mut node = Node::new(node_id.clone(), name, child_address, self.registry.clone());
        node.parent_id = Some(parent_id.to_string());
        node.tags = tags.into_iter().collect();
        if let Some(store) = &self.store {
            node.attach_store(store.clone(), self.tree_id.clone());
        }

        self.nodes.insert(node_id.clone(), node);
        self.nodes.get_mut(parent_id).unwrap().add_child(node_id.clone());

        Ok(node_id)
    }

    /// Detach `node_id` from its parent and drop its whole subtree
    /// from the in-memory index. History in the store is untouched
    /// unless the caller separately deletes it there.
    pub fn remove_node(&mut self, node_id: &str) -> Result<()> {
        if node_id == self.root_id {
            return Err(EngineError::Validation {
                message: "cannot remove the root node".into(),
            });
        }

        let parent_id = self
            .nodes
            .get(node_id)
            .ok_or_else(|| EngineError::NodeNotFound {
                node_id: node_id.to_string(),
            })?
            .parent_id
            .clone();

        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.nodes.get_mut(&parent_id) {
                parent.remove_child(node_id);
            }
        }

        let mut to_drop = vec![node_id.to_string()];
        let mut i = 0;
        while i < to_drop.len() {
            if let Some(node) = self.nodes.get(&to_drop[i]) {
                to_drop.extend(node.children.clone());
            }
            i += 1;
        }
        for id in &to_drop {
            self.nodes.remove(id);
        }

        Ok(())
    }

    /// Every ancestor of `node_id`, nearest first, up to and including
    /// the root.
    pub fn get_ancestors(&self, node_id: &str) -> Vec<&Node> {
        let mut ancestors = Vec::new();
        let mut current = self.nodes.get(node_id).and_then(|n| n.parent_id.as_deref());
        while let Some(id) = current {
            let Some(node) = self.nodes.get(id) else { break };
            ancestors.push(node);
            current = node.parent_id.as_deref();
        }
        ancestors
    }

    /// Every descendant of `node_id`, in pre-order.
    pub fn get_descendants(&self, node_id: &str) -> Vec<&Node> {
        let mut out = Vec::new();
        let mut stack: Vec<&str> = self
            .nodes
            .get(node_id)
            .map(|n| n.children.iter().map(String::as_str).collect())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(id) {
                out.push(node);
                for child in node.children.iter().rev() {
                    stack.push(child);
                }
            }
        }
        out
    }

    pub fn get_root(&self) -> &Node {
        self.nodes.get(&self.root_id).expect("root always present")
    }

    /// Nodes from the root down to (and including) `node_id`.
    pub fn get_path(&self, node_id: &str) -> Vec<&Node> {
        let mut path = self.get_ancestors(node_id);
        path.reverse();
        if let Some(node) = self.nodes.get(node_id) {
            path.push(node);
        }
        path
    }

    /// Deterministic traversal of the whole tree by child insertion order.
    pub fn traverse(&self, order: TraversalOrder) -> Vec<&Node> {
        let mut out = Vec::new();
        self.traverse_from(&self.root_id, order, &mut out);
        out
    }

    fn traverse_from<'a>(&'a self, node_id: &str, order: TraversalOrder, out: &mut Vec<&'a Node>) {
        let Some(node) = self.nodes.get(node_id) else { return };
        if order == TraversalOrder::Pre {
            out.push(node);
        }
        for child in &node.children {
            self.traverse_from(child, order, out);
        }
        if order == TraversalOrder::Post {
            out.push(node);
        }
    }

    /// Longest path from the root to any node, in edges.
    pub fn depth(&self) -> usize {
        self.traverse(TraversalOrder::Pre)
            .into_iter()
            .map(|n| n.depth() - self.get_root().depth())
            .max()
            .unwrap_or(0)
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// A structural dump of the tree; `include_data` also serializes
    /// each node's cached timelines.
    pub fn to_blob(&self, include_data: bool) -> TreeRecord {
        let mut nodes = std::collections::BTreeMap::new();
        for (id, node) in &self.nodes {
            nodes.insert(id.clone(), node_to_record(node, include_data));
        }
        TreeRecord {
            tree_id: self.tree_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            root_node_id: self.root_id.clone(),
            nodes,
            metadata: None,
        }
    }

    /// Write the tree record, then every node record, then the time
    /// points of every cached timeline. No transaction boundary is
    /// promised across these writes.
    #[tracing::instrument(skip(self, store), fields(node_count = self.nodes.len()))]
    pub async fn save_to_storage(&self, store: &dyn StorageAdapter, tree_id: &str) -> Result<()> {
        let blob = self.to_blob(true);
        store.save_tree(tree_id, &blob).await?;

        for (node_id, node) in &self.nodes {
            let record = node_to_record(node, true);
            store.save_node(tree_id, node_id, &record).await?;

            for dim in node.dimensions_with_data() {
                let Some(timeline) = node.timeline(&dim) else { continue };
                for point in timeline.export() {
                    store
                        .save_time_point(tree_id, node_id, &dim, point.timestamp, point.value, point.metadata.quality, point.metadata.unit)
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Reconstruct a repository from storage: read the tree record,
    /// build all nodes, then wire parent/child links by `parent_id`.
    /// Fails `NO_ROOT` if no node record has a null parent.
    #[tracing::instrument(skip(store, registry))]
    pub async fn load_from_storage(
        store: Arc<dyn StorageAdapter>,
        tree_id: &str,
        registry: Arc<DimensionRegistry>,
    ) -> Result<Self> {
        let record = store
            .load_tree(tree_id)
            .await?
            .ok_or_else(|| EngineError::TreeNotFound {
                tree_id: tree_id.to_string(),
            })?;

        let mut nodes = HashMap::new();
        for (node_id, node_record) in &record.nodes {
            let address = Address::parse(&node_record.address, crate::address::DEFAULT_SEG_MAX)?;
            let mut node = Node::new(node_id.clone(), node_record.name.clone(), address, registry.clone());
            node.parent_id = node_record.parent_id.clone();
            node.tags = node_record.tags.iter().cloned().collect();
            node.created_at = node_record.created_at;
            node.deleted_at = node_record.deleted_at;
            node.is_active = node_record.is_active;
            node.attach_store(store.clone(), tree_id.to_string());

            for (dim, points) in &node_record.timelines {
                let timeline = node.timeline_for_hydration(dim);
                timeline.hydrate(points.clone());
            }

            nodes.insert(node_id.clone(), node);
        }

        let root_id = nodes
            .values()
            .find(|n| n.parent_id.is_none())
            .map(|n| n.node_id.clone())
            .ok_or_else(|| EngineError::NoRoot {
                tree_id: tree_id.to_string(),
            })?;

        for (id, node_record) in &record.nodes {
            if let Some(parent_id) = &node_record.parent_id {
                if let Some(parent) = nodes.get_mut(parent_id) {
                    parent.add_child(id.clone());
                }
            }
        }

        // Replay every loaded address into a fresh allocator's ledger, so
        // `add_node` on a reloaded tree neither rejects an existing
        // non-root parent as unknown nor re-hands-out a child index
        // already taken by a loaded child.
        let mut allocator = AddressAllocator::with_defaults();
        for node in nodes.values() {
            allocator.register(node.address.clone(), 0);
        }
        for node in nodes.values() {
            if let Some(parent_address) = node.address.parent() {
                let next_index = node.address.segments().last().copied().unwrap_or(0) + 1;
                allocator.register(parent_address, next_index);
            }
        }

        tracing::info!(tree_id, node_count = nodes.len(), "tree reconstructed from storage");

        Ok(Self {
            tree_id: tree_id.to_string(),
            name: record.name,
            description: record.description,
            created_at: record.created_at,
            root_id,
            nodes,
            allocator,
            registry,
            store: Some(store),
        })
    }
}

fn node_to_record(node: &Node, include_data: bool) -> NodeRecord {
    let timelines = if include_data {
        node.dimensions_with_data()
            .into_iter()
            .filter_map(|dim| node.timeline(&dim).map(|t| (dim, t.export())))
            .collect()
    } else {
        std::collections::BTreeMap::new()
    };

    NodeRecord {
        node_id: node.node_id.clone(),
        parent_id: node.parent_id.clone(),
        address: node.address.to_string(),
        name: node.name.clone(),
        tags: node.tags.iter().cloned().collect(),
        created_at: node.created_at,
        deleted_at: node.deleted_at,
        is_active: node.is_active,
        timelines,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronotree_storage::MemoryStore;

    fn registry() -> Arc<DimensionRegistry> {
        Arc::new(DimensionRegistry::with_builtins())
    }

    #[test]
    fn add_node_allocates_addresses_in_order() {
        let mut tree = TreeRepository::new("t1", "demo", registry());
        let root_id = tree.root_id().to_string();

        let beijing = tree.add_node(&root_id, "beijing", vec![]).unwrap();
        let shanghai = tree.add_node(&root_id, "shanghai", vec![]).unwrap();

        assert_eq!(tree.get_node(&beijing).unwrap().address.to_string(), "10.0.0.0.0");
        assert_eq!(tree.get_node(&shanghai).unwrap().address.to_string(), "10.0.0.0.1");
        assert_eq!(tree.size(), 3);
    }

    #[tokio::test]
    async fn save_and_load_round_trips_structure_and_data() {
        let store: Arc<dyn StorageAdapter> = Arc::new(MemoryStore::new());
        let mut tree = TreeRepository::new("t1", "demo", registry());
        tree.attach_store(store.clone());
        let root_id = tree.root_id().to_string();
        let beijing = tree.add_node(&root_id, "beijing", vec!["city".to_string()]).unwrap();

        tree.get_node_mut(&beijing)
            .unwrap()
            .set_data("metered", chronotree_storage::DimensionValue::Number(1500.0), Some(1), None, None)
            .await
            .unwrap();

        tree.save_to_storage(store.as_ref(), "t1").await.unwrap();

        let loaded = TreeRepository::load_from_storage(store.clone(), "t1", registry()).await.unwrap();
        assert_eq!(loaded.size(), tree.size());
        let loaded_beijing = loaded
            .find(&NodeQuery {
                name: Some("beijing".to_string()),
                ..Default::default()
            })
            .remove(0);
        assert_eq!(loaded_beijing.tags.len(), 1);
    }

    #[tokio::test]
    async fn reloaded_tree_allocates_children_without_collision() {
        let store: Arc<dyn StorageAdapter> = Arc::new(MemoryStore::new());
        let mut tree = TreeRepository::new("t1", "demo", registry());
        tree.attach_store(store.clone());
        let root_id = tree.root_id().to_string();
        let beijing = tree.add_node(&root_id, "beijing", vec![]).unwrap();
        tree.add_node(&beijing, "haidian", vec![]).unwrap();
        tree.save_to_storage(store.as_ref(), "t1").await.unwrap();

        let mut loaded = TreeRepository::load_from_storage(store.clone(), "t1", registry()).await.unwrap();

        // A non-root parent must still be known to the reloaded allocator.
        let chaoyang = loaded.add_node(&beijing, "chaoyang", vec![]).unwrap();
        assert_eq!(loaded.get_node(&chaoyang).unwrap().address.to_string(), "10.0.0.0.0.1");

        // The root's next child index must continue from the loaded
        // child, not restart at 0 and collide with it.
        let shanghai = loaded.add_node(&root_id, "shanghai", vec![]).unwrap();
        assert_eq!(loaded.get_node(&shanghai).unwrap().address.to_string(), "10.0.0.0.1");
    }
}
