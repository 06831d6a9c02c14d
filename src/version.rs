//! Per-dataset version DAG
//!
//! Nodes are `open` (writable) or `locked` (read-only). Locking is the only
//! open-node transition; branching is allowed only from a locked node and
//! yields a new open child. Externally versions are addressed by UUID
//! prefix; internally each node carries a compact local id used in block
//! keys.

use crate::error::{Result, VaultError};
use crate::types::VersionLocalId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One version node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionNode {
    pub uuid: Uuid,
    pub id: VersionLocalId,
    pub parents: Vec<VersionLocalId>,
    pub children: Vec<VersionLocalId>,
    pub locked: bool,
}

impl VersionNode {
    /// Hyphen-less lowercase hex form used for prefix matching
    pub fn hex(&self) -> String {
        self.uuid.simple().to_string()
    }
}

/// Directed acyclic graph of version nodes for one dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionDag {
    nodes: BTreeMap<VersionLocalId, VersionNode>,
    root: VersionLocalId,
    next_id: VersionLocalId,
}

impl VersionDag {
    /// A new DAG holding a single open root node.
    ///
    /// Local ids are allocated starting at 1; id 0 is reserved for metadata
    /// keys.
    pub fn new() -> Self {
        let root = VersionNode {
            uuid: Uuid::new_v4(),
            id: 1,
            parents: Vec::new(),
            children: Vec::new(),
            locked: false,
        };
        let mut nodes = BTreeMap::new();
        nodes.insert(1, root);
        Self {
            nodes,
            root: 1,
            next_id: 2,
        }
    }

    pub fn root_id(&self) -> VersionLocalId {
        self.root
    }

    pub fn root_uuid(&self) -> Uuid {
        self.nodes[&self.root].uuid
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: VersionLocalId) -> Option<&VersionNode> {
        self.nodes.get(&id)
    }

    /// Nodes in local-id order
    pub fn nodes(&self) -> impl Iterator<Item = &VersionNode> {
        self.nodes.values()
    }

    fn resolve_id(&self, prefix: &str) -> Result<VersionLocalId> {
        let wanted = prefix.to_lowercase().replace('-', "");
        if wanted.is_empty() {
            return Err(VaultError::UnknownUuid(prefix.to_string()));
        }
        let mut matched = None;
        for node in self.nodes.values() {
            if node.hex().starts_with(&wanted) {
                if matched.is_some() {
                    return Err(VaultError::AmbiguousUuid(prefix.to_string()));
                }
                matched = Some(node.id);
            }
        }
        matched.ok_or_else(|| VaultError::UnknownUuid(prefix.to_string()))
    }

    /// Resolve a UUID prefix to its node.
    ///
    /// Fails with `UnknownUuid` when nothing matches and `AmbiguousUuid`
    /// when the prefix does not pin down a single node.
    pub fn resolve(&self, prefix: &str) -> Result<&VersionNode> {
        let id = self.resolve_id(prefix)?;
        Ok(&self.nodes[&id])
    }

    /// Lock the node matching the prefix against further writes.
    ///
    /// Locking an already-locked node succeeds silently.
    pub fn lock(&mut self, prefix: &str) -> Result<Uuid> {
        let id = self.resolve_id(prefix)?;
        let node = self.nodes.get_mut(&id).unwrap();
        node.locked = true;
        Ok(node.uuid)
    }

    /// Branch a new open child off a locked node, returning the child UUID.
    ///
    /// Fails with `VersionLocked` when the parent is still open, since only
    /// a hash-stable node may be branched.
    pub fn branch(&mut self, prefix: &str) -> Result<Uuid> {
        let parent_id = self.resolve_id(prefix)?;
        let parent = &self.nodes[&parent_id];
        if !parent.locked {
            return Err(VaultError::VersionLocked(format!(
                "{} must be locked before branching",
                parent.hex()
            )));
        }
        if self.next_id == VersionLocalId::MAX {
            return Err(VaultError::Configuration(
                "version local id space exhausted".to_string(),
            ));
        }
        let child = VersionNode {
            uuid: Uuid::new_v4(),
            id: self.next_id,
            parents: vec![parent_id],
            children: Vec::new(),
            locked: false,
        };
        let child_uuid = child.uuid;
        self.next_id += 1;
        self.nodes.get_mut(&parent_id).unwrap().children.push(child.id);
        self.nodes.insert(child.id, child);
        Ok(child_uuid)
    }
}

impl Default for VersionDag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_by_prefix() {
        let dag = VersionDag::new();
        let hex = dag.root_uuid().simple().to_string();
        assert_eq!(dag.resolve(&hex[..6]).unwrap().id, dag.root_id());
        assert_eq!(dag.resolve(&hex).unwrap().id, dag.root_id());
        assert!(matches!(
            dag.resolve("zzzz"),
            Err(VaultError::UnknownUuid(_))
        ));
        assert!(matches!(dag.resolve(""), Err(VaultError::UnknownUuid(_))));
    }

    #[test]
    fn test_branch_requires_lock() {
        let mut dag = VersionDag::new();
        let root_hex = dag.root_uuid().simple().to_string();
        assert!(matches!(
            dag.branch(&root_hex),
            Err(VaultError::VersionLocked(_))
        ));
        dag.lock(&root_hex).unwrap();
        let child = dag.branch(&root_hex).unwrap();
        assert_eq!(dag.len(), 2);
        let child_node = dag.resolve(&child.simple().to_string()).unwrap();
        assert!(!child_node.locked);
        assert_eq!(child_node.parents, vec![dag.root_id()]);
        assert_eq!(dag.node(dag.root_id()).unwrap().children, vec![child_node.id]);
    }

    #[test]
    fn test_lock_is_idempotent() {
        let mut dag = VersionDag::new();
        let hex = dag.root_uuid().simple().to_string();
        dag.lock(&hex).unwrap();
        dag.lock(&hex).unwrap();
        assert!(dag.resolve(&hex).unwrap().locked);
    }

    #[test]
    fn test_ambiguous_prefix() {
        let mut dag = VersionDag::new();
        let root_hex = dag.root_uuid().simple().to_string();
        dag.lock(&root_hex).unwrap();
        // Branch until two UUIDs share a first hex digit, then probe with it.
        for _ in 0..40 {
            dag.branch(&root_hex).unwrap();
        }
        let mut seen: std::collections::HashMap<char, u32> = std::collections::HashMap::new();
        for node in dag.nodes() {
            *seen.entry(node.hex().chars().next().unwrap()).or_insert(0) += 1;
        }
        let digit = seen
            .iter()
            .find(|&(_, &n)| n > 1)
            .map(|(&digit, _)| digit)
            .expect("41 nodes must share a leading hex digit");
        assert!(matches!(
            dag.resolve(&digit.to_string()),
            Err(VaultError::AmbiguousUuid(_))
        ));
    }

    #[test]
    fn test_local_ids_start_at_one() {
        let mut dag = VersionDag::new();
        assert_eq!(dag.root_id(), 1);
        let hex = dag.root_uuid().simple().to_string();
        dag.lock(&hex).unwrap();
        let child = dag.branch(&hex).unwrap();
        assert_eq!(dag.resolve(&child.simple().to_string()).unwrap().id, 2);
    }

    #[test]
    fn test_serde_round_trip() {
        let mut dag = VersionDag::new();
        let hex = dag.root_uuid().simple().to_string();
        dag.lock(&hex).unwrap();
        dag.branch(&hex).unwrap();
        let json = serde_json::to_string(&dag).unwrap();
        let restored: VersionDag = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.root_uuid(), dag.root_uuid());
        assert!(restored.resolve(&hex).unwrap().locked);
    }
}
