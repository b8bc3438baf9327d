//! Immutable point-in-time view of a tree.

use crate::command::SignalCommand;
use crate::id::Id;
use crate::node::{Data, Node};
use std::collections::{HashMap, HashSet};

/// A fully resolved tree state at one point in logical time.
///
/// A revision exposed as a snapshot is never mutated in place; all edits go
/// through [`crate::mutable_revision::MutableTreeRevision`], which copies the
/// node map and produces a fresh revision.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeRevision {
    owner_id: Id,
    nodes: HashMap<Id, Node>,
    original_inserts: HashMap<Id, SignalCommand>,
}

impl TreeRevision {
    /// A new revision holding only the empty value root.
    pub fn root_revision(owner_id: Id) -> TreeRevision {
        let mut nodes = HashMap::new();
        nodes.insert(Id::ZERO, Node::empty(Id::ZERO));
        TreeRevision {
            owner_id,
            nodes,
            original_inserts: HashMap::new(),
        }
    }

    pub fn new(
        owner_id: Id,
        nodes: HashMap<Id, Node>,
        original_inserts: HashMap<Id, SignalCommand>,
    ) -> TreeRevision {
        TreeRevision {
            owner_id,
            nodes,
            original_inserts,
        }
    }

    /// Id of the tree this revision belongs to.
    pub fn owner_id(&self) -> Id {
        self.owner_id
    }

    pub fn nodes(&self) -> &HashMap<Id, Node> {
        &self.nodes
    }

    pub fn original_inserts(&self) -> &HashMap<Id, SignalCommand> {
        &self.original_inserts
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut HashMap<Id, Node> {
        &mut self.nodes
    }

    pub(crate) fn original_inserts_mut(&mut self) -> &mut HashMap<Id, SignalCommand> {
        &mut self.original_inserts
    }

    /// Resolves an alias one hop. Returns the id itself for data nodes and
    /// for ids not present at all.
    pub fn resolve_alias(&self, node_id: Id) -> Id {
        match self.nodes.get(&node_id) {
            Some(Node::Alias(alias)) => alias.target,
            _ => node_id,
        }
    }

    /// The data node for the given id, resolving through aliases.
    pub fn data(&self, node_id: Id) -> Option<&Data> {
        match self.nodes.get(&node_id)? {
            Node::Data(data) => Some(data),
            Node::Alias(alias) => match self.nodes.get(&alias.target)? {
                Node::Data(data) => Some(data),
                // Alias chains are rejected at creation.
                Node::Alias(_) => None,
            },
        }
    }

    /// Checks the structural invariants of the node map. Used through
    /// `debug_assert!` after every mutation; a failure is an engine defect,
    /// not a recoverable condition.
    pub fn assert_valid_tree(&self) -> bool {
        let root = self.nodes.get(&Id::ZERO);
        assert!(
            matches!(root, Some(Node::Data(data)) if data.parent.is_none()),
            "root node must exist and be parentless"
        );
        if let Some(meta) = self.nodes.get(&Id::MAX) {
            assert!(
                matches!(meta, Node::Data(data) if data.parent.is_none()),
                "metadata root must be a parentless data node"
            );
        }

        // Walk down from the roots: every reachable child must point back at
        // its parent and be reached exactly once.
        let mut reached: HashSet<Id> = HashSet::new();
        let mut queue: Vec<Id> = Vec::new();
        for root_id in [Id::ZERO, Id::MAX] {
            if self.nodes.contains_key(&root_id) {
                assert!(reached.insert(root_id));
                queue.push(root_id);
            }
        }
        while let Some(parent_id) = queue.pop() {
            let Some(Node::Data(parent)) = self.nodes.get(&parent_id) else {
                panic!("reachable node {parent_id} must be a data node");
            };
            let children = parent
                .list_children
                .iter()
                .chain(parent.map_children.values());
            for &child_id in children {
                assert!(
                    reached.insert(child_id),
                    "node {child_id} attached more than once"
                );
                let child = self.nodes.get(&child_id);
                let Some(Node::Data(child)) = child else {
                    panic!("child {child_id} must exist as a data node");
                };
                assert_eq!(
                    child.parent,
                    Some(parent_id),
                    "child {child_id} must point back at its parent"
                );
                queue.push(child_id);
            }
        }

        for (id, node) in &self.nodes {
            match node {
                Node::Data(_) => {
                    assert!(reached.contains(id), "node {id} is orphaned");
                }
                Node::Alias(alias) => {
                    assert!(
                        matches!(self.nodes.get(&alias.target), Some(Node::Data(_))),
                        "alias {id} must target an existing data node"
                    );
                }
            }
        }

        // Owned nodes and original-insert records form a bijection.
        for (id, insert) in &self.original_inserts {
            let data = self.data(*id);
            assert!(
                data.is_some_and(|data| data.scope_owner == Some(self.owner_id)),
                "original insert recorded for non-owned node {id}"
            );
            assert_eq!(insert.command_id(), *id);
        }
        for (id, node) in &self.nodes {
            if let Node::Data(data) = node {
                if data.scope_owner == Some(self.owner_id) {
                    assert!(
                        self.original_inserts.contains_key(id),
                        "owned node {id} has no original insert record"
                    );
                }
            }
        }

        true
    }
}
