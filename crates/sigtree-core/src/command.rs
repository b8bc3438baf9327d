//! The closed command catalogue.
//!
//! Every mutation of a tree is described by one of these commands. Commands
//! are plain serializable values; the engine assigns no wire format beyond
//! their serde representation. Each command carries its own unique id, which
//! doubles as the id of any node the command creates.

use crate::id::Id;
use crate::node::Node;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Position of a node within a parent's ordered list children.
///
/// Both `after` and `before` name required neighbors, with [`Id::EDGE`] as
/// the sentinel for the ends of the list: after EDGE means first, before EDGE
/// means last. When both are given they must be adjacent at evaluation time;
/// a stale neighbor rejects the command rather than inserting elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPosition {
    pub after: Option<Id>,
    pub before: Option<Id>,
}

impl ListPosition {
    pub fn first() -> ListPosition {
        ListPosition {
            after: Some(Id::EDGE),
            before: None,
        }
    }

    pub fn last() -> ListPosition {
        ListPosition {
            after: None,
            before: Some(Id::EDGE),
        }
    }

    pub fn after(id: Id) -> ListPosition {
        ListPosition {
            after: Some(id),
            before: None,
        }
    }

    pub fn between(after: Id, before: Id) -> ListPosition {
        ListPosition {
            after: Some(after),
            before: Some(before),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalCommand {
    /// Replaces a node's value unconditionally.
    Set {
        command_id: Id,
        target: Id,
        value: Option<Value>,
    },
    /// Adds a delta to a numeric (or absent, treated as 0) value.
    Increment {
        command_id: Id,
        target: Id,
        delta: f64,
    },
    /// Inserts or updates a map child by key.
    Put {
        command_id: Id,
        target: Id,
        key: String,
        value: Option<Value>,
    },
    /// Inserts a map child by key, or aliases the command id to the existing
    /// child when the key is already occupied.
    PutIfAbsent {
        command_id: Id,
        target: Id,
        key: String,
        value: Option<Value>,
        scope_owner: Option<Id>,
    },
    /// Detaches and cascade-deletes the map child under the given key.
    RemoveByKey {
        command_id: Id,
        target: Id,
        key: String,
    },
    /// Creates a new node (with the command's id) at a list position.
    Insert {
        command_id: Id,
        target: Id,
        value: Option<Value>,
        position: ListPosition,
        scope_owner: Option<Id>,
    },
    /// Detaches and cascade-deletes a node. The optional expected parent
    /// turns the removal into a compare-and-swap.
    Remove {
        command_id: Id,
        target: Id,
        expected_parent: Option<Id>,
    },
    /// Detaches all children of a node, keeping the node itself.
    Clear { command_id: Id, target: Id },
    /// Detaches every node whose scope owner is the given tree id.
    ClearOwner { command_id: Id, owner: Id },
    /// Moves an existing node to be a map child of the target parent.
    AdoptAs {
        command_id: Id,
        target: Id,
        key: String,
        child: Id,
    },
    /// Moves an existing node to a list position under the target parent.
    AdoptAt {
        command_id: Id,
        target: Id,
        position: ListPosition,
        child: Id,
    },
    /// Accepts iff the node's value equals the expected value.
    ValueCondition {
        command_id: Id,
        target: Id,
        expected: Option<Value>,
    },
    /// Accepts iff the child is at the given position in the target's list.
    PositionCondition {
        command_id: Id,
        target: Id,
        child: Id,
        position: ListPosition,
    },
    /// Accepts based on presence or identity of a map child. With no
    /// expected child: key must be present. With `Id::ZERO`: key must be
    /// absent. Otherwise the child under the key must be the expected node.
    KeyCondition {
        command_id: Id,
        target: Id,
        key: String,
        expected_child: Option<Id>,
    },
    /// Accepts iff the node's last-update stamp matches.
    LastUpdateCondition {
        command_id: Id,
        target: Id,
        expected: Option<Id>,
    },
    /// An ordered batch of sub-commands, atomic as a unit.
    Transaction {
        command_id: Id,
        commands: Vec<SignalCommand>,
    },
    /// Wholesale node-set replacement, used to bootstrap a tree from
    /// external confirmed state.
    Snapshot {
        command_id: Id,
        nodes: HashMap<Id, Node>,
    },
}

impl SignalCommand {
    pub fn command_id(&self) -> Id {
        match self {
            SignalCommand::Set { command_id, .. }
            | SignalCommand::Increment { command_id, .. }
            | SignalCommand::Put { command_id, .. }
            | SignalCommand::PutIfAbsent { command_id, .. }
            | SignalCommand::RemoveByKey { command_id, .. }
            | SignalCommand::Insert { command_id, .. }
            | SignalCommand::Remove { command_id, .. }
            | SignalCommand::Clear { command_id, .. }
            | SignalCommand::ClearOwner { command_id, .. }
            | SignalCommand::AdoptAs { command_id, .. }
            | SignalCommand::AdoptAt { command_id, .. }
            | SignalCommand::ValueCondition { command_id, .. }
            | SignalCommand::PositionCondition { command_id, .. }
            | SignalCommand::KeyCondition { command_id, .. }
            | SignalCommand::LastUpdateCondition { command_id, .. }
            | SignalCommand::Transaction { command_id, .. }
            | SignalCommand::Snapshot { command_id, .. } => *command_id,
        }
    }

    /// The node this command operates on. Commands without a natural target
    /// (owner eviction, transactions, snapshots) target the root, which
    /// always exists.
    pub fn target_node_id(&self) -> Id {
        match self {
            SignalCommand::Set { target, .. }
            | SignalCommand::Increment { target, .. }
            | SignalCommand::Put { target, .. }
            | SignalCommand::PutIfAbsent { target, .. }
            | SignalCommand::RemoveByKey { target, .. }
            | SignalCommand::Insert { target, .. }
            | SignalCommand::Remove { target, .. }
            | SignalCommand::Clear { target, .. }
            | SignalCommand::AdoptAs { target, .. }
            | SignalCommand::AdoptAt { target, .. }
            | SignalCommand::ValueCondition { target, .. }
            | SignalCommand::PositionCondition { target, .. }
            | SignalCommand::KeyCondition { target, .. }
            | SignalCommand::LastUpdateCondition { target, .. } => *target,
            SignalCommand::ClearOwner { .. }
            | SignalCommand::Transaction { .. }
            | SignalCommand::Snapshot { .. } => Id::ZERO,
        }
    }

    /// The scope owner recorded for nodes created by this command, for the
    /// insert-family commands that can create owned nodes.
    pub fn scope_owner(&self) -> Option<Id> {
        match self {
            SignalCommand::Insert { scope_owner, .. }
            | SignalCommand::PutIfAbsent { scope_owner, .. } => *scope_owner,
            _ => None,
        }
    }

    /// Condition commands are side-effect-free checks used to build
    /// optimistic preconditions inside transactions.
    pub fn is_condition(&self) -> bool {
        matches!(
            self,
            SignalCommand::ValueCondition { .. }
                | SignalCommand::PositionCondition { .. }
                | SignalCommand::KeyCondition { .. }
                | SignalCommand::LastUpdateCondition { .. }
        )
    }
}
