//! Outcome of evaluating one command against a tree state.
//!
//! Rejection is an expected, data-driven outcome (stale position, occupied
//! key, missing node) and is always surfaced through result handlers, never
//! as an error type.

use crate::command::SignalCommand;
use crate::id::Id;
use crate::node::Node;
use std::collections::HashMap;

/// One node's transition within an accepted command. `new_node == None`
/// denotes deletion; `old_node == None` denotes creation.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeModification {
    pub old_node: Option<Node>,
    pub new_node: Option<Node>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Accept {
    pub updates: HashMap<Id, NodeModification>,
    /// Insert commands recorded for nodes owned by the applying tree,
    /// replayed when a released owner scope is pinned again.
    pub original_inserts: HashMap<Id, SignalCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Accept(Accept),
    Reject(Reject),
}

impl CommandResult {
    /// An acceptance without any node updates, as produced by a passing
    /// condition command.
    pub fn ok() -> CommandResult {
        CommandResult::Accept(Accept::default())
    }

    pub fn fail(reason: impl Into<String>) -> CommandResult {
        CommandResult::Reject(Reject {
            reason: reason.into(),
        })
    }

    /// `ok()` when the condition holds, otherwise a rejection with the given
    /// reason.
    pub fn conditional(condition: bool, reason: &str) -> CommandResult {
        if condition {
            CommandResult::ok()
        } else {
            CommandResult::fail(reason)
        }
    }

    pub fn accepted(&self) -> bool {
        matches!(self, CommandResult::Accept(_))
    }

    pub fn reject_reason(&self) -> Option<&str> {
        match self {
            CommandResult::Accept(_) => None,
            CommandResult::Reject(reject) => Some(&reject.reason),
        }
    }
}
