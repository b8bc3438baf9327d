//! Immutable node value types.
//!
//! A tree maps ids to nodes. Most nodes are [`Data`] nodes carrying a JSON
//! value and ordered list/map children. An [`Alias`] is a forwarding pointer
//! created by idempotent inserts; reads always resolve through it to the
//! underlying data node. Aliases never target other aliases.

use crate::id::Id;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Data(Data),
    Alias(Alias),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub parent: Option<Id>,
    /// Id of the command that last touched this node.
    pub last_update: Id,
    /// Tree id responsible for this node's lifecycle, if any. Used by
    /// `ClearOwner` to evict a released scope's nodes en masse.
    pub scope_owner: Option<Id>,
    pub value: Option<Value>,
    pub list_children: Vec<Id>,
    pub map_children: IndexMap<String, Id>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub target: Id,
}

impl Node {
    /// An empty, parentless data node, as used for the roots of a new tree.
    pub fn empty(last_update: Id) -> Node {
        Node::Data(Data {
            parent: None,
            last_update,
            scope_owner: None,
            value: None,
            list_children: Vec::new(),
            map_children: IndexMap::new(),
        })
    }

    pub fn as_data(&self) -> Option<&Data> {
        match self {
            Node::Data(data) => Some(data),
            Node::Alias(_) => None,
        }
    }
}

impl Data {
    /// Copy of this node with a new value, stamped with the mutating command.
    pub fn with_value(&self, command_id: Id, value: Option<Value>) -> Data {
        Data {
            parent: self.parent,
            last_update: command_id,
            scope_owner: self.scope_owner,
            value,
            list_children: self.list_children.clone(),
            map_children: self.map_children.clone(),
        }
    }

    /// Copy of this node with a new parent. Does not bump `last_update`; the
    /// child keeps its own update stamp when adopted.
    pub fn with_parent(&self, parent: Option<Id>) -> Data {
        Data {
            parent,
            last_update: self.last_update,
            scope_owner: self.scope_owner,
            value: self.value.clone(),
            list_children: self.list_children.clone(),
            map_children: self.map_children.clone(),
        }
    }

    pub fn with_list_children(&self, command_id: Id, list_children: Vec<Id>) -> Data {
        Data {
            parent: self.parent,
            last_update: command_id,
            scope_owner: self.scope_owner,
            value: self.value.clone(),
            list_children,
            map_children: self.map_children.clone(),
        }
    }

    pub fn with_map_children(&self, command_id: Id, map_children: IndexMap<String, Id>) -> Data {
        Data {
            parent: self.parent,
            last_update: command_id,
            scope_owner: self.scope_owner,
            value: self.value.clone(),
            list_children: self.list_children.clone(),
            map_children,
        }
    }

    pub fn without_children(&self, command_id: Id) -> Data {
        Data {
            parent: self.parent,
            last_update: command_id,
            scope_owner: self.scope_owner,
            value: self.value.clone(),
            list_children: Vec::new(),
            map_children: IndexMap::new(),
        }
    }
}
