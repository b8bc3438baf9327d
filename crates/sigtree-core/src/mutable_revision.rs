//! The command application engine.
//!
//! A [`MutableTreeRevision`] is a by-value copy of a base revision that
//! applies commands one at a time, producing a [`CommandResult`] for each and
//! never leaving the tree in an invalid state. Each command is evaluated by a
//! [`TreeManipulator`] that collects updated and detached nodes before
//! anything is written back, so a rejection leaves the revision untouched and
//! transactions can roll back wholesale.

use crate::command::{ListPosition, SignalCommand};
use crate::id::Id;
use crate::node::{Alias, Data, Node};
use crate::result::{Accept, CommandResult, NodeModification};
use crate::revision::TreeRevision;
use serde_json::{Number, Value};
use std::collections::{HashMap, HashSet};

/// A tree revision that can be mutated by applying signal commands.
#[derive(Debug, Clone)]
pub struct MutableTreeRevision {
    revision: TreeRevision,
}

impl MutableTreeRevision {
    /// Creates a mutable revision as a copy of the provided base.
    pub fn new(base: &TreeRevision) -> MutableTreeRevision {
        MutableTreeRevision {
            revision: base.clone(),
        }
    }

    pub fn revision(&self) -> &TreeRevision {
        &self.revision
    }

    /// Consumes the builder, yielding the revision to expose as a snapshot.
    pub fn into_revision(self) -> TreeRevision {
        self.revision
    }

    /// Applies a sequence of commands, ignoring the results.
    pub fn apply_all(&mut self, commands: &[SignalCommand]) {
        for command in commands {
            self.apply(command, &mut |_, _| {});
        }
    }

    /// Applies a sequence of commands and collects the results to a map.
    pub fn apply_and_get_results(
        &mut self,
        commands: &[SignalCommand],
    ) -> HashMap<Id, CommandResult> {
        let mut results = HashMap::new();
        for command in commands {
            self.apply(command, &mut |id, result| {
                results.insert(id, result);
            });
        }
        results
    }

    /// Applies a single command and passes results to the collector. The
    /// collector is invoked exactly once for most commands but multiple times
    /// for transactions, which also report their sub-command results.
    pub fn apply(
        &mut self,
        command: &SignalCommand,
        result_collector: &mut dyn FnMut(Id, CommandResult),
    ) {
        let (result, sub_results) = if self.revision.data(command.target_node_id()).is_some() {
            let mut manipulator = TreeManipulator::new(&self.revision, command.command_id());
            let result = manipulator.handle_command(command);
            (result, manipulator.sub_results.take())
        } else {
            (CommandResult::fail("Node not found"), None)
        };

        if let Some(sub_results) = sub_results {
            for (id, sub_result) in sub_results {
                result_collector(id, sub_result);
            }
        }

        if let CommandResult::Accept(accept) = &result {
            for (node_id, update) in &accept.updates {
                match &update.new_node {
                    Some(new_node) => {
                        self.revision.nodes_mut().insert(*node_id, new_node.clone());
                    }
                    None => {
                        self.revision.nodes_mut().remove(node_id);
                        self.revision.original_inserts_mut().remove(node_id);
                    }
                }
            }
            for (node_id, insert) in &accept.original_inserts {
                self.revision
                    .original_inserts_mut()
                    .insert(*node_id, insert.clone());
            }
        }

        result_collector(command.command_id(), result);

        debug_assert!(self.revision.assert_valid_tree());
    }
}

/// Gathers all state related to applying a single command. Changes are
/// collected rather than applied in place so that later commands inside a
/// transaction are evaluated against the collected changes while the real
/// revision stays untouched until every sub-command has accepted. The same
/// structure also decomposes compound operations (detach + attach) into
/// individually evaluated steps.
struct TreeManipulator<'a> {
    base: &'a TreeRevision,
    command_id: Id,
    updated_nodes: HashMap<Id, Node>,
    detached_nodes: HashSet<Id>,
    original_inserts: HashMap<Id, SignalCommand>,
    /// The result is kept in a field so helper steps can set it while also
    /// returning a regular value.
    result: Option<CommandResult>,
    /// Sub-command results for transactions, collected so that earlier
    /// results can be rewritten when a later sub-command is rejected.
    sub_results: Option<HashMap<Id, CommandResult>>,
}

impl<'a> TreeManipulator<'a> {
    fn new(base: &'a TreeRevision, command_id: Id) -> TreeManipulator<'a> {
        TreeManipulator {
            base,
            command_id,
            updated_nodes: HashMap::new(),
            detached_nodes: HashSet::new(),
            original_inserts: HashMap::new(),
            result: None,
            sub_results: None,
        }
    }

    fn set_result(&mut self, result: CommandResult) {
        debug_assert!(self.result.is_none());
        self.result = Some(result);
    }

    fn fail(&mut self, reason: &str) {
        self.set_result(CommandResult::fail(reason));
    }

    fn resolve_alias(&self, node_id: Id) -> Id {
        let node = self
            .updated_nodes
            .get(&node_id)
            .or_else(|| self.base.nodes().get(&node_id));
        match node {
            Some(Node::Alias(alias)) => alias.target,
            _ => node_id,
        }
    }

    fn resolve_optional(&self, node_id: Option<Id>) -> Option<Id> {
        node_id.map(|id| self.resolve_alias(id))
    }

    /// The data node for an id as seen through the collected changes.
    fn data(&self, node_id: Id) -> Option<&Data> {
        let id = self.resolve_alias(node_id);
        if self.detached_nodes.contains(&id) {
            return None;
        }
        if let Some(node) = self.updated_nodes.get(&id) {
            return node.as_data();
        }
        self.base.data(id)
    }

    /// Resolves an id to its data node, failing the command with "Node not
    /// found" when it does not exist.
    fn require_data(&mut self, node_id: Id) -> Option<(Data, Id)> {
        debug_assert!(self.result.is_none());
        let id = self.resolve_alias(node_id);
        match self.data(id) {
            Some(data) => Some((data.clone(), id)),
            None => {
                self.fail("Node not found");
                None
            }
        }
    }

    fn value(&self, node_id: Id) -> Option<Value> {
        self.data(node_id).and_then(|data| data.value.clone())
    }

    fn set_value(&mut self, node_id: Id, value: Option<Value>) {
        if let Some((node, id)) = self.require_data(node_id) {
            self.updated_nodes
                .insert(id, Node::Data(node.with_value(self.command_id, value)));
        }
    }

    fn list_children(&self, parent_id: Id) -> Option<Vec<Id>> {
        self.data(parent_id).map(|data| data.list_children.clone())
    }

    fn map_child(&self, node_id: Id, key: &str) -> Option<Id> {
        self.data(node_id)
            .and_then(|data| data.map_children.get(key).copied())
    }

    fn is_same_node(&self, a: Option<Id>, b: Option<Id>) -> bool {
        self.resolve_optional(a) == self.resolve_optional(b)
    }

    fn is_child_at(&self, parent_id: Id, index: isize, expected_child: Id) -> bool {
        if index < 0 {
            return false;
        }
        let at_index = self
            .list_children(parent_id)
            .and_then(|children| children.get(index as usize).copied());
        match at_index {
            Some(id) => self.is_same_node(Some(id), Some(expected_child)),
            None => false,
        }
    }

    /// Removes a node from its parent's children and marks it pending
    /// re-attach. Returns `false` when the command was failed.
    fn detach(&mut self, node_id: Id) -> bool {
        let id = self.resolve_alias(node_id);
        if self.detached_nodes.contains(&id) {
            // Already pending detach in this command (owned nodes nested
            // under other owned nodes during owner eviction).
            return true;
        }
        let Some((node, id)) = self.require_data(id) else {
            return false;
        };
        if id == Id::ZERO {
            self.fail("Cannot detach the root");
            return false;
        }
        let Some(parent_id) = node.parent else {
            self.fail("Node is not attached");
            return false;
        };
        let parent_id = self.resolve_alias(parent_id);
        let Some(parent) = self.data(parent_id).cloned() else {
            // The parent is itself pending detach; the cascade will pick
            // this node up as part of the subtree.
            self.detached_nodes.insert(id);
            return true;
        };

        let map_key = parent
            .map_children
            .iter()
            .find(|(_, child)| **child == id)
            .map(|(key, _)| key.clone());
        let updated_parent = match map_key {
            Some(key) => {
                let mut map = parent.map_children.clone();
                map.shift_remove(&key);
                parent.with_map_children(self.command_id, map)
            }
            None => {
                let mut list = parent.list_children.clone();
                list.retain(|child| *child != id);
                parent.with_list_children(self.command_id, list)
            }
        };
        self.updated_nodes
            .insert(parent_id, Node::Data(updated_parent));
        self.detached_nodes.insert(id);
        true
    }

    /// Attaches a pending-detach node under a parent, using `attacher` to
    /// produce the parent's updated child collections.
    fn attach(
        &mut self,
        parent_id: Id,
        child_id: Id,
        attacher: impl FnOnce(&mut Self, &Data, Id) -> Option<Data>,
    ) {
        if self.result.is_some() {
            return;
        }

        let resolved_parent = self.resolve_alias(parent_id);
        let resolved_child = self.resolve_alias(child_id);

        if !self.detached_nodes.contains(&resolved_child) {
            self.fail("Node is not detached");
            return;
        }

        // Cycle prevention: walk the ancestors of the target parent before
        // attaching and reject if the node being attached is among them.
        let mut ancestor = Some(resolved_parent);
        while let Some(current) = ancestor {
            if current == resolved_child {
                self.fail("Cannot attach to own descendant");
                return;
            }
            ancestor = self
                .data(current)
                .and_then(|data| data.parent)
                .map(|parent| self.resolve_alias(parent));
        }

        let Some((parent, parent_resolved)) = self.require_data(resolved_parent) else {
            return;
        };
        // Clear the pending mark only after the last error check that could
        // otherwise observe the node as missing.
        self.detached_nodes.remove(&resolved_child);

        let updated_parent = attacher(self, &parent, resolved_child);
        if self.result.is_some() {
            return;
        }
        let Some(updated_parent) = updated_parent else {
            return;
        };
        let Some(child) = self.data(resolved_child).cloned() else {
            self.fail("Node not found");
            return;
        };
        self.updated_nodes
            .insert(parent_resolved, Node::Data(updated_parent));
        self.updated_nodes.insert(
            resolved_child,
            Node::Data(child.with_parent(Some(parent_resolved))),
        );
    }

    fn attach_as(&mut self, parent_id: Id, key: &str, child_id: Id) {
        let command_id = self.command_id;
        self.attach(parent_id, child_id, |manipulator, parent, resolved_child| {
            if parent.map_children.contains_key(key) {
                manipulator.fail("Key is in use");
                return None;
            }
            let mut map = parent.map_children.clone();
            map.insert(key.to_owned(), resolved_child);
            Some(parent.with_map_children(command_id, map))
        });
    }

    fn attach_at(&mut self, parent_id: Id, position: ListPosition, child_id: Id) {
        let command_id = self.command_id;
        let insert_index = self
            .data(parent_id)
            .map(|parent| parent.list_children.clone())
            .map(|children| self.find_insert_index(&children, position));
        self.attach(parent_id, child_id, |manipulator, parent, resolved_child| {
            match insert_index.flatten() {
                Some(index) => {
                    let mut list = parent.list_children.clone();
                    list.insert(index, resolved_child);
                    Some(parent.with_list_children(command_id, list))
                }
                None => {
                    manipulator.fail("Insert position not matched");
                    None
                }
            }
        });
    }

    /// The list index a position resolves to, or `None` when a named
    /// neighbor is no longer where the position requires it to be.
    fn find_insert_index(&self, children: &[Id], position: ListPosition) -> Option<usize> {
        let after = self.resolve_optional(position.after);
        let before = self.resolve_optional(position.before);

        if let Some(after) = after {
            let index = if after == Id::EDGE {
                // After edge: insert first.
                0
            } else {
                children.iter().position(|child| *child == after)? + 1
            };

            // Validate the before constraint if there is one.
            if let Some(before) = before {
                let at_index = children.get(index).copied().unwrap_or(Id::EDGE);
                if at_index != before {
                    return None;
                }
            }
            Some(index)
        } else {
            // A position must name at least one neighbor.
            let before = before?;
            if before == Id::EDGE {
                // Before edge: insert last.
                Some(children.len())
            } else {
                children.iter().position(|child| *child == before)
            }
        }
    }

    /// Creates a new parentless node, pending attach, under the command's id.
    fn create_node(
        &mut self,
        node_id: Id,
        value: Option<Value>,
        scope_owner: Option<Id>,
        command: &SignalCommand,
    ) {
        if self.data(node_id).is_some() {
            self.fail("Node already exists");
            return;
        }

        // Pending detach makes the node eligible for attaching.
        self.detached_nodes.insert(node_id);
        self.updated_nodes.insert(
            node_id,
            Node::Data(Data {
                parent: None,
                last_update: self.command_id,
                scope_owner,
                value,
                list_children: Vec::new(),
                map_children: indexmap::IndexMap::new(),
            }),
        );

        if scope_owner == Some(self.base.owner_id()) {
            self.original_inserts.insert(node_id, command.clone());
        }
    }

    fn modification(&self, id: Id, new_node: Option<Node>) -> NodeModification {
        NodeModification {
            old_node: self.base.nodes().get(&id).cloned(),
            new_node,
        }
    }

    fn handle_command(&mut self, command: &SignalCommand) -> CommandResult {
        match command {
            SignalCommand::Set { target, value, .. } => {
                self.set_value(*target, value.clone());
            }
            SignalCommand::Increment { target, delta, .. } => {
                self.handle_increment(*target, *delta);
            }
            SignalCommand::Put {
                command_id,
                target,
                key,
                value,
            } => {
                self.handle_put(*command_id, *target, key, value.clone(), command);
            }
            SignalCommand::PutIfAbsent {
                command_id,
                target,
                key,
                value,
                scope_owner,
            } => {
                self.handle_put_if_absent(
                    *command_id,
                    *target,
                    key,
                    value.clone(),
                    *scope_owner,
                    command,
                );
            }
            SignalCommand::RemoveByKey { target, key, .. } => {
                match self.map_child(*target, key) {
                    Some(child) => {
                        self.detach(child);
                    }
                    None => self.fail("Key not present"),
                }
            }
            SignalCommand::Insert {
                command_id,
                target,
                value,
                position,
                scope_owner,
            } => {
                self.create_node(*command_id, value.clone(), *scope_owner, command);
                self.attach_at(*target, *position, *command_id);
            }
            SignalCommand::Remove {
                target,
                expected_parent,
                ..
            } => {
                self.handle_remove(*target, *expected_parent);
            }
            SignalCommand::Clear { target, .. } => {
                self.handle_clear(*target);
            }
            SignalCommand::ClearOwner { owner, .. } => {
                self.handle_clear_owner(*owner);
            }
            SignalCommand::AdoptAs {
                target, key, child, ..
            } => {
                if self.detach(*child) {
                    self.attach_as(*target, key, *child);
                }
            }
            SignalCommand::AdoptAt {
                target,
                position,
                child,
                ..
            } => {
                if self.detach(*child) {
                    self.attach_at(*target, *position, *child);
                }
            }
            SignalCommand::ValueCondition {
                target, expected, ..
            } => {
                let result = self.handle_value_condition(*target, expected.clone());
                self.set_result(result);
            }
            SignalCommand::PositionCondition {
                target,
                child,
                position,
                ..
            } => {
                let result = self.handle_position_condition(*target, *child, *position);
                self.set_result(result);
            }
            SignalCommand::KeyCondition {
                target,
                key,
                expected_child,
                ..
            } => {
                let result = self.handle_key_condition(*target, key, *expected_child);
                self.set_result(result);
            }
            SignalCommand::LastUpdateCondition {
                target, expected, ..
            } => {
                let last_update = self.data(*target).map(|data| data.last_update);
                let result =
                    CommandResult::conditional(last_update == *expected, "Unexpected last update");
                self.set_result(result);
            }
            SignalCommand::Transaction { commands, .. } => {
                self.handle_transaction(commands);
            }
            SignalCommand::Snapshot { nodes, .. } => {
                // Snapshots only bootstrap a pristine tree; applying one on
                // top of other changes would need merge semantics the engine
                // does not define.
                debug_assert!(self.base.original_inserts().is_empty());
                self.updated_nodes
                    .extend(nodes.iter().map(|(id, node)| (*id, node.clone())));
            }
        }

        if let Some(result) = self.result.take() {
            return result;
        }

        let mut updates: HashMap<Id, NodeModification> = HashMap::new();
        for (id, new_node) in &self.updated_nodes {
            if !self.detached_nodes.contains(id) {
                updates.insert(*id, self.modification(*id, Some(new_node.clone())));
            }
        }

        if !self.detached_nodes.is_empty() {
            // Aliases pointing into a removed subtree go with it.
            let mut reverse_aliases: HashMap<Id, Vec<Id>> = HashMap::new();
            for (id, node) in self.base.nodes() {
                if let Node::Alias(alias) = node {
                    reverse_aliases.entry(alias.target).or_default().push(*id);
                }
            }

            let mut to_detach: Vec<Id> = self.detached_nodes.iter().copied().collect();
            while let Some(removed) = to_detach.pop() {
                updates.insert(removed, self.modification(removed, None));

                for alias_id in reverse_aliases.get(&removed).into_iter().flatten() {
                    updates.insert(*alias_id, self.modification(*alias_id, None));
                }

                // The cascade reads children from the base revision: a
                // detached subtree cannot have been restructured by the same
                // command.
                if let Some(node) = self.base.data(removed) {
                    to_detach.extend(node.list_children.iter().copied());
                    to_detach.extend(node.map_children.values().copied());
                }
            }
        }

        CommandResult::Accept(Accept {
            updates,
            original_inserts: std::mem::take(&mut self.original_inserts),
        })
    }

    fn handle_increment(&mut self, target: Id, delta: f64) {
        let new_value = match self.value(target) {
            Some(Value::Number(number)) => match number.as_f64() {
                Some(current) => current + delta,
                None => {
                    self.fail("Value is not numeric");
                    return;
                }
            },
            None | Some(Value::Null) => delta,
            Some(_) => {
                self.fail("Value is not numeric");
                return;
            }
        };
        match Number::from_f64(new_value) {
            Some(number) => self.set_value(target, Some(Value::Number(number))),
            None => self.fail("Value is not numeric"),
        }
    }

    fn handle_put(
        &mut self,
        command_id: Id,
        target: Id,
        key: &str,
        value: Option<Value>,
        command: &SignalCommand,
    ) {
        match self.map_child(target, key) {
            Some(child) => self.set_value(child, value),
            None => {
                self.create_node(command_id, value, None, command);
                self.attach_as(target, key, command_id);
            }
        }
    }

    fn handle_put_if_absent(
        &mut self,
        command_id: Id,
        target: Id,
        key: &str,
        value: Option<Value>,
        scope_owner: Option<Id>,
        command: &SignalCommand,
    ) {
        match self.map_child(target, key) {
            Some(child) => {
                if self.data(command_id).is_some() {
                    self.fail("Node already exists");
                    return;
                }
                // Idempotent insert: the command id becomes an alias to the
                // child already present under the key.
                let target_id = self.resolve_alias(child);
                self.updated_nodes
                    .insert(command_id, Node::Alias(Alias { target: target_id }));
            }
            None => {
                self.create_node(command_id, value, scope_owner, command);
                self.attach_as(target, key, command_id);
            }
        }
    }

    fn handle_remove(&mut self, target: Id, expected_parent: Option<Id>) {
        if let Some(expected) = expected_parent {
            let parent = self.data(target).and_then(|data| data.parent);
            if !self.is_same_node(Some(expected), parent) {
                self.fail("Not a child");
                return;
            }
        }
        self.detach(target);
    }

    fn handle_clear(&mut self, target: Id) {
        let Some((node, id)) = self.require_data(target) else {
            return;
        };
        if node.list_children.is_empty() && node.map_children.is_empty() {
            return;
        }
        self.detached_nodes.extend(node.list_children.iter().copied());
        self.detached_nodes.extend(node.map_children.values().copied());
        self.updated_nodes
            .insert(id, Node::Data(node.without_children(self.command_id)));
    }

    fn handle_clear_owner(&mut self, owner: Id) {
        let owned: Vec<Id> = self
            .base
            .nodes()
            .iter()
            .filter_map(|(id, node)| match node {
                Node::Data(data) if data.scope_owner == Some(owner) => Some(*id),
                _ => None,
            })
            .collect();
        for id in owned {
            if !self.detach(id) {
                return;
            }
        }
    }

    fn handle_value_condition(&mut self, target: Id, expected: Option<Value>) -> CommandResult {
        let value = self.value(target).unwrap_or(Value::Null);
        let expected = expected.unwrap_or(Value::Null);
        CommandResult::conditional(value == expected, "Unexpected value")
    }

    fn handle_position_condition(
        &mut self,
        target: Id,
        child: Id,
        position: ListPosition,
    ) -> CommandResult {
        let resolved_child = self.resolve_alias(child);
        let children = self.list_children(target).unwrap_or_default();
        let Some(index) = children.iter().position(|id| *id == resolved_child) else {
            return CommandResult::fail("Not a child");
        };

        if let Some(after) = position.after {
            if after == Id::EDGE {
                if index != 0 {
                    return CommandResult::fail("Not the first child");
                }
            } else if !self.is_child_at(target, index as isize - 1, after) {
                return CommandResult::fail("Not after the provided child");
            }
        }

        if let Some(before) = position.before {
            if before == Id::EDGE {
                if index != children.len() - 1 {
                    return CommandResult::fail("Not the last child");
                }
            } else if !self.is_child_at(target, index as isize + 1, before) {
                return CommandResult::fail("Not before the provided child");
            }
        }

        CommandResult::ok()
    }

    fn handle_key_condition(
        &mut self,
        target: Id,
        key: &str,
        expected_child: Option<Id>,
    ) -> CommandResult {
        let actual = self.map_child(target, key);
        match expected_child {
            None => CommandResult::conditional(actual.is_some(), "Key not present"),
            Some(expected) if expected == Id::ZERO => {
                CommandResult::conditional(actual.is_none(), "A key is present")
            }
            Some(expected) => CommandResult::conditional(
                actual.is_some() && self.is_same_node(actual, Some(expected)),
                "Unexpected child",
            ),
        }
    }

    /// Applies sub-commands against a scratch copy. The first rejection
    /// aborts the batch: earlier accepted sub-results are rewritten to the
    /// same rejection and nothing reaches the real revision. When everything
    /// accepts, the updates are merged in command order so later updates to
    /// the same node override earlier ones.
    fn handle_transaction(&mut self, commands: &[SignalCommand]) {
        let mut scratchpad = MutableTreeRevision::new(self.base);

        let mut sub_results: HashMap<Id, CommandResult> = HashMap::new();
        let mut first_reject: Option<CommandResult> = None;

        for command in commands {
            scratchpad.apply(command, &mut |id, result| {
                sub_results.insert(id, result);
            });

            let child_result = sub_results.get(&command.command_id());
            if let Some(result @ CommandResult::Reject(_)) = child_result {
                first_reject = Some(result.clone());
                break;
            }
        }

        match first_reject {
            None => {
                let mut updates: HashMap<Id, NodeModification> = HashMap::new();
                let mut original_inserts: HashMap<Id, SignalCommand> = HashMap::new();

                // Iterate the command list to preserve merge order.
                for command in commands {
                    let Some(CommandResult::Accept(accept)) =
                        sub_results.get(&command.command_id())
                    else {
                        continue;
                    };
                    for (node_id, modification) in &accept.updates {
                        match updates.get_mut(node_id) {
                            Some(existing) => {
                                existing.new_node = modification.new_node.clone();
                            }
                            None => {
                                updates.insert(*node_id, modification.clone());
                            }
                        }
                    }
                    original_inserts.extend(
                        accept
                            .original_inserts
                            .iter()
                            .map(|(id, insert)| (*id, insert.clone())),
                    );
                }

                self.set_result(CommandResult::Accept(Accept {
                    updates,
                    original_inserts,
                }));
                self.sub_results = Some(sub_results);
            }
            Some(reject) => {
                for command in commands {
                    let entry = sub_results.entry(command.command_id()).or_insert_with(|| {
                        reject.clone()
                    });
                    if entry.accepted() {
                        *entry = reject.clone();
                    }
                }
                self.sub_results = Some(sub_results);
                self.set_result(reject);
            }
        }
    }
}
