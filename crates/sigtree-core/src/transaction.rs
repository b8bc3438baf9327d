//! Transactions over one or more signal trees.
//!
//! A transaction is an explicit value passed to every read and write; there
//! is no ambient current transaction. The default staged kind buffers
//! commands per tree and commits them atomically across all touched trees
//! with a two-phase protocol: participants are locked in tree-id order, every
//! tree prepares its batch, and only when all of them can commit does any of
//! them apply. Reads inside a staged transaction see a per-tree base snapshot
//! captured at first touch plus the transaction's own staged commands.

use crate::command::SignalCommand;
use crate::commands_and_handlers::{CommandsAndHandlers, ResultHandler};
use crate::id::Id;
use crate::mutable_revision::MutableTreeRevision;
use crate::result::CommandResult;
use crate::revision::TreeRevision;
use crate::tree::{PendingCommit, SignalTree, TreeGuard, TreeType};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// No buffering and no repeatable reads; reads go straight to the tree's
    /// submitted snapshot and writes commit immediately.
    Root,
    /// Writes commit immediately but reads are repeatable: each tree's view
    /// is the snapshot from first touch plus the transaction's own writes.
    WriteThrough,
    /// Repeatable reads, no writes. Only computed trees accept commands in a
    /// read-only transaction.
    ReadOnly,
    /// Buffers writes per tree and commits them atomically at the end.
    Staged,
}

struct TreeEntry {
    tree: SignalTree,
    /// Snapshot captured when the transaction first touched the tree.
    base: Arc<TreeRevision>,
    staged: CommandsAndHandlers,
    /// Derived read view, rebuilt lazily after each staged command.
    cached: Option<Arc<TreeRevision>>,
}

pub struct Transaction {
    kind: TransactionKind,
    trees: BTreeMap<Id, TreeEntry>,
    result: TransactionResult,
    parent: Option<Box<Transaction>>,
}

impl Transaction {
    /// The no-transaction transaction. Cheap to create; used by callers that
    /// want immediate, non-repeatable semantics.
    pub fn root() -> Transaction {
        Transaction::new(TransactionKind::Root)
    }

    /// A standalone read-only transaction with repeatable reads, as used for
    /// computed signal evaluation.
    pub fn read_only() -> Transaction {
        Transaction::new(TransactionKind::ReadOnly)
    }

    /// A standalone write-through transaction: repeatable reads, immediate
    /// writes.
    pub fn write_through() -> Transaction {
        Transaction::new(TransactionKind::WriteThrough)
    }

    fn new(kind: TransactionKind) -> Transaction {
        Transaction {
            kind,
            trees: BTreeMap::new(),
            result: TransactionResult::unresolved(),
            parent: None,
        }
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Runs a closure inside a new staged transaction and commits it. The
    /// returned [`TransactionResult`] settles when every touched tree has
    /// decided the outcome, which for asynchronous trees happens at
    /// confirmation time.
    pub fn run<T>(f: impl FnOnce(&mut Transaction) -> T) -> (T, TransactionResult) {
        let mut tx = Transaction::new(TransactionKind::Staged);
        let value = f(&mut tx);
        let result = tx.commit();
        (value, result)
    }

    /// Runs a closure inside a nested transaction. A staged transaction
    /// nested in a staged transaction folds its per-tree batches into the
    /// outer transaction as single atomic transaction commands. A
    /// write-through transaction nested in a staged one applies its commands
    /// to the trees immediately and makes them visible to the outer
    /// transaction's reads.
    pub fn run_nested<T>(
        &mut self,
        kind: TransactionKind,
        f: impl FnOnce(&mut Transaction) -> T,
    ) -> T {
        assert!(
            kind != TransactionKind::Root,
            "a root transaction cannot be nested"
        );
        let parent = std::mem::replace(self, Transaction::root());
        let inner = Transaction {
            kind,
            trees: BTreeMap::new(),
            result: parent.result.clone(),
            parent: Some(Box::new(parent)),
        };
        // The guard puts the parent back into `self` even when the closure
        // unwinds; a panic discards the nested staged commands.
        let mut guard = NestedGuard {
            outer: self,
            inner,
            finished: false,
        };
        let value = f(&mut guard.inner);
        guard.finish();
        value
    }

    /// The transaction's view of a tree.
    pub fn read(&mut self, tree: &SignalTree) -> Arc<TreeRevision> {
        if self.kind == TransactionKind::Root {
            return tree.submitted();
        }
        self.touch(tree);
        let entry = match self.trees.get_mut(&tree.id()) {
            Some(entry) => entry,
            None => return tree.submitted(),
        };
        if entry.cached.is_none() {
            entry.cached = Some(if entry.staged.is_empty() {
                entry.base.clone()
            } else {
                // The staged batch is replayed as one atomic command: a
                // command that would fail at commit time also reverts its
                // effects from the derived view.
                let wrapped = SignalCommand::Transaction {
                    command_id: Id::random(),
                    commands: entry.staged.commands().to_vec(),
                };
                apply_to(&entry.base, &wrapped)
            });
        }
        match &entry.cached {
            Some(cached) => cached.clone(),
            None => entry.base.clone(),
        }
    }

    /// Adds a command to the transaction. Root and write-through
    /// transactions commit it immediately; a staged transaction buffers it
    /// until commit. Read-only transactions reject everything except
    /// commands against computed trees.
    pub fn include(
        &mut self,
        tree: &SignalTree,
        command: SignalCommand,
        handler: Option<ResultHandler>,
    ) {
        match self.kind {
            TransactionKind::Root => {
                tree.commit_single_command(command, handler);
            }
            TransactionKind::ReadOnly => {
                assert!(
                    tree.tree_type() == TreeType::Computed,
                    "cannot include commands in a read-only transaction"
                );
                self.include_write_through(tree, command, handler);
            }
            TransactionKind::WriteThrough => {
                self.include_write_through(tree, command, handler);
            }
            TransactionKind::Staged => {
                self.touch(tree);
                if let Some(entry) = self.trees.get_mut(&tree.id()) {
                    entry.staged.add(CommandsAndHandlers::single(command, handler));
                    entry.cached = None;
                }
            }
        }
    }

    fn include_write_through(
        &mut self,
        tree: &SignalTree,
        command: SignalCommand,
        handler: Option<ResultHandler>,
    ) {
        self.touch(tree);
        tree.commit_single_command(command.clone(), handler);
        if let Some(entry) = self.trees.get_mut(&tree.id()) {
            let view = entry.cached.as_ref().unwrap_or(&entry.base);
            let next = apply_to(view, &command);
            entry.cached = Some(next);
        }
        // An enclosing transaction keeps repeatable reads, but a command
        // that already took effect must not be invisible to it.
        if let Some(parent) = &mut self.parent {
            parent.absorb_committed(tree.id(), &command);
        }
    }

    /// Applies an already committed command to this transaction's base view
    /// of a tree, recursing into enclosing transactions.
    fn absorb_committed(&mut self, tree_id: Id, command: &SignalCommand) {
        if let Some(entry) = self.trees.get_mut(&tree_id) {
            entry.base = apply_to(&entry.base, command);
            entry.cached = None;
        }
        if let Some(parent) = &mut self.parent {
            parent.absorb_committed(tree_id, command);
        }
    }

    /// Registers a tree with the transaction on first touch, capturing the
    /// base snapshot and enforcing the tree-type composition rules.
    fn touch(&mut self, tree: &SignalTree) {
        if self.trees.contains_key(&tree.id()) {
            return;
        }
        let new_type = tree.tree_type();
        if new_type != TreeType::Computed {
            for entry in self.trees.values() {
                let existing = entry.tree.tree_type();
                if existing == TreeType::Computed {
                    continue;
                }
                assert!(
                    existing != TreeType::Asynchronous && new_type != TreeType::Asynchronous,
                    "an asynchronous tree can only share a transaction with computed trees"
                );
            }
        }
        let base = match &mut self.parent {
            Some(parent) => parent.read(tree),
            None => tree.submitted(),
        };
        self.trees.insert(
            tree.id(),
            TreeEntry {
                tree: tree.clone(),
                base,
                staged: CommandsAndHandlers::new(),
                cached: None,
            },
        );
    }

    /// Folds a nested staged transaction's batches into this transaction.
    /// Each tree's batch becomes a single atomic transaction command, so the
    /// nested transaction stays all-or-nothing inside the outer one.
    fn fold_staged(&mut self, inner: Transaction) {
        for (tree_id, entry) in inner.trees {
            if entry.staged.is_empty() {
                continue;
            }
            let (commands, handlers) = entry.staged.into_parts();
            let wrapped = SignalCommand::Transaction {
                command_id: Id::random(),
                commands,
            };
            let outer = self.trees.entry(tree_id).or_insert_with(|| TreeEntry {
                tree: entry.tree.clone(),
                base: entry.base.clone(),
                staged: CommandsAndHandlers::new(),
                cached: None,
            });
            outer
                .staged
                .add(CommandsAndHandlers::with_handlers(vec![wrapped], handlers));
            outer.cached = None;
        }
    }

    /// Commits the staged batches with the two-phase protocol. Trees are
    /// locked in ascending tree-id order so concurrent multi-tree commits
    /// cannot deadlock.
    fn commit(mut self) -> TransactionResult {
        let result = self.result.clone();

        let mut participants: Vec<(SignalTree, CommandsAndHandlers)> = Vec::new();
        for (tree_id, entry) in std::mem::take(&mut self.trees) {
            if entry.staged.is_empty() {
                continue;
            }
            let (commands, mut handlers) = entry.staged.into_parts();
            let wrapper_id = Id::random();
            let wrapped = SignalCommand::Transaction {
                command_id: wrapper_id,
                commands,
            };
            result.register_dependency();
            let tree_result = result.clone();
            handlers.insert(
                wrapper_id,
                Box::new(move |outcome: &CommandResult| match outcome.reject_reason() {
                    None => tree_result.resolve(tree_id, Ok(())),
                    Some(reason) => tree_result.resolve(tree_id, Err(reason.to_owned())),
                }),
            );
            participants.push((
                entry.tree,
                CommandsAndHandlers::with_handlers(vec![wrapped], handlers),
            ));
        }

        if participants.is_empty() {
            result.seal();
            return result;
        }

        debug!(trees = participants.len(), "committing staged transaction");

        let trees: Vec<SignalTree> = participants.iter().map(|(tree, _)| tree.clone()).collect();
        let _guards: Vec<TreeGuard<'_>> = trees.iter().map(SignalTree::lock).collect();

        let mut pending: Vec<PendingCommit<'_>> = participants
            .iter_mut()
            .map(|(tree, changes)| tree.prepare_commit(std::mem::take(changes)))
            .collect();

        if pending.iter().all(PendingCommit::can_commit) {
            for commit in &mut pending {
                commit.apply_changes();
            }
            for commit in &mut pending {
                commit.publish_changes();
            }
        } else {
            debug!("staged transaction cannot commit, aborting all participants");
            for commit in &mut pending {
                commit.mark_as_aborted();
            }
        }

        result.seal();
        result
    }
}

/// Restores the enclosing transaction when a nested run ends, including by
/// unwind. The nested transaction's staged commands fold or commit only on
/// the normal path.
struct NestedGuard<'a> {
    outer: &'a mut Transaction,
    inner: Transaction,
    finished: bool,
}

impl NestedGuard<'_> {
    fn finish(&mut self) {
        self.finished = true;
        let mut inner = std::mem::replace(&mut self.inner, Transaction::root());
        let mut parent = match inner.parent.take() {
            Some(parent) => *parent,
            None => Transaction::root(),
        };
        if inner.kind == TransactionKind::Staged {
            if parent.kind == TransactionKind::Staged {
                parent.fold_staged(inner);
            } else {
                // No outer staging to fold into; the nested transaction
                // commits on its own.
                inner.commit();
            }
        }
        *self.outer = parent;
    }
}

impl Drop for NestedGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(parent) = self.inner.parent.take() {
            *self.outer = *parent;
        }
    }
}

struct ResultState {
    pending: usize,
    sealed: bool,
    resolved_trees: HashSet<Id>,
    outcome: Option<Result<(), String>>,
    callbacks: Vec<Box<dyn FnOnce(&Result<(), String>) + Send>>,
}

/// Settles once every tree touched by a transaction has decided the commit
/// outcome. The first rejection wins; success requires every participant to
/// accept.
#[derive(Clone)]
pub struct TransactionResult {
    inner: Arc<Mutex<ResultState>>,
}

impl std::fmt::Debug for TransactionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionResult")
            .field("outcome", &self.outcome())
            .finish()
    }
}

impl TransactionResult {
    fn unresolved() -> TransactionResult {
        TransactionResult {
            inner: Arc::new(Mutex::new(ResultState {
                pending: 0,
                sealed: false,
                resolved_trees: HashSet::new(),
                outcome: None,
                callbacks: Vec::new(),
            })),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    pub fn outcome(&self) -> Option<Result<(), String>> {
        self.inner.lock().outcome.clone()
    }

    /// Runs the callback when the result settles, or immediately if it
    /// already has.
    pub fn on_complete(&self, callback: impl FnOnce(&Result<(), String>) + Send + 'static) {
        let outcome = {
            let mut state = self.inner.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&outcome);
    }

    fn register_dependency(&self) {
        let mut state = self.inner.lock();
        debug_assert!(!state.sealed);
        state.pending += 1;
    }

    fn resolve(&self, tree_id: Id, tree_outcome: Result<(), String>) {
        let (outcome, callbacks) = {
            let mut state = self.inner.lock();
            debug_assert!(
                state.resolved_trees.insert(tree_id),
                "tree resolved its transaction outcome twice"
            );
            state.pending -= 1;
            if state.outcome.is_some() {
                return;
            }
            let settled = match tree_outcome {
                Err(reason) => Some(Err(reason)),
                Ok(()) if state.pending == 0 && state.sealed => Some(Ok(())),
                Ok(()) => None,
            };
            match settled {
                Some(outcome) => {
                    state.outcome = Some(outcome.clone());
                    (outcome, std::mem::take(&mut state.callbacks))
                }
                None => return,
            }
        };
        for callback in callbacks {
            callback(&outcome);
        }
    }

    /// Marks registration complete; an empty transaction settles as success.
    fn seal(&self) {
        let (outcome, callbacks) = {
            let mut state = self.inner.lock();
            state.sealed = true;
            if state.outcome.is_some() || state.pending > 0 {
                return;
            }
            let outcome = Ok(());
            state.outcome = Some(outcome.clone());
            (outcome, std::mem::take(&mut state.callbacks))
        };
        for callback in callbacks {
            callback(&outcome);
        }
    }
}

fn apply_to(revision: &Arc<TreeRevision>, command: &SignalCommand) -> Arc<TreeRevision> {
    let mut scratch = MutableTreeRevision::new(revision);
    scratch.apply(command, &mut |_, _| {});
    Arc::new(scratch.into_revision())
}
