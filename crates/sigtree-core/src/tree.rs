//! Signal trees: shared state containers with a confirmation state machine.
//!
//! A tree owns two revision snapshots. `confirmed` reflects commands that the
//! tree's source of truth has acknowledged; `submitted` additionally reflects
//! speculatively applied local commands. A synchronous tree is its own source
//! of truth so the two snapshots always coincide. An asynchronous tree hands
//! submitted commands to an external log through its submitter callback and
//! converges when [`SignalTree::confirm`] delivers the log's decisions, which
//! may interleave commands from other parties.
//!
//! All tree access goes through a per-tree re-entrant lock. The two-phase
//! [`PendingCommit`] protocol exists so a transaction spanning several trees
//! can prepare everything before applying anything.

use crate::command::SignalCommand;
use crate::commands_and_handlers::{CommandsAndHandlers, ResultHandler};
use crate::id::Id;
use crate::mutable_revision::MutableTreeRevision;
use crate::result::CommandResult;
use crate::revision::TreeRevision;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::{Cell, RefCell, RefMut};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Classifies a tree for transaction composition rules. Computed trees are
/// private to a computed signal and may participate anywhere; synchronous and
/// asynchronous trees never share a transaction since their commit outcomes
/// are decided at different times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeType {
    Synchronous,
    Computed,
    Asynchronous,
}

type Submitter = Box<dyn FnMut(Vec<SignalCommand>) + Send>;

enum TreeKind {
    Synchronous { computed: bool },
    Asynchronous { submitter: parking_lot::Mutex<Submitter> },
}

struct NodeObserver {
    node: Id,
    callback: Box<dyn FnMut() -> bool + Send>,
}

type ProcessedSubscriber = Box<dyn FnMut(&SignalCommand, &CommandResult) + Send>;

struct TreeState {
    confirmed: Arc<TreeRevision>,
    submitted: Arc<TreeRevision>,
    /// Commands submitted but not yet confirmed, in submission order. Always
    /// empty for synchronous trees.
    unconfirmed: Vec<CommandsAndHandlers>,
    observers: BTreeMap<u64, NodeObserver>,
    processed_subscribers: BTreeMap<u64, ProcessedSubscriber>,
    /// Listener ids cancelled while their entry was temporarily removed for
    /// notification.
    cancelled: HashSet<u64>,
    next_listener_id: u64,
    pins: HashMap<Id, usize>,
    stashed_inserts: HashMap<Id, Vec<SignalCommand>>,
}

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
    static HELD_GUARDS: Cell<usize> = Cell::new(0);
    static DEFERRED: RefCell<VecDeque<Box<dyn FnOnce()>>> = RefCell::new(VecDeque::new());
    static DRAINING: Cell<bool> = Cell::new(false);
}

fn thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Runs a task once the current thread holds no tree locks, or immediately
/// when it already holds none. Change notifications run under the notifying
/// tree's lock; work that needs to take other tree locks (computed
/// revalidation) goes through here so lock acquisition never nests across
/// trees in notification order.
pub(crate) fn defer(task: impl FnOnce() + 'static) {
    let locked = HELD_GUARDS.with(|count| count.get() > 0);
    if locked {
        DEFERRED.with(|queue| queue.borrow_mut().push_back(Box::new(task)));
    } else {
        task();
    }
}

/// Called when a tree guard is released. Drains the deferred queue once the
/// thread's outermost guard is gone; tasks may take locks and defer more
/// work, which the running drain picks up.
fn release_guard() {
    let idle = HELD_GUARDS.with(|count| {
        let left = count.get() - 1;
        count.set(left);
        left == 0
    });
    if !idle || DRAINING.with(Cell::get) {
        return;
    }
    DRAINING.with(|flag| flag.set(true));
    while let Some(task) = DEFERRED.with(|queue| queue.borrow_mut().pop_front()) {
        task();
    }
    DRAINING.with(|flag| flag.set(false));
}

/// Re-entrant tree lock that knows which thread currently holds it, so
/// commit-protocol methods can assert the locking contract.
struct TreeLock {
    mutex: ReentrantMutex<RefCell<TreeState>>,
    owner: AtomicU64,
    depth: AtomicU64,
}

impl TreeLock {
    fn new(state: TreeState) -> TreeLock {
        TreeLock {
            mutex: ReentrantMutex::new(RefCell::new(state)),
            owner: AtomicU64::new(0),
            depth: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> TreeGuard<'_> {
        let guard = self.mutex.lock();
        self.owner.store(thread_token(), Ordering::Release);
        self.depth.fetch_add(1, Ordering::Relaxed);
        HELD_GUARDS.with(|count| count.set(count.get() + 1));
        TreeGuard {
            lock: self,
            guard: Some(guard),
        }
    }

    fn has_lock(&self) -> bool {
        self.owner.load(Ordering::Acquire) == thread_token()
    }
}

/// Holds the tree lock. The state itself stays private to this module; the
/// guard exists so callers can keep a tree locked across a sequence of tree
/// operations.
pub struct TreeGuard<'a> {
    lock: &'a TreeLock,
    guard: Option<ReentrantMutexGuard<'a, RefCell<TreeState>>>,
}

impl TreeGuard<'_> {
    fn state(&self) -> RefMut<'_, TreeState> {
        match &self.guard {
            Some(guard) => guard.borrow_mut(),
            None => unreachable!("tree guard already released"),
        }
    }
}

impl Drop for TreeGuard<'_> {
    fn drop(&mut self) {
        if self.lock.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.lock.owner.store(0, Ordering::Release);
        }
        // Release the mutex first so deferred work runs with no tree lock
        // held.
        self.guard.take();
        release_guard();
    }
}

struct TreeShared {
    id: Id,
    kind: TreeKind,
    lock: TreeLock,
}

/// Cheaply cloneable handle to one shared signal tree.
#[derive(Clone)]
pub struct SignalTree {
    shared: Arc<TreeShared>,
}

impl std::fmt::Debug for SignalTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalTree")
            .field("id", &self.shared.id)
            .field("tree_type", &self.tree_type())
            .finish()
    }
}

impl SignalTree {
    fn new(kind: TreeKind) -> SignalTree {
        let id = Id::random();
        let revision = Arc::new(TreeRevision::root_revision(id));
        let state = TreeState {
            confirmed: revision.clone(),
            submitted: revision,
            unconfirmed: Vec::new(),
            observers: BTreeMap::new(),
            processed_subscribers: BTreeMap::new(),
            cancelled: HashSet::new(),
            next_listener_id: 0,
            pins: HashMap::new(),
            stashed_inserts: HashMap::new(),
        };
        SignalTree {
            shared: Arc::new(TreeShared {
                id,
                kind,
                lock: TreeLock::new(state),
            }),
        }
    }

    /// A tree that is its own source of truth: commands are confirmed the
    /// moment they are committed.
    pub fn synchronous() -> SignalTree {
        SignalTree::new(TreeKind::Synchronous { computed: false })
    }

    /// A synchronous tree private to a computed signal.
    pub fn computed() -> SignalTree {
        SignalTree::new(TreeKind::Synchronous { computed: true })
    }

    /// A tree whose source of truth is external. Committed commands are
    /// applied speculatively to the submitted snapshot and handed to the
    /// submitter; [`SignalTree::confirm`] later delivers the authoritative
    /// outcome, possibly interleaved with other parties' commands.
    pub fn asynchronous(submitter: impl FnMut(Vec<SignalCommand>) + Send + 'static) -> SignalTree {
        SignalTree::new(TreeKind::Asynchronous {
            submitter: parking_lot::Mutex::new(Box::new(submitter)),
        })
    }

    pub fn id(&self) -> Id {
        self.shared.id
    }

    pub fn tree_type(&self) -> TreeType {
        match &self.shared.kind {
            TreeKind::Synchronous { computed: false } => TreeType::Synchronous,
            TreeKind::Synchronous { computed: true } => TreeType::Computed,
            TreeKind::Asynchronous { .. } => TreeType::Asynchronous,
        }
    }

    /// Acquires the tree lock. Re-entrant within a thread.
    pub fn lock(&self) -> TreeGuard<'_> {
        self.shared.lock.lock()
    }

    /// Whether the current thread holds the tree lock.
    pub fn has_lock(&self) -> bool {
        self.shared.lock.has_lock()
    }

    /// Snapshot of the externally acknowledged state.
    pub fn confirmed(&self) -> Arc<TreeRevision> {
        let guard = self.lock();
        let state = guard.state();
        state.confirmed.clone()
    }

    /// Snapshot including speculatively applied local commands.
    pub fn submitted(&self) -> Arc<TreeRevision> {
        let guard = self.lock();
        let state = guard.state();
        state.submitted.clone()
    }

    /// Evaluates a command batch against the submitted snapshot without
    /// changing any tree state yet. The caller must hold the tree lock and
    /// keep holding it until the returned commit is applied or aborted.
    pub fn prepare_commit(&self, changes: CommandsAndHandlers) -> PendingCommit<'_> {
        assert!(self.has_lock(), "prepare_commit requires the tree lock");
        let old_revision = self.submitted();
        let mut scratch = MutableTreeRevision::new(&old_revision);
        let mut results = HashMap::new();
        for command in changes.commands() {
            scratch.apply(command, &mut |id, result| {
                results.insert(id, result);
            });
        }

        let can_commit = match &self.shared.kind {
            // Synchronous trees decide now.
            TreeKind::Synchronous { .. } => changes
                .commands()
                .iter()
                .all(|command| results.get(&command.command_id()).is_some_and(CommandResult::accepted)),
            // Asynchronous trees only decide at confirmation; the local
            // application is speculative and rejected commands simply leave
            // the snapshot unchanged.
            TreeKind::Asynchronous { .. } => true,
        };

        PendingCommit {
            tree: self,
            changes: Some(changes),
            results,
            old_revision,
            new_revision: Some(scratch.into_revision()),
            can_commit,
        }
    }

    /// Locks the tree and runs a single command through the full commit
    /// protocol.
    pub fn commit_single_command(&self, command: SignalCommand, handler: Option<ResultHandler>) {
        let _guard = self.lock();
        let mut pending = self.prepare_commit(CommandsAndHandlers::single(command, handler));
        if pending.can_commit() {
            pending.apply_changes();
            pending.publish_changes();
        } else {
            pending.mark_as_aborted();
        }
    }

    /// Registers a listener for the next change to the given node in the
    /// submitted snapshot. The listener stays registered when it returns
    /// `true`; callbacks registered while a notification is in flight are not
    /// invoked for that notification.
    pub fn observe_next_change(
        &self,
        node: Id,
        callback: impl FnMut() -> bool + Send + 'static,
    ) -> u64 {
        let guard = self.lock();
        let mut state = guard.state();
        let listener_id = state.next_listener_id;
        state.next_listener_id += 1;
        state.observers.insert(
            listener_id,
            NodeObserver {
                node,
                callback: Box::new(callback),
            },
        );
        listener_id
    }

    pub fn cancel_observer(&self, listener_id: u64) {
        let guard = self.lock();
        let mut state = guard.state();
        if state.observers.remove(&listener_id).is_none() {
            state.cancelled.insert(listener_id);
        }
    }

    /// Subscribes to the outcome of every processed top-level command.
    /// Synchronous trees report at publish time, asynchronous trees at
    /// confirmation time.
    pub fn subscribe_to_processed(
        &self,
        subscriber: impl FnMut(&SignalCommand, &CommandResult) + Send + 'static,
    ) -> u64 {
        let guard = self.lock();
        let mut state = guard.state();
        let listener_id = state.next_listener_id;
        state.next_listener_id += 1;
        state
            .processed_subscribers
            .insert(listener_id, Box::new(subscriber));
        listener_id
    }

    pub fn unsubscribe_processed(&self, listener_id: u64) {
        let guard = self.lock();
        let mut state = guard.state();
        if state.processed_subscribers.remove(&listener_id).is_none() {
            state.cancelled.insert(listener_id);
        }
    }

    /// Delivers confirmed commands from the external log, in log order. The
    /// confirmed snapshot is advanced, queue entries covered by the results
    /// are resolved and removed, and the submitted snapshot is re-derived by
    /// replaying the still-unconfirmed queue on top of the new confirmed
    /// state. Out-of-order delivery is not detected; the transport owns the
    /// ordering contract.
    pub fn confirm(&self, commands: &[SignalCommand]) {
        assert!(
            matches!(self.shared.kind, TreeKind::Asynchronous { .. }),
            "only asynchronous trees take external confirmations"
        );
        let guard = self.lock();

        let (old_submitted, confirmed) = {
            let state = guard.state();
            (state.submitted.clone(), state.confirmed.clone())
        };

        let mut scratch = MutableTreeRevision::new(&confirmed);
        let mut results = HashMap::new();
        for command in commands {
            scratch.apply(command, &mut |id, result| {
                results.insert(id, result);
            });
        }
        let new_confirmed = Arc::new(scratch.into_revision());
        debug!(
            tree = %self.id(),
            commands = commands.len(),
            unconfirmed = guard.state().unconfirmed.len(),
            "confirming commands"
        );

        let mut queue = {
            let mut state = guard.state();
            state.confirmed = new_confirmed.clone();
            std::mem::take(&mut state.unconfirmed)
        };
        // Resolving handlers may re-enter the tree and submit new commands;
        // those land in the (currently empty) live queue and are appended
        // back below.
        for entry in &mut queue {
            entry.remove_handled_commands(&results);
        }
        queue.retain(|entry| !entry.is_empty());

        {
            let mut state = guard.state();
            let appended = std::mem::replace(&mut state.unconfirmed, queue);
            state.unconfirmed.extend(appended);
        }

        let new_submitted = {
            let state = guard.state();
            let mut scratch = MutableTreeRevision::new(&new_confirmed);
            for entry in &state.unconfirmed {
                scratch.apply_all(entry.commands());
            }
            Arc::new(scratch.into_revision())
        };
        guard.state().submitted = new_submitted.clone();

        self.notify_processed(commands, &results);
        self.notify_observers(&old_submitted, &new_submitted);
    }

    /// Takes a pin on behalf of an owner id. The first pin after an eviction
    /// replays the owner's stashed insert commands.
    pub fn pin(&self, owner: Id) {
        let guard = self.lock();
        let replay = {
            let mut state = guard.state();
            let count = state.pins.entry(owner).or_insert(0);
            *count += 1;
            if *count == 1 {
                state.stashed_inserts.remove(&owner)
            } else {
                None
            }
        };
        drop(guard);
        if let Some(commands) = replay {
            debug!(tree = %self.id(), %owner, inserts = commands.len(), "replaying pinned inserts");
            for command in commands {
                self.commit_single_command(command, None);
            }
        }
    }

    /// Releases a pin. Dropping the last pin for an owner evicts all nodes
    /// the owner inserted and stashes their insert commands for a later
    /// re-pin.
    pub fn unpin(&self, owner: Id) {
        let guard = self.lock();
        let evict = {
            let mut state = guard.state();
            match state.pins.get_mut(&owner) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    state.pins.remove(&owner);
                    true
                }
                None => false,
            }
        };
        if evict {
            let inserts: Vec<SignalCommand> = self
                .submitted()
                .original_inserts()
                .values()
                .filter(|command| command.scope_owner() == Some(owner))
                .cloned()
                .collect();
            debug!(tree = %self.id(), %owner, inserts = inserts.len(), "evicting owner scope");
            self.commit_single_command(
                SignalCommand::ClearOwner {
                    command_id: Id::random(),
                    owner,
                },
                None,
            );
            if !inserts.is_empty() {
                guard.state().stashed_inserts.insert(owner, inserts);
            }
        }
    }

    /// Invokes observers of every node whose resolved data differs between
    /// the two snapshots. Fired observers are removed first and re-added only
    /// when their callback returns `true`, so a callback re-registering
    /// itself is not invoked again for the same change.
    fn notify_observers(&self, old: &TreeRevision, new: &TreeRevision) {
        let guard = self.lock();
        let mut fired = Vec::new();
        {
            let mut state = guard.state();
            let fired_ids: Vec<u64> = state
                .observers
                .iter()
                .filter(|(_, observer)| old.data(observer.node) != new.data(observer.node))
                .map(|(listener_id, _)| *listener_id)
                .collect();
            for listener_id in fired_ids {
                if let Some(observer) = state.observers.remove(&listener_id) {
                    fired.push((listener_id, observer));
                }
            }
        }
        for (listener_id, mut observer) in fired {
            let keep = (observer.callback)();
            let mut state = guard.state();
            let cancelled = state.cancelled.remove(&listener_id);
            if keep && !cancelled {
                state.observers.insert(listener_id, observer);
            }
        }
    }

    /// Reports each top-level command's outcome to the processed-command
    /// subscribers.
    fn notify_processed(&self, commands: &[SignalCommand], results: &HashMap<Id, CommandResult>) {
        let guard = self.lock();
        let taken: Vec<(u64, ProcessedSubscriber)> = {
            let mut state = guard.state();
            let ids: Vec<u64> = state.processed_subscribers.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| state.processed_subscribers.remove(&id).map(|sub| (id, sub)))
                .collect()
        };
        for (listener_id, mut subscriber) in taken {
            for command in commands {
                if let Some(result) = results.get(&command.command_id()) {
                    subscriber(command, result);
                }
            }
            let mut state = guard.state();
            let cancelled = state.cancelled.remove(&listener_id);
            if !cancelled {
                state.processed_subscribers.insert(listener_id, subscriber);
            }
        }
    }
}

/// An evaluated but not yet effective command batch. Created under the tree
/// lock; every method asserts that the same lock is still held.
pub struct PendingCommit<'a> {
    tree: &'a SignalTree,
    changes: Option<CommandsAndHandlers>,
    results: HashMap<Id, CommandResult>,
    old_revision: Arc<TreeRevision>,
    new_revision: Option<TreeRevision>,
    can_commit: bool,
}

impl PendingCommit<'_> {
    pub fn can_commit(&self) -> bool {
        self.can_commit
    }

    /// Makes the evaluated batch effective. For a synchronous tree both
    /// snapshots advance; for an asynchronous tree the submitted snapshot
    /// advances, the batch joins the unconfirmed queue and goes to the
    /// submitter.
    pub fn apply_changes(&mut self) {
        assert!(self.tree.has_lock(), "apply_changes requires the tree lock");
        assert!(self.can_commit, "apply_changes on a non-committable batch");
        let Some(new_revision) = self.new_revision.take() else {
            panic!("apply_changes called twice");
        };
        let new_revision = Arc::new(new_revision);

        let guard = self.tree.lock();
        match &self.tree.shared.kind {
            TreeKind::Synchronous { .. } => {
                let mut state = guard.state();
                state.confirmed = new_revision.clone();
                state.submitted = new_revision;
            }
            TreeKind::Asynchronous { submitter } => {
                let Some(changes) = self.changes.take() else {
                    panic!("apply_changes called twice");
                };
                let commands = changes.commands().to_vec();
                {
                    let mut state = guard.state();
                    state.submitted = new_revision;
                    state.unconfirmed.push(changes);
                }
                debug!(tree = %self.tree.id(), commands = commands.len(), "submitting commands");
                (*submitter.lock())(commands);
            }
        }
    }

    /// Notifies result handlers, processed-command subscribers and node
    /// observers. Asynchronous trees defer handlers and subscribers to
    /// confirmation and only notify observers of the speculative change.
    pub fn publish_changes(&mut self) {
        assert!(self.tree.has_lock(), "publish_changes requires the tree lock");
        match &self.tree.shared.kind {
            TreeKind::Synchronous { .. } => {
                let new_revision = self.tree.submitted();
                if let Some(mut changes) = self.changes.take() {
                    changes.notify_result_handlers(&self.results);
                    self.tree.notify_processed(changes.commands(), &self.results);
                }
                self.tree.notify_observers(&self.old_revision, &new_revision);
            }
            TreeKind::Asynchronous { .. } => {
                let new_revision = self.tree.submitted();
                self.tree.notify_observers(&self.old_revision, &new_revision);
            }
        }
    }

    /// Abandons the batch without touching tree state. Every handler is
    /// resolved with a rejection: commands that were themselves rejected
    /// keep their own reason, accepted ones report the aborted transaction.
    pub fn mark_as_aborted(&mut self) {
        assert!(self.tree.has_lock(), "mark_as_aborted requires the tree lock");
        let aborted: HashMap<Id, CommandResult> = self
            .results
            .iter()
            .map(|(id, result)| {
                let result = if result.accepted() {
                    CommandResult::fail("Transaction aborted")
                } else {
                    result.clone()
                };
                (*id, result)
            })
            .collect();
        debug!(tree = %self.tree.id(), "aborting commit");
        if let Some(mut changes) = self.changes.take() {
            changes.notify_result_handlers(&aborted);
        }
    }
}
