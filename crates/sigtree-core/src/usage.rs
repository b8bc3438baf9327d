//! Dependency tracking for reactive reads.
//!
//! A tracked computation runs against a [`Scope`]; every signal read inside
//! it registers a [`Usage`] capturing what was read and how to detect that it
//! later changed. The usages collected from one run combine into a single
//! usage that computed signals and effects watch to know when to re-run.

use crate::id::Id;
use crate::node::Data;
use crate::transaction::Transaction;
use crate::tree::SignalTree;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

/// Listener invoked on the next relevant change. Returns `true` to stay
/// registered for further changes.
pub type TransientListener = Box<dyn FnMut() -> bool + Send>;

/// Cancels a change registration.
pub type Canceler = Box<dyn FnOnce() + Send>;

/// One dependency captured during a tracked computation.
pub trait Usage: Send + Sync {
    /// Whether the dependency has changed, as seen through the given
    /// transaction, since it was captured.
    fn has_changes(&self, tx: &mut Transaction) -> bool;

    /// Registers a listener for the next change. If a change already
    /// happened between capture and registration the listener runs
    /// immediately; the tree lock closes the window in between, so no change
    /// can slip past unobserved.
    fn on_next_change(&self, listener: TransientListener) -> Canceler;
}

struct NoUsage;

impl Usage for NoUsage {
    fn has_changes(&self, _tx: &mut Transaction) -> bool {
        false
    }

    fn on_next_change(&self, _listener: TransientListener) -> Canceler {
        Box::new(|| {})
    }
}

/// Extracts the comparison value a usage captures from a node. Different
/// signal types care about different parts of a node.
pub type UsageExtractor = Arc<dyn Fn(&Data) -> Value + Send + Sync>;

/// A usage over one node of one tree. Captures an extracted comparison value
/// and reports a change whenever the extracted value differs. A removed node
/// never reports changes.
#[derive(Clone)]
pub struct NodeUsage {
    tree: SignalTree,
    node: Id,
    captured: Value,
    extract: UsageExtractor,
}

impl NodeUsage {
    /// Captures the node as seen through the transaction. Returns `None`
    /// when the node does not exist, in which case there is nothing to
    /// track.
    pub fn capture(
        tree: &SignalTree,
        node: Id,
        tx: &mut Transaction,
        extract: UsageExtractor,
    ) -> Option<NodeUsage> {
        let captured = tx.read(tree).data(node).map(|data| extract(data))?;
        Some(NodeUsage {
            tree: tree.clone(),
            node,
            captured,
            extract,
        })
    }

    /// Captures the full observable content of a node: its value and both
    /// child collections.
    pub fn capture_content(tree: &SignalTree, node: Id, tx: &mut Transaction) -> Option<NodeUsage> {
        NodeUsage::capture(tree, node, tx, Arc::new(content_value))
    }
}

/// Comparison value covering everything observable about a node except its
/// update stamp. Re-setting an equal value bumps the stamp but is not a
/// change in content.
pub fn content_value(data: &Data) -> Value {
    json!([data.value, data.list_children, data.map_children])
}

impl Usage for NodeUsage {
    fn has_changes(&self, tx: &mut Transaction) -> bool {
        match tx.read(&self.tree).data(self.node) {
            Some(data) => (self.extract)(data) != self.captured,
            None => false,
        }
    }

    fn on_next_change(&self, mut listener: TransientListener) -> Canceler {
        // Lock the tree so no change can be processed between the check
        // below and the observer registration.
        let guard = self.tree.lock();

        if self.has_changes(&mut Transaction::root()) {
            let listen_to_next = listener();
            if !listen_to_next {
                drop(guard);
                return Box::new(|| {});
            }
        }

        let usage = self.clone();
        let listener_id = self.tree.observe_next_change(self.node, move || {
            // The tree reports any change to the node; consult the captured
            // value to decide whether it is relevant to this usage.
            if usage.has_changes(&mut Transaction::root()) {
                listener()
            } else {
                true
            }
        });
        drop(guard);

        let tree = self.tree.clone();
        Box::new(move || tree.cancel_observer(listener_id))
    }
}

/// Aggregate over the usages of one tracked computation.
pub struct CombinedUsage {
    usages: Vec<Arc<dyn Usage>>,
}

impl CombinedUsage {
    pub fn new(usages: Vec<Arc<dyn Usage>>) -> CombinedUsage {
        CombinedUsage { usages }
    }
}

impl Usage for CombinedUsage {
    fn has_changes(&self, tx: &mut Transaction) -> bool {
        self.usages.iter().any(|usage| usage.has_changes(tx))
    }

    fn on_next_change(&self, listener: TransientListener) -> Canceler {
        struct Shared {
            listener: Option<TransientListener>,
            active: bool,
        }
        let shared = Arc::new(Mutex::new(Shared {
            listener: Some(listener),
            active: true,
        }));

        let mut cancelers = Vec::new();
        for usage in &self.usages {
            let shared = shared.clone();
            cancelers.push(usage.on_next_change(Box::new(move || {
                // Take the listener out and invoke it without holding the
                // lock; the listener may re-enter through the canceler below.
                let taken = {
                    let mut shared = shared.lock();
                    if !shared.active {
                        return false;
                    }
                    shared.listener.take()
                };
                let Some(mut listener) = taken else {
                    // Another branch is mid-invocation; stay registered and
                    // let the shared state decide on the next change.
                    return true;
                };
                let keep = listener();
                let mut shared = shared.lock();
                if !keep {
                    shared.active = false;
                }
                if shared.active {
                    shared.listener = Some(listener);
                }
                shared.active
            })));
        }

        Box::new(move || {
            shared.lock().active = false;
            for canceler in cancelers {
                canceler();
            }
        })
    }
}

/// A tracked computation's execution context: the transaction to read
/// through, plus the collector that tracked signal reads report to.
pub struct Scope<'a> {
    transaction: &'a mut Transaction,
    collector: Option<&'a mut Vec<Arc<dyn Usage>>>,
}

impl Scope<'_> {
    pub fn transaction(&mut self) -> &mut Transaction {
        self.transaction
    }

    /// Whether reads in this scope register dependencies.
    pub fn is_tracking(&self) -> bool {
        self.collector.is_some()
    }

    pub fn register_usage(&mut self, usage: Arc<dyn Usage>) {
        if let Some(collector) = &mut self.collector {
            collector.push(usage);
        }
    }

    /// Runs a closure with tracking suspended. Reads inside it do not become
    /// dependencies of the enclosing computation.
    pub fn untracked<T>(&mut self, f: impl FnOnce(&mut Scope<'_>) -> T) -> T {
        let mut scope = Scope {
            transaction: &mut *self.transaction,
            collector: None,
        };
        f(&mut scope)
    }
}

pub struct UsageTracker;

impl UsageTracker {
    /// Runs a computation with dependency tracking and returns its value
    /// together with the combined usage of everything it read.
    pub fn track<T>(
        tx: &mut Transaction,
        f: impl FnOnce(&mut Scope<'_>) -> T,
    ) -> (T, Arc<dyn Usage>) {
        let mut usages: Vec<Arc<dyn Usage>> = Vec::new();
        let value = {
            let mut scope = Scope {
                transaction: tx,
                collector: Some(&mut usages),
            };
            f(&mut scope)
        };
        let usage: Arc<dyn Usage> = match usages.len() {
            0 => UsageTracker::no_usage(),
            1 => match usages.pop() {
                Some(usage) => usage,
                None => UsageTracker::no_usage(),
            },
            _ => Arc::new(CombinedUsage::new(usages)),
        };
        (value, usage)
    }

    /// Runs a computation without tracking.
    pub fn untracked<T>(tx: &mut Transaction, f: impl FnOnce(&mut Scope<'_>) -> T) -> T {
        let mut scope = Scope {
            transaction: tx,
            collector: None,
        };
        f(&mut scope)
    }

    /// The usage of a computation that read nothing: never changes, never
    /// fires.
    pub fn no_usage() -> Arc<dyn Usage> {
        Arc::new(NoUsage)
    }
}
