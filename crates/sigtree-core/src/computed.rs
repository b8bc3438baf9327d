//! Lazily evaluated signals derived from other signals.

use crate::id::Id;
use crate::transaction::Transaction;
use crate::tree::SignalTree;
use crate::usage::{Canceler, Scope, TransientListener, Usage, UsageTracker};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::{Arc, Weak};
use tracing::debug;

struct Cached<T> {
    value: T,
    /// Bumped on every effective value change. Dependents compare
    /// generations instead of values, so a dependency change that
    /// recomputes to an equal value does not propagate.
    generation: u64,
    dependencies: Arc<dyn Usage>,
    watcher: Option<Canceler>,
}

struct ComputedInner<T> {
    /// Private tree whose root is bumped on effective changes, so tree-level
    /// observers of dependents wake up.
    tree: SignalTree,
    callback: Mutex<Box<dyn FnMut(&mut Scope<'_>) -> T + Send>>,
    cache: Mutex<Option<Cached<T>>>,
}

/// A signal computed from other signals. The computation runs lazily: a read
/// re-runs the callback only when a dependency from the previous run has
/// changed, and dependents are only invalidated when the recomputed value
/// actually differs from the cached one.
pub struct ComputedSignal<T> {
    inner: Arc<ComputedInner<T>>,
}

impl<T> Clone for ComputedSignal<T> {
    fn clone(&self) -> Self {
        ComputedSignal {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + PartialEq + Send + 'static> ComputedSignal<T> {
    pub fn new(callback: impl FnMut(&mut Scope<'_>) -> T + Send + 'static) -> ComputedSignal<T> {
        ComputedSignal {
            inner: Arc::new(ComputedInner {
                tree: SignalTree::computed(),
                callback: Mutex::new(Box::new(callback)),
                cache: Mutex::new(None),
            }),
        }
    }

    /// The current value, registering this signal as a dependency of the
    /// calling scope.
    pub fn value(&self, scope: &mut Scope<'_>) -> T {
        let (value, generation) = self.inner.validate();
        scope.register_usage(Arc::new(ComputedUsage {
            inner: Arc::downgrade(&self.inner),
            generation,
        }));
        value
    }

    /// The current value without registering a dependency.
    pub fn peek(&self) -> T {
        self.inner.validate().0
    }
}

impl<T: Clone + PartialEq + Send + 'static> ComputedInner<T> {
    /// Ensures the cache is up to date, recomputing when a dependency has
    /// changed since the previous run. Returns the value and its generation.
    fn validate(self: &Arc<Self>) -> (T, u64) {
        let mut cache = self.cache.lock();

        if let Some(cached) = &*cache {
            let mut tx = Transaction::read_only();
            if !cached.dependencies.has_changes(&mut tx) {
                return (cached.value.clone(), cached.generation);
            }
        }

        // The computation reads the trees' current submitted state through
        // its own read-only transaction, independent of any caller
        // transaction.
        let mut tx = Transaction::read_only();
        let (value, dependencies) = UsageTracker::track(&mut tx, |scope| {
            let mut callback = self.callback.lock();
            (*callback)(scope)
        });

        let (generation, changed, old_watcher) = match cache.take() {
            Some(mut old) => {
                let changed = old.value != value;
                let generation = if changed {
                    old.generation + 1
                } else {
                    old.generation
                };
                (generation, changed, old.watcher.take())
            }
            None => (0, false, None),
        };

        *cache = Some(Cached {
            value: value.clone(),
            generation,
            dependencies: dependencies.clone(),
            watcher: None,
        });
        drop(cache);

        if let Some(cancel) = old_watcher {
            cancel();
        }
        if changed {
            debug!(tree = %self.tree.id(), generation, "computed value changed");
            self.tree.commit_single_command(
                crate::command::SignalCommand::Set {
                    command_id: Id::random(),
                    target: Id::ZERO,
                    value: Some(json!(generation)),
                },
                None,
            );
        }

        // Watch the new dependency set so an upstream change propagates to
        // this signal's own tree even when nobody is actively reading.
        // Registered outside the cache lock: a change that happened during
        // the computation fires the listener immediately, which revalidates.
        // Change notifications arrive while the notifying tree's lock is
        // held, so the revalidation runs deferred, once the notifying thread
        // has released its tree locks; revalidating inline would take other
        // tree locks in an unordered nesting.
        let weak = Arc::downgrade(self);
        let watcher = dependencies.on_next_change(Box::new(move || {
            let weak = weak.clone();
            crate::tree::defer(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.validate();
                }
            });
            false
        }));
        let mut watcher = Some(watcher);
        {
            let mut cache = self.cache.lock();
            if let Some(cached) = &mut *cache {
                if cached.generation == generation && cached.watcher.is_none() {
                    cached.watcher = watcher.take();
                }
            }
        }
        if let Some(stale) = watcher {
            // A revalidation already replaced this run's result and owns the
            // live watcher.
            stale();
        }

        (value, generation)
    }

    fn current_generation(self: &Arc<Self>) -> u64 {
        self.validate().1
    }
}

/// The usage a computed signal registers with its readers. Changes are
/// defined by generation, not by raw dependency changes.
struct ComputedUsage<T> {
    inner: Weak<ComputedInner<T>>,
    generation: u64,
}

impl<T: Clone + PartialEq + Send + 'static> Usage for ComputedUsage<T> {
    fn has_changes(&self, _tx: &mut Transaction) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.current_generation() != self.generation,
            None => false,
        }
    }

    fn on_next_change(&self, mut listener: TransientListener) -> Canceler {
        let Some(inner) = self.inner.upgrade() else {
            return Box::new(|| {});
        };

        // Same registration protocol as a plain node usage, against the
        // computed signal's own tree: lock, fire immediately on a missed
        // change, otherwise observe the marker node.
        let guard = inner.tree.lock();

        if inner.current_generation() != self.generation {
            let listen_to_next = listener();
            if !listen_to_next {
                drop(guard);
                return Box::new(|| {});
            }
        }

        let weak = self.inner.clone();
        let captured_generation = self.generation;
        let listener_id = inner.tree.observe_next_change(Id::ZERO, move || {
            match weak.upgrade() {
                Some(inner) => {
                    if inner.current_generation() != captured_generation {
                        listener()
                    } else {
                        true
                    }
                }
                None => false,
            }
        });
        drop(guard);

        let tree = inner.tree.clone();
        Box::new(move || tree.cancel_observer(listener_id))
    }
}
