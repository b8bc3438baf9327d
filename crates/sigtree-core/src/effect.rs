//! Side effects that re-run when their tracked dependencies change.

use crate::transaction::Transaction;
use crate::usage::{Canceler, Scope, UsageTracker};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Schedules effect re-runs. Change notifications arrive synchronously while
/// tree locks are held; the dispatcher moves the actual re-run out of that
/// context, and batching dispatchers coalesce bursts of changes into a
/// single run.
pub trait EffectDispatcher: Send + Sync {
    fn dispatch(&self, task: Box<dyn FnOnce() + Send>);
}

/// Runs every task inline. Suitable for single-threaded use where re-running
/// in the middle of the notifying commit is acceptable.
pub struct ImmediateDispatcher;

impl EffectDispatcher for ImmediateDispatcher {
    fn dispatch(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }
}

struct EffectState {
    disposed: bool,
    /// A re-run is already queued with the dispatcher. Further change
    /// notifications before it runs are coalesced into it.
    scheduled: bool,
    watcher: Option<Canceler>,
}

struct EffectInner {
    dispatcher: Arc<dyn EffectDispatcher>,
    action: Mutex<Box<dyn FnMut(&mut Scope<'_>) + Send>>,
    state: Mutex<EffectState>,
}

/// A reactive side effect. Runs its action once on creation, tracks what the
/// action read, and re-runs it through the dispatcher whenever any of those
/// dependencies change. Each run re-tracks from scratch, so the dependency
/// set always reflects the most recent execution.
pub struct Effect {
    inner: Arc<EffectInner>,
}

impl Effect {
    pub fn new(
        dispatcher: Arc<dyn EffectDispatcher>,
        action: impl FnMut(&mut Scope<'_>) + Send + 'static,
    ) -> Effect {
        let inner = Arc::new(EffectInner {
            dispatcher,
            action: Mutex::new(Box::new(action)),
            state: Mutex::new(EffectState {
                disposed: false,
                scheduled: false,
                watcher: None,
            }),
        });
        EffectInner::run(&inner);
        Effect { inner }
    }

    /// Stops the effect. The action never runs again; a queued re-run
    /// becomes a no-op.
    pub fn dispose(&self) {
        let watcher = {
            let mut state = self.inner.state.lock();
            state.disposed = true;
            state.watcher.take()
        };
        if let Some(cancel) = watcher {
            cancel();
        }
    }
}

impl EffectInner {
    fn run(self: &Arc<Self>) {
        let old_watcher = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.watcher.take()
        };
        if let Some(cancel) = old_watcher {
            cancel();
        }

        // The action only observes; it reads through a read-only transaction
        // and cannot commit to non-computed trees.
        let mut tx = Transaction::read_only();
        let ((), usage) = UsageTracker::track(&mut tx, |scope| {
            let mut action = self.action.lock();
            (*action)(scope);
        });

        let weak = Arc::downgrade(self);
        let watcher = usage.on_next_change(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                EffectInner::schedule(&inner);
            }
            false
        }));

        let mut state = self.state.lock();
        if state.disposed || state.watcher.is_some() {
            // Disposed during the run, or a nested re-run (triggered by a
            // change that landed while tracking) already registered a newer
            // watcher.
            drop(state);
            watcher();
            return;
        }
        state.watcher = Some(watcher);
    }

    fn schedule(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.disposed || state.scheduled {
                return;
            }
            state.scheduled = true;
        }
        debug!("scheduling effect re-run");
        let weak = Arc::downgrade(self);
        self.dispatcher.dispatch(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().scheduled = false;
                EffectInner::run(&inner);
            }
        }));
    }
}
