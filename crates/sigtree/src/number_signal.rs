//! A numeric signal with atomic increments.

use crate::error::SignalError;
use crate::signal::{Signal, SignalOperation};
use crate::value_signal::ValueSignal;
use sigtree_core::{Id, Scope, SignalCommand, SignalTree, Transaction};

/// A signal over a JSON number. Increments commute, so concurrent deltas
/// from several parties all take effect instead of overwriting each other.
#[derive(Clone)]
pub struct NumberSignal {
    inner: ValueSignal<f64>,
}

impl NumberSignal {
    pub fn new(initial: f64) -> Result<NumberSignal, SignalError> {
        Ok(NumberSignal {
            inner: ValueSignal::new(&initial)?,
        })
    }

    pub fn over(tree: SignalTree, node: Id) -> NumberSignal {
        NumberSignal {
            inner: ValueSignal::over(tree, node),
        }
    }

    pub fn tree(&self) -> &SignalTree {
        self.inner.tree()
    }

    /// Adds a delta to the current value. An absent or null value counts as
    /// zero; a non-numeric value rejects the command.
    pub fn increment(&self, tx: &mut Transaction, delta: f64) -> SignalOperation {
        let (operation, handler) = SignalOperation::pending();
        tx.include(
            self.inner.tree(),
            SignalCommand::Increment {
                command_id: Id::random(),
                target: self.inner.node(),
                delta,
            },
            Some(handler),
        );
        operation
    }

    /// Replaces the value outright, discarding concurrent increments.
    pub fn set(&self, tx: &mut Transaction, value: f64) -> Result<SignalOperation, SignalError> {
        self.inner.set(tx, &value)
    }
}

impl Signal for NumberSignal {
    type Value = f64;

    fn value(&self, scope: &mut Scope<'_>) -> Result<f64, SignalError> {
        self.inner.value(scope)
    }

    fn peek(&self, tx: &mut Transaction) -> Result<f64, SignalError> {
        self.inner.peek(tx)
    }

    fn peek_confirmed(&self) -> Result<f64, SignalError> {
        self.inner.peek_confirmed()
    }
}
