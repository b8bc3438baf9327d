//! The signal read contract and operation handles.

use crate::error::SignalError;
use parking_lot::Mutex;
use sigtree_core::{CommandResult, ResultHandler, Scope, Transaction};
use std::sync::Arc;

/// Read access shared by all typed signals.
pub trait Signal {
    type Value;

    /// The value as seen by the scope's transaction, registering the signal
    /// as a dependency when the scope is tracking.
    fn value(&self, scope: &mut Scope<'_>) -> Result<Self::Value, SignalError>;

    /// The value as seen by the transaction, without registering a
    /// dependency.
    fn peek(&self, tx: &mut Transaction) -> Result<Self::Value, SignalError>;

    /// The confirmed value, ignoring the current transaction and any
    /// unconfirmed submitted commands.
    fn peek_confirmed(&self) -> Result<Self::Value, SignalError>;
}

struct OperationState {
    outcome: Option<Result<(), String>>,
    callbacks: Vec<Box<dyn FnOnce(&Result<(), String>) + Send>>,
}

/// Handle to one submitted signal write. Settles when the backing tree
/// decides the command's outcome, which for a signal over an asynchronous
/// tree happens at confirmation time.
#[derive(Clone)]
pub struct SignalOperation {
    state: Arc<Mutex<OperationState>>,
}

impl std::fmt::Debug for SignalOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalOperation")
            .field("outcome", &self.state.lock().outcome)
            .finish()
    }
}

impl SignalOperation {
    /// Creates an unsettled handle and the result handler that settles it.
    pub(crate) fn pending() -> (SignalOperation, ResultHandler) {
        let operation = SignalOperation {
            state: Arc::new(Mutex::new(OperationState {
                outcome: None,
                callbacks: Vec::new(),
            })),
        };
        let state = operation.state.clone();
        let handler: ResultHandler = Box::new(move |result: &CommandResult| {
            let outcome = match result.reject_reason() {
                None => Ok(()),
                Some(reason) => Err(reason.to_owned()),
            };
            let callbacks = {
                let mut state = state.lock();
                debug_assert!(state.outcome.is_none());
                state.outcome = Some(outcome.clone());
                std::mem::take(&mut state.callbacks)
            };
            for callback in callbacks {
                callback(&outcome);
            }
        });
        (operation, handler)
    }

    pub fn is_settled(&self) -> bool {
        self.state.lock().outcome.is_some()
    }

    /// The settled outcome, or `None` while the operation is in flight.
    pub fn outcome(&self) -> Option<Result<(), SignalError>> {
        self.state.lock().outcome.as_ref().map(|outcome| {
            outcome
                .as_ref()
                .map(|()| ())
                .map_err(|reason| SignalError::Rejected(reason.clone()))
        })
    }

    /// Runs the callback when the operation settles, or immediately if it
    /// already has.
    pub fn on_complete(&self, callback: impl FnOnce(&Result<(), String>) + Send + 'static) {
        let outcome = {
            let mut state = self.state.lock();
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
}
