//! A typed single-value signal over one tree node.

use crate::error::SignalError;
use crate::signal::{Signal, SignalOperation};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sigtree_core::{
    ComputedSignal, Data, Id, NodeUsage, Scope, SignalCommand, SignalTree, Transaction,
    TransactionKind,
};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;

/// A signal holding one serializable value.
///
/// The value lives in the node's JSON value slot; an absent value reads as
/// JSON null. Writes are plain commands, so several parties sharing a tree
/// converge through the tree's ordinary confirmation machinery.
pub struct ValueSignal<T> {
    tree: SignalTree,
    node: Id,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ValueSignal<T> {
    fn clone(&self) -> Self {
        ValueSignal {
            tree: self.tree.clone(),
            node: self.node,
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> ValueSignal<T> {
    /// A signal with its own synchronous tree, initialized to the given
    /// value.
    pub fn new(initial: &T) -> Result<ValueSignal<T>, SignalError> {
        let signal = ValueSignal::over(SignalTree::synchronous(), Id::ZERO);
        let value = serde_json::to_value(initial).map_err(SignalError::Serialize)?;
        signal.tree.commit_single_command(
            SignalCommand::Set {
                command_id: Id::random(),
                target: signal.node,
                value: Some(value),
            },
            None,
        );
        Ok(signal)
    }

    /// A signal view over an existing node of an existing tree.
    pub fn over(tree: SignalTree, node: Id) -> ValueSignal<T> {
        ValueSignal {
            tree,
            node,
            _marker: PhantomData,
        }
    }

    pub fn tree(&self) -> &SignalTree {
        &self.tree
    }

    pub fn node(&self) -> Id {
        self.node
    }

    fn decode(data: Option<&Data>) -> Result<T, SignalError> {
        let value = data
            .and_then(|data| data.value.clone())
            .unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(SignalError::Deserialize)
    }

    /// Replaces the value unconditionally.
    pub fn set(&self, tx: &mut Transaction, value: &T) -> Result<SignalOperation, SignalError> {
        let value = serde_json::to_value(value).map_err(SignalError::Serialize)?;
        let (operation, handler) = SignalOperation::pending();
        tx.include(
            &self.tree,
            SignalCommand::Set {
                command_id: Id::random(),
                target: self.node,
                value: Some(value),
            },
            Some(handler),
        );
        Ok(operation)
    }

    /// Compare-and-set: replaces the value only if it currently equals the
    /// expected value at commit time.
    pub fn replace(
        &self,
        tx: &mut Transaction,
        expected: &T,
        value: &T,
    ) -> Result<SignalOperation, SignalError> {
        let expected = serde_json::to_value(expected).map_err(SignalError::Serialize)?;
        let value = serde_json::to_value(value).map_err(SignalError::Serialize)?;
        let commands = vec![
            SignalCommand::ValueCondition {
                command_id: Id::random(),
                target: self.node,
                expected: Some(expected),
            },
            SignalCommand::Set {
                command_id: Id::random(),
                target: self.node,
                value: Some(value),
            },
        ];
        let (operation, handler) = SignalOperation::pending();
        tx.include(
            &self.tree,
            SignalCommand::Transaction {
                command_id: Id::random(),
                commands,
            },
            Some(handler),
        );
        Ok(operation)
    }

    /// Read-modify-write guarded by the node's update stamp: the write only
    /// commits if nothing else touched the node in between.
    pub fn update(
        &self,
        tx: &mut Transaction,
        f: impl FnOnce(&T) -> T,
    ) -> Result<SignalOperation, SignalError> {
        let revision = tx.read(&self.tree);
        let data = revision.data(self.node).cloned();
        let current = Self::decode(data.as_ref())?;
        let new_value = serde_json::to_value(f(&current)).map_err(SignalError::Serialize)?;
        let commands = vec![
            SignalCommand::LastUpdateCondition {
                command_id: Id::random(),
                target: self.node,
                expected: data.map(|data| data.last_update),
            },
            SignalCommand::Set {
                command_id: Id::random(),
                target: self.node,
                value: Some(new_value),
            },
        ];
        let (operation, handler) = SignalOperation::pending();
        tx.include(
            &self.tree,
            SignalCommand::Transaction {
                command_id: Id::random(),
                commands,
            },
            Some(handler),
        );
        Ok(operation)
    }
}

impl<T: Serialize + DeserializeOwned + Send + 'static> ValueSignal<T> {
    /// A computed signal derived from this signal's value.
    pub fn map<U: Clone + PartialEq + Send + 'static>(
        &self,
        mut f: impl FnMut(Result<T, SignalError>) -> U + Send + 'static,
    ) -> ComputedSignal<U> {
        let signal = self.clone();
        ComputedSignal::new(move |scope| f(signal.value(scope)))
    }
}

fn value_extractor() -> Arc<dyn Fn(&Data) -> Value + Send + Sync> {
    Arc::new(|data: &Data| data.value.clone().unwrap_or(Value::Null))
}

impl<T: Serialize + DeserializeOwned> Signal for ValueSignal<T> {
    type Value = T;

    fn value(&self, scope: &mut Scope<'_>) -> Result<T, SignalError> {
        if scope.is_tracking() {
            if let Some(usage) =
                NodeUsage::capture(&self.tree, self.node, scope.transaction(), value_extractor())
            {
                scope.register_usage(Arc::new(usage));
            }
        }
        let tx = scope.transaction();
        let revision = tx.read(&self.tree);
        let data = revision.data(self.node).cloned();
        if tx.kind() == TransactionKind::Staged {
            // Stage the repeatable read as a precondition so it still holds
            // when the transaction commits.
            tx.include(
                &self.tree,
                SignalCommand::LastUpdateCondition {
                    command_id: Id::random(),
                    target: self.node,
                    expected: data.as_ref().map(|data| data.last_update),
                },
                None,
            );
        }
        Self::decode(data.as_ref())
    }

    fn peek(&self, tx: &mut Transaction) -> Result<T, SignalError> {
        let revision = tx.read(&self.tree);
        Self::decode(revision.data(self.node))
    }

    fn peek_confirmed(&self) -> Result<T, SignalError> {
        Self::decode(self.tree.confirmed().data(self.node))
    }
}
