//! Typed reactive signals over the sigtree engine.
//!
//! A signal is a lightweight typed view over one node of one signal tree.
//! Reads go through an explicit [`Transaction`] or tracking [`Scope`]; writes
//! are commands included in a transaction, with their outcome surfaced
//! through [`SignalOperation`] handles.

pub mod error;
pub mod number_signal;
pub mod signal;
pub mod value_signal;

pub use error::SignalError;
pub use number_signal::NumberSignal;
pub use signal::{Signal, SignalOperation};
pub use value_signal::ValueSignal;

pub use sigtree_core::{
    ComputedSignal, Effect, EffectDispatcher, Id, ImmediateDispatcher, Scope, SignalCommand,
    SignalTree, Transaction, TransactionKind, TransactionResult, UsageTracker,
};
