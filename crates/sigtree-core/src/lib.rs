//! Core engine for sigtree: a command-sourced, tree-shaped state store that
//! backs a reactive value-propagation system.
//!
//! The engine is domain-agnostic. It knows nothing about rendering or
//! transports; it defines the command catalogue, the revision model, the
//! confirmation state machine and the transaction/commit protocol, and leaves
//! delivery of confirmed commands to an external log.

pub mod command;
pub mod commands_and_handlers;
pub mod computed;
pub mod effect;
pub mod id;
pub mod mutable_revision;
pub mod node;
pub mod result;
pub mod revision;
pub mod transaction;
pub mod tree;
pub mod usage;

pub use command::{ListPosition, SignalCommand};
pub use commands_and_handlers::{CommandsAndHandlers, ResultHandler};
pub use computed::ComputedSignal;
pub use effect::{Effect, EffectDispatcher, ImmediateDispatcher};
pub use id::Id;
pub use mutable_revision::MutableTreeRevision;
pub use node::{Alias, Data, Node};
pub use result::{Accept, CommandResult, NodeModification, Reject};
pub use revision::TreeRevision;
pub use transaction::{Transaction, TransactionKind, TransactionResult};
pub use tree::{PendingCommit, SignalTree, TreeGuard, TreeType};
pub use usage::{
    Canceler, CombinedUsage, NodeUsage, Scope, TransientListener, Usage, UsageTracker,
};

/// Returns the crate version at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
