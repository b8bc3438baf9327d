//! A command batch paired with per-command result handlers.

use crate::command::SignalCommand;
use crate::id::Id;
use crate::result::CommandResult;
use std::collections::HashMap;

/// Callback resolved with the final result of one command.
pub type ResultHandler = Box<dyn FnOnce(&CommandResult) + Send>;

/// An ordered list of commands together with the handlers waiting for their
/// results. Handlers are keyed by command id, including ids of sub-commands
/// nested inside transactions. For a synchronous tree the handlers resolve at
/// publish time; for an asynchronous tree the whole structure sits in the
/// unconfirmed queue until the commands come back from the confirmation log.
#[derive(Default)]
pub struct CommandsAndHandlers {
    commands: Vec<SignalCommand>,
    handlers: HashMap<Id, ResultHandler>,
}

impl std::fmt::Debug for CommandsAndHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandsAndHandlers")
            .field("commands", &self.commands)
            .field("handlers", &self.handlers.keys())
            .finish()
    }
}

impl CommandsAndHandlers {
    pub fn new() -> CommandsAndHandlers {
        CommandsAndHandlers::default()
    }

    pub fn with_handlers(
        commands: Vec<SignalCommand>,
        handlers: HashMap<Id, ResultHandler>,
    ) -> CommandsAndHandlers {
        CommandsAndHandlers { commands, handlers }
    }

    pub fn single(command: SignalCommand, handler: Option<ResultHandler>) -> CommandsAndHandlers {
        let mut handlers = HashMap::new();
        if let Some(handler) = handler {
            handlers.insert(command.command_id(), handler);
        }
        CommandsAndHandlers {
            commands: vec![command],
            handlers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[SignalCommand] {
        &self.commands
    }

    /// Splits the batch into its commands and handlers.
    pub fn into_parts(self) -> (Vec<SignalCommand>, HashMap<Id, ResultHandler>) {
        (self.commands, self.handlers)
    }

    /// Appends another batch, keeping command order.
    pub fn add(&mut self, other: CommandsAndHandlers) {
        self.commands.extend(other.commands);
        self.handlers.extend(other.handlers);
    }

    /// Resolves and removes the handlers of all commands (including
    /// transaction sub-commands) that have a result in the given map.
    pub fn notify_result_handlers(&mut self, results: &HashMap<Id, CommandResult>) {
        Self::notify(&mut self.handlers, &self.commands, results);
    }

    fn notify(
        handlers: &mut HashMap<Id, ResultHandler>,
        commands: &[SignalCommand],
        results: &HashMap<Id, CommandResult>,
    ) {
        for command in commands {
            if let SignalCommand::Transaction { commands, .. } = command {
                Self::notify(handlers, commands, results);
            }
            if let Some(result) = results.get(&command.command_id()) {
                if let Some(handler) = handlers.remove(&command.command_id()) {
                    handler(result);
                }
            }
        }
    }

    /// Drops the commands that have a result and resolves their handlers.
    /// Used when an asynchronous tree receives confirmations that cover parts
    /// of the unconfirmed queue.
    pub fn remove_handled_commands(&mut self, results: &HashMap<Id, CommandResult>) {
        let (handled, remaining): (Vec<_>, Vec<_>) = std::mem::take(&mut self.commands)
            .into_iter()
            .partition(|command| results.contains_key(&command.command_id()));
        self.commands = remaining;
        Self::notify(&mut self.handlers, &handled, results);
    }
}
