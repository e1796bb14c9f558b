//! Command Dispatch
//!
//! `CommandHandler` owns at most one handler per `CommandType` and routes
//! parsed command lines to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │   parse()   │───>│   lookup    │───>│  handle()   │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! │                                               │             │
//! │                                               ▼             │
//! │                                  StreamRegistry / Notifier  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Handlers run synchronously on the caller's task and must not block.
//! The handler table lock is released before a handler runs, so a handler
//! may itself register or unregister handlers.

use crate::commands::types::{Command, CommandError, CommandOrigin, CommandType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, trace, warn};

/// A handler for one command type.
pub trait Handler: Send + Sync {
    /// Consumes a command issued for `command.uri` by `origin`.
    fn handle(&self, command: &Command, origin: &CommandOrigin) -> Result<(), CommandError>;
}

impl<F> Handler for F
where
    F: Fn(&Command, &CommandOrigin) -> Result<(), CommandError> + Send + Sync,
{
    fn handle(&self, command: &Command, origin: &CommandOrigin) -> Result<(), CommandError> {
        self(command, origin)
    }
}

/// Command statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandStats {
    /// Commands a handler accepted.
    pub processed: u64,
    /// Commands with an unknown type or no registered handler.
    pub unknown: u64,
    /// Commands that failed to parse.
    pub malformed: u64,
    /// Commands a handler rejected.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    unknown: AtomicU64,
    malformed: AtomicU64,
    failed: AtomicU64,
}

/// Routes command lines to the handler registered for their type.
#[derive(Default)]
pub struct CommandHandler {
    handlers: RwLock<HashMap<CommandType, Arc<dyn Handler>>>,
    counters: Counters,
}

impl std::fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("registered", &self.registered_types())
            .finish()
    }
}

impl CommandHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler` for `command_type`.
    ///
    /// Returns true if it replaced a previously registered handler.
    pub fn register_command_handler(
        &self,
        command_type: CommandType,
        handler: impl Handler + 'static,
    ) -> bool {
        let replaced = self
            .handlers
            .write()
            .unwrap()
            .insert(command_type, Arc::new(handler))
            .is_some();

        info!(command = %command_type, replaced, "Registered command handler");
        replaced
    }

    /// Removes the handler for `command_type`, if any.
    pub fn unregister_command_handler(
        &self,
        command_type: CommandType,
    ) -> Option<Arc<dyn Handler>> {
        let removed = self.handlers.write().unwrap().remove(&command_type);
        if removed.is_some() {
            info!(command = %command_type, "Unregistered command handler");
        }
        removed
    }

    pub fn has_handler(&self, command_type: CommandType) -> bool {
        self.handlers.read().unwrap().contains_key(&command_type)
    }

    /// Command types with a registered handler, sorted.
    pub fn registered_types(&self) -> Vec<CommandType> {
        let mut types: Vec<_> = self.handlers.read().unwrap().keys().copied().collect();
        types.sort();
        types
    }

    /// Parses `line` and runs the matching handler, returning its result.
    pub fn try_process(&self, line: &str, origin: &CommandOrigin) -> Result<(), CommandError> {
        let command = Command::parse(line)?;

        let handler = self
            .handlers
            .read()
            .unwrap()
            .get(&command.command_type)
            .cloned()
            .ok_or_else(|| CommandError::UnknownCommandType(command.command_type.to_string()))?;

        trace!(command = %command, origin = %origin.connection, "Dispatching command");
        handler.handle(&command, origin)
    }

    /// Processes a command line, logging failures instead of returning them.
    ///
    /// A failed command never affects the issuing connection.
    pub fn process(&self, line: &str, origin: &CommandOrigin) {
        match self.try_process(line, origin) {
            Ok(()) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                debug!(command = %line.trim(), origin = %origin.connection, "Command processed");
            }
            Err(e @ CommandError::UnknownCommandType(_)) => {
                self.counters.unknown.fetch_add(1, Ordering::Relaxed);
                warn!(
                    command = %line.trim(),
                    source = %origin.source_uri,
                    error = %e,
                    "Dropped command"
                );
            }
            Err(e @ CommandError::Malformed(_)) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    command = %line.trim(),
                    source = %origin.source_uri,
                    error = %e,
                    "Dropped command"
                );
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    command = %line.trim(),
                    source = %origin.source_uri,
                    error = %e,
                    "Command failed"
                );
            }
        }
    }

    pub fn stats(&self) -> CommandStats {
        CommandStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            unknown: self.counters.unknown.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn counting_handler() -> (Arc<AtomicUsize>, impl Handler) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler = move |_: &Command, _: &CommandOrigin| -> Result<(), CommandError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        (calls, handler)
    }

    #[test]
    fn test_registered_handler_invoked_once() {
        let commands = CommandHandler::new();
        let (calls, handler) = counting_handler();
        commands.register_command_handler(CommandType::Focus, handler);

        commands.process("focus wall/demo", &CommandOrigin::local("wall/demo"));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(commands.stats().processed, 1);
    }

    #[test]
    fn test_unregistered_type_is_unknown() {
        let commands = CommandHandler::new();
        let (calls, handler) = counting_handler();
        commands.register_command_handler(CommandType::Focus, handler);
        assert!(commands.unregister_command_handler(CommandType::Focus).is_some());

        let origin = CommandOrigin::local("s");
        assert_eq!(
            commands.try_process("focus s", &origin),
            Err(CommandError::UnknownCommandType("focus".to_string()))
        );
        commands.process("focus s", &origin);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(commands.stats().unknown, 1);
        assert!(commands.unregister_command_handler(CommandType::Focus).is_none());
    }

    #[test]
    fn test_register_replaces_existing() {
        let commands = CommandHandler::new();
        let (first_calls, first) = counting_handler();
        let (second_calls, second) = counting_handler();

        assert!(!commands.register_command_handler(CommandType::Web, first));
        assert!(commands.register_command_handler(CommandType::Web, second));

        commands.process("web s http://example.com", &CommandOrigin::local("s"));

        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
        assert_eq!(commands.registered_types(), vec![CommandType::Web]);
    }

    #[test]
    fn test_handler_receives_command_and_origin() {
        let commands = CommandHandler::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);

        commands.register_command_handler(
            CommandType::Web,
            move |command: &Command, origin: &CommandOrigin| -> Result<(), CommandError> {
                *sink.lock().unwrap() = Some((command.clone(), origin.clone()));
                Ok(())
            },
        );

        let origin = CommandOrigin::new("wall/demo", crate::registry::ConnectionId::new(4));
        commands.process("web wall/demo https://example.org", &origin);

        let (command, received) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(command.args, vec!["https://example.org".to_string()]);
        assert_eq!(received, origin);
    }

    #[test]
    fn test_failures_are_counted_not_propagated() {
        let commands = CommandHandler::new();
        commands.register_command_handler(
            CommandType::Close,
            |command: &Command, _: &CommandOrigin| -> Result<(), CommandError> {
                Err(CommandError::Registry(RegistryError::NotFound(
                    command.uri.clone(),
                )))
            },
        );

        let origin = CommandOrigin::local("s");
        commands.process("close s", &origin);
        commands.process("", &origin);
        commands.process("nonsense s", &origin);

        let stats = commands.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.unknown, 1);
        assert_eq!(stats.processed, 0);
    }

    #[test]
    fn test_handler_may_reenter() {
        let commands = Arc::new(CommandHandler::new());
        let inner = Arc::clone(&commands);

        commands.register_command_handler(
            CommandType::Focus,
            move |_: &Command, _: &CommandOrigin| -> Result<(), CommandError> {
                inner.unregister_command_handler(CommandType::Focus);
                Ok(())
            },
        );

        commands.process("focus s", &CommandOrigin::local("s"));
        assert!(!commands.has_handler(CommandType::Focus));
    }
}
