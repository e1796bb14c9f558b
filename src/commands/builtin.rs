//! Built-in Command Handlers
//!
//! - `bind <URI> <NEW_URI>`: rename the issuer's stream
//! - `event-subscribe <URI> [exclusive]`: subscribe to interaction events
//! - `size-hint-update <URI> <minW> <minH> <maxW> <maxH> <prefW> <prefH>`
//! - `close <URI>`: close a stream
//!
//! `focus` and `web` are left to the compositor.

use crate::commands::handler::{CommandHandler, Handler};
use crate::commands::types::{Command, CommandError, CommandOrigin, CommandType};
use crate::dispatcher::FrameDispatcher;
use crate::notify::{Notification, Notifier};
use crate::protocol::{Message, SizeHints};
use crate::registry::{Outbound, RegistryError, StreamRegistry, SubscriptionRefusal};
use std::sync::Arc;
use tracing::{debug, info};

fn expect_args(command: &Command, count: usize) -> Result<(), CommandError> {
    if command.args.len() != count {
        return Err(CommandError::Malformed(format!(
            "{} expects {} arguments, got {}",
            command.command_type,
            count,
            command.args.len()
        )));
    }
    Ok(())
}

/// Renames the issuer's stream.
///
/// An undelivered frame moves with the stream and is announced again under
/// the new URI.
pub struct BindHandler {
    registry: Arc<StreamRegistry>,
    notifier: Arc<Notifier>,
}

impl BindHandler {
    pub fn new(registry: Arc<StreamRegistry>, notifier: Arc<Notifier>) -> Self {
        Self { registry, notifier }
    }
}

impl Handler for BindHandler {
    fn handle(&self, command: &Command, origin: &CommandOrigin) -> Result<(), CommandError> {
        expect_args(command, 1)?;
        let new_uri = &command.args[0];

        self.registry.rename(&command.uri, new_uri, origin.connection)?;

        let waiting = self
            .registry
            .find(new_uri)
            .map(|entry| entry.lock().unwrap().has_latest_frame())
            .unwrap_or(false);
        if waiting {
            self.notifier.notify(Notification::FrameReady {
                uri: new_uri.clone(),
            });
        }
        Ok(())
    }
}

/// Adds the issuer to a stream's event subscribers.
///
/// The outcome is echoed to the issuer and reported to the compositor,
/// whether or not the subscription was accepted.
pub struct EventSubscribeHandler {
    registry: Arc<StreamRegistry>,
    notifier: Arc<Notifier>,
}

impl EventSubscribeHandler {
    pub fn new(registry: Arc<StreamRegistry>, notifier: Arc<Notifier>) -> Self {
        Self { registry, notifier }
    }
}

impl Handler for EventSubscribeHandler {
    fn handle(&self, command: &Command, origin: &CommandOrigin) -> Result<(), CommandError> {
        let exclusive = match command.args.as_slice() {
            [] => false,
            [flag] if flag == "exclusive" => true,
            _ => {
                return Err(CommandError::Malformed(format!(
                    "unexpected event-subscribe arguments: {}",
                    command.args.join(" ")
                )))
            }
        };

        let entry = self
            .registry
            .find(&command.uri)
            .ok_or_else(|| RegistryError::NotFound(command.uri.clone()))?;

        let result = {
            let mut locked = entry.lock().unwrap();
            let result = locked.subscribe(origin.connection, exclusive);
            locked.send_to(
                origin.connection,
                Outbound::Message(Message::EventRegistrationReply {
                    uri: command.uri.clone(),
                    success: result.is_ok(),
                }),
            );
            result
        };

        self.notifier.notify(Notification::EventSubscription {
            uri: command.uri.clone(),
            success: result.is_ok(),
        });

        match result {
            Ok(()) => {
                info!(
                    uri = %command.uri,
                    subscriber = %origin.connection,
                    exclusive,
                    "Event subscription accepted"
                );
                Ok(())
            }
            Err(SubscriptionRefusal::NotAttached) => Err(RegistryError::NotAttached {
                uri: command.uri.clone(),
                connection: origin.connection,
            }
            .into()),
            Err(SubscriptionRefusal::Exclusive) => {
                Err(RegistryError::ExclusiveSubscription(command.uri.clone()).into())
            }
        }
    }
}

/// Records the producer's size hints.
pub struct SizeHintsHandler {
    registry: Arc<StreamRegistry>,
    notifier: Arc<Notifier>,
}

impl SizeHintsHandler {
    pub fn new(registry: Arc<StreamRegistry>, notifier: Arc<Notifier>) -> Self {
        Self { registry, notifier }
    }
}

fn parse_hints(args: &[String]) -> Result<SizeHints, CommandError> {
    let mut values = [0u32; 6];
    for (value, arg) in values.iter_mut().zip(args) {
        *value = arg
            .parse()
            .map_err(|_| CommandError::Malformed(format!("invalid size hint: {}", arg)))?;
    }
    Ok(SizeHints::from_array(values))
}

impl Handler for SizeHintsHandler {
    fn handle(&self, command: &Command, origin: &CommandOrigin) -> Result<(), CommandError> {
        expect_args(command, 6)?;
        let hints = parse_hints(&command.args)?;

        let entry = self
            .registry
            .find(&command.uri)
            .ok_or_else(|| RegistryError::NotFound(command.uri.clone()))?;

        {
            let mut locked = entry.lock().unwrap();
            if !locked.is_owned_by(origin.connection) {
                return Err(RegistryError::NotOwner {
                    uri: command.uri.clone(),
                    connection: origin.connection,
                }
                .into());
            }
            locked.set_size_hints(hints);
        }

        debug!(uri = %command.uri, ?hints, "Size hints updated");
        self.notifier.notify(Notification::SizeHintsChanged {
            uri: command.uri.clone(),
            hints,
        });
        Ok(())
    }
}

/// Closes a stream on behalf of its producer or the compositor.
pub struct CloseHandler {
    registry: Arc<StreamRegistry>,
    dispatcher: Arc<FrameDispatcher>,
}

impl CloseHandler {
    pub fn new(registry: Arc<StreamRegistry>, dispatcher: Arc<FrameDispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }
}

impl Handler for CloseHandler {
    fn handle(&self, command: &Command, origin: &CommandOrigin) -> Result<(), CommandError> {
        expect_args(command, 0)?;

        if origin.connection.is_local() {
            if self.dispatcher.close_stream(&command.uri) {
                return Ok(());
            }
            return Err(RegistryError::NotFound(command.uri.clone()).into());
        }

        if self.dispatcher.close_owned_stream(&command.uri, origin.connection) {
            return Ok(());
        }

        if self.registry.find(&command.uri).is_none() {
            return Err(RegistryError::NotFound(command.uri.clone()).into());
        }
        Err(RegistryError::NotOwner {
            uri: command.uri.clone(),
            connection: origin.connection,
        }
        .into())
    }
}

/// Installs the built-in handlers.
pub fn register_builtin_handlers(
    commands: &CommandHandler,
    registry: &Arc<StreamRegistry>,
    dispatcher: &Arc<FrameDispatcher>,
    notifier: &Arc<Notifier>,
) {
    commands.register_command_handler(
        CommandType::Bind,
        BindHandler::new(Arc::clone(registry), Arc::clone(notifier)),
    );
    commands.register_command_handler(
        CommandType::EventSubscribe,
        EventSubscribeHandler::new(Arc::clone(registry), Arc::clone(notifier)),
    );
    commands.register_command_handler(
        CommandType::SizeHintUpdate,
        SizeHintsHandler::new(Arc::clone(registry), Arc::clone(notifier)),
    );
    commands.register_command_handler(
        CommandType::Close,
        CloseHandler::new(Arc::clone(registry), Arc::clone(dispatcher)),
    );
}
