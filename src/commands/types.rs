//! Command Grammar
//!
//! Commands are single text lines: `<TYPE> <URI> [<ARGS...>]`, tokens
//! separated by ASCII whitespace. The type token selects the handler; the
//! URI names the stream the command applies to.

use crate::registry::{ConnectionId, RegistryError};
use std::fmt;
use thiserror::Error;

/// The kinds of command the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandType {
    /// Rename the issuing producer's stream.
    Bind,
    /// Ask the compositor to focus a stream's window.
    Focus,
    /// Subscribe to interaction events, optionally exclusively.
    EventSubscribe,
    /// Declare new size hints.
    SizeHintUpdate,
    /// Close a stream.
    Close,
    /// Ask the compositor to open a web page.
    Web,
}

impl CommandType {
    pub const ALL: [CommandType; 6] = [
        CommandType::Bind,
        CommandType::Focus,
        CommandType::EventSubscribe,
        CommandType::SizeHintUpdate,
        CommandType::Close,
        CommandType::Web,
    ];

    pub fn token(self) -> &'static str {
        match self {
            CommandType::Bind => "bind",
            CommandType::Focus => "focus",
            CommandType::EventSubscribe => "event-subscribe",
            CommandType::SizeHintUpdate => "size-hint-update",
            CommandType::Close => "close",
            CommandType::Web => "web",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.token() == token)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command_type: CommandType,
    pub uri: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new(command_type: CommandType, uri: impl Into<String>) -> Self {
        Self {
            command_type,
            uri: uri.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Parses a command line.
    ///
    /// # Example
    ///
    /// ```
    /// use pixelrelay::commands::{Command, CommandType};
    ///
    /// let cmd = Command::parse("event-subscribe wall/demo exclusive").unwrap();
    /// assert_eq!(cmd.command_type, CommandType::EventSubscribe);
    /// assert_eq!(cmd.uri, "wall/demo");
    /// assert_eq!(cmd.args, vec!["exclusive".to_string()]);
    /// ```
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut tokens = line.split_ascii_whitespace();

        let token = tokens
            .next()
            .ok_or_else(|| CommandError::Malformed("empty command".to_string()))?;

        let command_type = CommandType::from_token(token)
            .ok_or_else(|| CommandError::UnknownCommandType(token.to_string()))?;

        let uri = tokens
            .next()
            .ok_or_else(|| CommandError::Malformed(format!("{} requires a stream uri", token)))?;

        Ok(Self {
            command_type,
            uri: uri.to_string(),
            args: tokens.map(str::to_string).collect(),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.command_type, self.uri)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Who issued a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOrigin {
    /// The stream the issuing connection is bound to.
    pub source_uri: String,
    /// The issuing connection, or `ConnectionId::LOCAL` for the compositor.
    pub connection: ConnectionId,
}

impl CommandOrigin {
    pub fn new(source_uri: impl Into<String>, connection: ConnectionId) -> Self {
        Self {
            source_uri: source_uri.into(),
            connection,
        }
    }

    /// An origin for commands issued in-process.
    pub fn local(source_uri: impl Into<String>) -> Self {
        Self::new(source_uri, ConnectionId::LOCAL)
    }
}

/// Errors raised while processing a command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The type token is unknown or has no registered handler
    #[error("unknown command type: {0}")]
    UnknownCommandType(String),

    /// The command line or its arguments could not be parsed
    #[error("malformed command: {0}")]
    Malformed(String),

    /// The handler's registry operation failed
    #[error(transparent)]
    Registry(#[from] RegistryError),
}
