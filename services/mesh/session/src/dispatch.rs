//! Routes each key of a decoded envelope to a typed session handler.
//!
//! The route table is built once, when the session starts. Every key of an
//! envelope is dispatched on its own, so a bad key never stops its
//! neighbours from being handled.

use crate::peer::PeerId;
use mesh_wire::{Command, CommandKind, Envelope, PeerAddr, WireError};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Steady-state command handlers
pub trait CommandHandler {
    /// `text`: show a chat message
    fn on_text(&mut self, sender: PeerId, text: String);
    /// `nickname`: rename the sender if the name is free
    fn on_nickname(&mut self, sender: PeerId, nickname: String);
    /// `leave`: show the farewell and drop the sender
    fn on_leave(&mut self, sender: PeerId, farewell: String);
    /// `new_peer`: dial the announced address
    fn on_new_peer(&mut self, sender: PeerId, addr: PeerAddr);
    /// `display_error`: show the text for a display code
    fn on_display_error(&mut self, sender: PeerId, code: u16);
}

/// Recoverable dispatch failures
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Key names no command
    #[error("unknown command `{0}`")]
    UnknownCommand(String),

    /// Argument had the wrong shape
    #[error(transparent)]
    BadArgument(WireError),

    /// Bootstrap-only command received after bootstrap
    #[error("`{0}` is only valid during bootstrap")]
    OutOfPhase(CommandKind),
}

type Route<H> = fn(&mut H, PeerId, Command);

/// Command-name to handler table
pub struct Dispatcher<H> {
    routes: HashMap<&'static str, (CommandKind, Route<H>)>,
}

impl<H: CommandHandler> Dispatcher<H> {
    /// Build the route table
    pub fn new() -> Self {
        let mut dispatcher = Self {
            routes: HashMap::new(),
        };

        dispatcher.route(CommandKind::Text, |h, sender, cmd| {
            if let Command::Text(text) = cmd {
                h.on_text(sender, text);
            }
        });
        dispatcher.route(CommandKind::Nickname, |h, sender, cmd| {
            if let Command::Nickname(name) = cmd {
                h.on_nickname(sender, name);
            }
        });
        dispatcher.route(CommandKind::Leave, |h, sender, cmd| {
            if let Command::Leave(farewell) = cmd {
                h.on_leave(sender, farewell);
            }
        });
        dispatcher.route(CommandKind::NewPeer, |h, sender, cmd| {
            if let Command::NewPeer(addr) = cmd {
                h.on_new_peer(sender, addr);
            }
        });
        dispatcher.route(CommandKind::DisplayError, |h, sender, cmd| {
            if let Command::DisplayError(code) = cmd {
                h.on_display_error(sender, code);
            }
        });

        dispatcher
    }

    fn route(&mut self, kind: CommandKind, handler: Route<H>) {
        self.routes.insert(kind.key(), (kind, handler));
    }

    /// Dispatch a single envelope entry
    pub fn dispatch(
        &self,
        handler: &mut H,
        sender: PeerId,
        key: &str,
        value: &Value,
    ) -> Result<CommandKind, DispatchError> {
        let Some((kind, route)) = self.routes.get(key) else {
            return Err(match CommandKind::from_key(key) {
                Some(kind) if kind.is_bootstrap() => DispatchError::OutOfPhase(kind),
                _ => DispatchError::UnknownCommand(key.to_string()),
            });
        };

        let command = Command::parse_kind(*kind, value).map_err(DispatchError::BadArgument)?;
        route(handler, sender, command);
        Ok(*kind)
    }

    /// Dispatch every entry of an envelope, collecting the failures
    ///
    /// `leave` runs last, after the sender's other commands in the same envelope.
    pub fn dispatch_envelope(
        &self,
        handler: &mut H,
        sender: PeerId,
        envelope: &Envelope,
    ) -> Vec<DispatchError> {
        let (leave, rest): (Vec<_>, Vec<_>) = envelope
            .entries()
            .partition(|(key, _)| *key == CommandKind::Leave.key());

        rest.into_iter()
            .chain(leave)
            .filter_map(|(key, value)| self.dispatch(handler, sender, key, value).err())
            .collect()
    }
}

impl<H: CommandHandler> Default for Dispatcher<H> {
    fn default() -> Self {
        Self::new()
    }
}
