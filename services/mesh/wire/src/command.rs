//! Typed command variants carried inside an envelope.
//!
//! Each envelope key names exactly one command. The set is closed: keys
//! outside it fail with [`WireError::UnknownCommand`] instead of reaching
//! any handler.

use crate::WireError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A listening address as it travels on the wire: `[host, port]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr(pub String, pub u16);

impl PeerAddr {
    /// Create a new address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self(host.into(), port)
    }

    /// Host part
    pub fn host(&self) -> &str {
        &self.0
    }

    /// Port part
    pub fn port(&self) -> u16 {
        self.1
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.contains(':') {
            write!(f, "[{}]:{}", self.0, self.1)
        } else {
            write!(f, "{}:{}", self.0, self.1)
        }
    }
}

impl std::str::FromStr for PeerAddr {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || WireError::BadArgument {
            key: "address".to_string(),
            reason: format!("expected host:port, got {:?}", s),
        };
        let (host, port) = s.rsplit_once(':').ok_or_else(bad)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(bad());
        }
        let port = port.parse::<u16>().map_err(|_| bad())?;
        Ok(Self::new(host, port))
    }
}

/// Command names, one per envelope key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Host accepts or rejects a join attempt
    Conn,
    /// Joiner announces its own listening address
    Address,
    /// Host announces the room's membership cap
    Limit,
    /// Admin tells members to dial a newcomer
    NewPeer,
    /// Propose or announce a display name
    Nickname,
    /// Chat message
    Text,
    /// Farewell message, then disconnect
    Leave,
    /// Ask the receiver to display an error code
    DisplayError,
}

impl CommandKind {
    /// Every command, in wire-table order
    pub const ALL: [CommandKind; 8] = [
        CommandKind::Conn,
        CommandKind::Address,
        CommandKind::Limit,
        CommandKind::NewPeer,
        CommandKind::Nickname,
        CommandKind::Text,
        CommandKind::Leave,
        CommandKind::DisplayError,
    ];

    /// Envelope key for this command
    pub fn key(self) -> &'static str {
        match self {
            CommandKind::Conn => "conn",
            CommandKind::Address => "address",
            CommandKind::Limit => "limit",
            CommandKind::NewPeer => "new_peer",
            CommandKind::Nickname => "nickname",
            CommandKind::Text => "text",
            CommandKind::Leave => "leave",
            CommandKind::DisplayError => "display_error",
        }
    }

    /// Look a command up by envelope key
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.key() == key)
    }

    /// Whether this command only makes sense during the bootstrap exchange
    pub fn is_bootstrap(self) -> bool {
        matches!(
            self,
            CommandKind::Conn | CommandKind::Address | CommandKind::Limit
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A single typed command with its argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `conn`: join accepted (`true`) or refused (`false`)
    Conn(bool),
    /// `address`: joiner's listening address
    Address(PeerAddr),
    /// `limit`: membership cap, 0 means unlimited
    Limit(u32),
    /// `new_peer`: address the receiver should dial
    NewPeer(PeerAddr),
    /// `nickname`: display name
    Nickname(String),
    /// `text`: chat message
    Text(String),
    /// `leave`: farewell message
    Leave(String),
    /// `display_error`: display code
    DisplayError(u16),
}

impl Command {
    /// Kind of this command
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Conn(_) => CommandKind::Conn,
            Command::Address(_) => CommandKind::Address,
            Command::Limit(_) => CommandKind::Limit,
            Command::NewPeer(_) => CommandKind::NewPeer,
            Command::Nickname(_) => CommandKind::Nickname,
            Command::Text(_) => CommandKind::Text,
            Command::Leave(_) => CommandKind::Leave,
            Command::DisplayError(_) => CommandKind::DisplayError,
        }
    }

    /// Argument as a JSON value
    pub fn to_value(&self) -> Value {
        match self {
            Command::Conn(accepted) => Value::Bool(*accepted),
            Command::Address(addr) | Command::NewPeer(addr) => {
                Value::Array(vec![Value::from(addr.0.clone()), Value::from(addr.1)])
            }
            Command::Limit(limit) => Value::from(*limit),
            Command::Nickname(s) | Command::Text(s) | Command::Leave(s) => Value::from(s.clone()),
            Command::DisplayError(code) => Value::from(*code),
        }
    }

    /// Parse one envelope entry into a typed command
    pub fn parse(key: &str, value: &Value) -> Result<Self, WireError> {
        let kind =
            CommandKind::from_key(key).ok_or_else(|| WireError::UnknownCommand(key.to_string()))?;
        Self::parse_kind(kind, value)
    }

    /// Parse an argument for a known command kind
    pub fn parse_kind(kind: CommandKind, value: &Value) -> Result<Self, WireError> {
        let bad = |reason: &str| WireError::BadArgument {
            key: kind.key().to_string(),
            reason: reason.to_string(),
        };

        match kind {
            CommandKind::Conn => value
                .as_bool()
                .map(Command::Conn)
                .ok_or_else(|| bad("expected boolean")),
            CommandKind::Limit => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Command::Limit)
                .ok_or_else(|| bad("expected non-negative integer")),
            CommandKind::DisplayError => value
                .as_u64()
                .and_then(|n| u16::try_from(n).ok())
                .map(Command::DisplayError)
                .ok_or_else(|| bad("expected error code")),
            CommandKind::Address | CommandKind::NewPeer => {
                let addr: PeerAddr = serde_json::from_value(value.clone())
                    .map_err(|_| bad("expected [host, port]"))?;
                Ok(if kind == CommandKind::Address {
                    Command::Address(addr)
                } else {
                    Command::NewPeer(addr)
                })
            }
            CommandKind::Nickname | CommandKind::Text | CommandKind::Leave => {
                let s = value
                    .as_str()
                    .ok_or_else(|| bad("expected string"))?
                    .to_string();
                Ok(match kind {
                    CommandKind::Nickname => Command::Nickname(s),
                    CommandKind::Text => Command::Text(s),
                    _ => Command::Leave(s),
                })
            }
        }
    }
}
