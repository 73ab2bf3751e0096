//! Envelope type and its JSON encoding.
//!
//! An envelope is a flat JSON object mapping command keys to arguments.
//! Several commands may share one envelope; receivers must not depend on
//! their relative order.

use crate::command::{Command, CommandKind};
use crate::WireError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One wire message: command key to argument
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope {
    entries: BTreeMap<String, Value>,
}

impl Envelope {
    /// Create an empty envelope
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Envelope::insert`]
    pub fn with(mut self, command: Command) -> Self {
        self.insert(command);
        self
    }

    /// Insert a typed command, replacing any argument already under its key
    pub fn insert(&mut self, command: Command) {
        self.entries
            .insert(command.kind().key().to_string(), command.to_value());
    }

    /// Insert a raw entry without validating the key
    pub fn insert_raw(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Whether a command of this kind is present
    pub fn contains(&self, kind: CommandKind) -> bool {
        self.entries.contains_key(kind.key())
    }

    /// Typed argument for one command kind, if present
    pub fn get(&self, kind: CommandKind) -> Option<Result<Command, WireError>> {
        self.entries
            .get(kind.key())
            .map(|value| Command::parse_kind(kind, value))
    }

    /// Remove a command and return its typed argument
    pub fn take(&mut self, kind: CommandKind) -> Option<Result<Command, WireError>> {
        self.entries
            .remove(kind.key())
            .map(|value| Command::parse_kind(kind, &value))
    }

    /// Raw entries
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of commands carried
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the envelope carries nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl From<Command> for Envelope {
    fn from(command: Command) -> Self {
        Envelope::new().with(command)
    }
}

impl FromIterator<Command> for Envelope {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        let mut envelope = Envelope::new();
        for command in iter {
            envelope.insert(command);
        }
        envelope
    }
}

/// Encode an envelope as UTF-8 JSON
pub fn encode(envelope: &Envelope) -> Result<Bytes, WireError> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(|e| WireError::Encode(e.to_string()))
}

/// Decode an envelope; anything but a JSON object is malformed
pub fn decode(bytes: &[u8]) -> Result<Envelope, WireError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| WireError::MalformedEnvelope(e.to_string()))?;

    match value {
        Value::Object(map) => Ok(Envelope {
            entries: map.into_iter().collect(),
        }),
        other => Err(WireError::MalformedEnvelope(format!(
            "expected object, got {}",
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::PeerAddr;

    #[test]
    fn test_envelope_roundtrip_mixed_values() {
        let envelope = Envelope::new()
            .with(Command::Conn(true))
            .with(Command::Limit(2))
            .with(Command::NewPeer(PeerAddr::new("127.0.0.1", 4402)))
            .with(Command::Text("olá, mundo".to_string()));

        let bytes = encode(&envelope).unwrap();
        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.len(), 4);
        assert_eq!(
            decoded.get(CommandKind::Limit).unwrap().unwrap(),
            Command::Limit(2)
        );
    }

    #[test]
    fn test_wire_shape_is_flat_object() {
        let envelope = Envelope::from(Command::Address(PeerAddr::new("localhost", 4400)));
        let bytes = encode(&envelope).unwrap();
        assert_eq!(&bytes[..], br#"{"address":["localhost",4400]}"#);
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert!(matches!(
            decode(b"[1, 2]"),
            Err(WireError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode(b"{\"text\": "),
            Err(WireError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode(&[0xff, 0xfe]),
            Err(WireError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_unknown_keys_survive_decoding() {
        let envelope = decode(br#"{"shout": "hey", "text": "hi"}"#).unwrap();
        let keys: Vec<_> = envelope.entries().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["shout", "text"]);
    }

    #[test]
    fn test_take_removes_entry() {
        let mut envelope: Envelope = [Command::Conn(false), Command::Text("x".into())]
            .into_iter()
            .collect();
        assert_eq!(
            envelope.take(CommandKind::Conn).unwrap().unwrap(),
            Command::Conn(false)
        );
        assert!(!envelope.contains(CommandKind::Conn));
        assert!(envelope.contains(CommandKind::Text));
    }
}
