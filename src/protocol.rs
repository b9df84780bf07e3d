//! Wire protocol: the `{Message, MessageType}` envelope and its payloads

use crate::error::ProtocolError;
use crate::ledger::Block;
use crate::types::{MedicalRecord, Record};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message types for inter-node communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// A joiner announces its address to the bootstrap node
    NewHost,
    /// Current membership snapshot
    AddHost,
    /// A single block to append
    AddBlock,
    /// Request for the sender's whole chain
    NewBlock,
    /// A whole chain that replaces the receiver's
    SetBlocks,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::NewHost,
        MessageType::AddHost,
        MessageType::AddBlock,
        MessageType::NewBlock,
        MessageType::SetBlocks,
    ];

    /// Numeric code used on the wire
    pub fn code(self) -> u8 {
        match self {
            MessageType::NewHost => 0,
            MessageType::AddHost => 1,
            MessageType::AddBlock => 2,
            MessageType::NewBlock => 3,
            MessageType::SetBlocks => 4,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| u64::from(t.code()) == code)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.to_string() == name)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::NewHost => write!(f, "NEW_HOST"),
            MessageType::AddHost => write!(f, "ADD_HOST"),
            MessageType::AddBlock => write!(f, "ADD_BLOCK"),
            MessageType::NewBlock => write!(f, "NEW_BLOCK"),
            MessageType::SetBlocks => write!(f, "SET_BLOCKS"),
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{Error, Unexpected, Visitor};

        struct MessageTypeVisitor;

        impl<'de> Visitor<'de> for MessageTypeVisitor {
            type Value = MessageType;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a message type code (0-4) or name")
            }

            fn visit_u64<E>(self, value: u64) -> std::result::Result<MessageType, E>
            where
                E: Error,
            {
                MessageType::from_code(value)
                    .ok_or_else(|| E::invalid_value(Unexpected::Unsigned(value), &self))
            }

            fn visit_i64<E>(self, value: i64) -> std::result::Result<MessageType, E>
            where
                E: Error,
            {
                u64::try_from(value)
                    .ok()
                    .and_then(MessageType::from_code)
                    .ok_or_else(|| E::invalid_value(Unexpected::Signed(value), &self))
            }

            fn visit_str<E>(self, value: &str) -> std::result::Result<MessageType, E>
            where
                E: Error,
            {
                MessageType::from_name(value)
                    .ok_or_else(|| E::invalid_value(Unexpected::Str(value), &self))
            }
        }

        deserializer.deserialize_any(MessageTypeVisitor)
    }
}

/// The single shape every request takes on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "MessageType")]
    pub message_type: MessageType,
}

impl Envelope {
    pub fn new(message_type: MessageType, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            message_type,
        }
    }

    /// Serialize to one JSON line, without the trailing newline
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::InvalidEnvelope)
    }

    /// Parse one received line
    pub fn from_json(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }
        serde_json::from_str(line).map_err(|e| {
            if e.is_data() && line.contains("MessageType") {
                classify_type_error(line).unwrap_or(ProtocolError::InvalidEnvelope(e))
            } else {
                ProtocolError::InvalidEnvelope(e)
            }
        })
    }
}

/// Report an out-of-range type code as such instead of a generic decode error
fn classify_type_error(line: &str) -> Option<ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let raw = value.get("MessageType")?;
    let known = match raw {
        serde_json::Value::Number(n) => n.as_u64().and_then(MessageType::from_code).is_some(),
        serde_json::Value::String(s) => MessageType::from_name(s).is_some(),
        _ => return None,
    };
    (!known).then(|| ProtocolError::UnknownMessageType(raw.to_string()))
}

/// A decoded envelope with its payload parsed
#[derive(Debug, Clone, PartialEq)]
pub enum Message<R = MedicalRecord> {
    NewHost { address: String },
    AddHost { peers: Vec<String> },
    AddBlock { block: Block<R> },
    NewBlock { requester: String },
    SetBlocks { blocks: Vec<Block<R>> },
}

impl<R: Record> Message<R> {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::NewHost { .. } => MessageType::NewHost,
            Message::AddHost { .. } => MessageType::AddHost,
            Message::AddBlock { .. } => MessageType::AddBlock,
            Message::NewBlock { .. } => MessageType::NewBlock,
            Message::SetBlocks { .. } => MessageType::SetBlocks,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let payload = match self {
            Message::NewHost { address } => address.clone(),
            Message::AddHost { peers } => encode_peer_list(peers),
            Message::AddBlock { block } => encode_block(block)?,
            Message::NewBlock { requester } => requester.clone(),
            Message::SetBlocks { blocks } => encode_chain(blocks)?,
        };
        Ok(Envelope::new(self.message_type(), payload))
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let payload = envelope.message.as_str();
        Ok(match envelope.message_type {
            MessageType::NewHost => Message::NewHost {
                address: payload.trim().to_string(),
            },
            MessageType::AddHost => Message::AddHost {
                peers: decode_peer_list(payload),
            },
            MessageType::AddBlock => Message::AddBlock {
                block: decode_block(payload)?,
            },
            MessageType::NewBlock => Message::NewBlock {
                requester: payload.trim().to_string(),
            },
            MessageType::SetBlocks => Message::SetBlocks {
                blocks: decode_chain(payload)?,
            },
        })
    }

    /// Parse a raw line straight into a typed message
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        Self::from_envelope(&Envelope::from_json(line)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_envelope()?.to_json()
    }
}

pub fn encode_peer_list<S: AsRef<str>>(peers: &[S]) -> String {
    peers
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(",")
}

/// Split a comma-joined list, ignoring blanks
pub fn decode_peer_list(payload: &str) -> Vec<String> {
    payload
        .split(',')
        .map(str::trim)
        .filter(|address| !address.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn encode_block<R: Record>(block: &Block<R>) -> Result<String, ProtocolError> {
    serde_json::to_string(block).map_err(|source| ProtocolError::InvalidPayload {
        kind: "block",
        source,
    })
}

pub fn decode_block<R: Record>(payload: &str) -> Result<Block<R>, ProtocolError> {
    serde_json::from_str(payload).map_err(|source| ProtocolError::InvalidPayload {
        kind: "block",
        source,
    })
}

pub fn encode_chain<R: Record>(blocks: &[Block<R>]) -> Result<String, ProtocolError> {
    serde_json::to_string(blocks).map_err(|source| ProtocolError::InvalidPayload {
        kind: "chain",
        source,
    })
}

pub fn decode_chain<R: Record>(payload: &str) -> Result<Vec<Block<R>>, ProtocolError> {
    serde_json::from_str(payload).map_err(|source| ProtocolError::InvalidPayload {
        kind: "chain",
        source,
    })
}
