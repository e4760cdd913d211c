//! Gateway wire protocol
//!
//! Every frame is a text-framed JSON object:
//!
//! ```text
//! client → server   {"op": <int>, "data": {...}}
//! server → client   {"op": <int>, "seq": <int>, "data": {...}}
//! ```
//!
//! Decoding happens in two stages. [`decode`] checks the envelope (valid
//! JSON, integer opcode from the table, data object present). Once the
//! connection has passed its authentication gate, [`Request::parse`] checks
//! the opcode-specific fields and yields a typed request. Any violation is
//! reported as a [`CloseFrame`]; the connection that sent it is closed.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

// ============================================================================
// Opcodes
// ============================================================================

/// Protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "u8")]
pub enum OpCode {
    /// Server greeting sent once after handshake.
    Hello = 0,
    /// Client authentication.
    Identify = 1,
    /// Client liveness acknowledgement.
    HeartbeatAck = 2,
    /// Relay an intent to every other cluster.
    Broadcast = 3,
    /// Server acknowledgement of a dispatched opcode.
    Ack = 4,
    /// Cross-cluster dedupe query; the reply reuses this opcode.
    Dedupe = 5,
    /// Diagnostic passthrough from clients, and relayed intents to clients.
    Event = 6,
    /// Client crash report.
    Panic = 7,
}

impl OpCode {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Hello),
            1 => Some(Self::Identify),
            2 => Some(Self::HeartbeatAck),
            3 => Some(Self::Broadcast),
            4 => Some(Self::Ack),
            5 => Some(Self::Dedupe),
            6 => Some(Self::Event),
            7 => Some(Self::Panic),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Opcodes that only ever travel server → client.
    pub fn is_server_only(self) -> bool {
        matches!(self, Self::Hello | Self::Ack)
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op.code()
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hello => write!(f, "hello"),
            Self::Identify => write!(f, "identify"),
            Self::HeartbeatAck => write!(f, "heartbeat_ack"),
            Self::Broadcast => write!(f, "broadcast"),
            Self::Ack => write!(f, "ack"),
            Self::Dedupe => write!(f, "dedupe"),
            Self::Event => write!(f, "event"),
            Self::Panic => write!(f, "panic"),
        }
    }
}

// ============================================================================
// Close codes
// ============================================================================

/// Close codes sent in the WebSocket close frame.
///
/// | code | meaning |
/// |------|---------|
/// | 1000 | normal closure |
/// | 1006 | abnormal closure (transport lost, never sent on the wire) |
/// | 4001 | missing field or undecodable payload |
/// | 4002 | opcode is not an integer |
/// | 4003 | opcode not acceptable |
/// | 4004 | authentication failure |
/// | 4005 | opcode sent before identify |
/// | 4006 | heartbeat timeout |
/// | 4007 | cluster pool full |
/// | 4999 | client reported an exception |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    Normal,
    Abnormal,
    MissingField,
    BadOpcode,
    InvalidOpcode,
    AuthFailed,
    NotAuthenticated,
    HeartbeatTimeout,
    PoolFull,
    ClientException,
    Other(u16),
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::Abnormal => 1006,
            Self::MissingField => 4001,
            Self::BadOpcode => 4002,
            Self::InvalidOpcode => 4003,
            Self::AuthFailed => 4004,
            Self::NotAuthenticated => 4005,
            Self::HeartbeatTimeout => 4006,
            Self::PoolFull => 4007,
            Self::ClientException => 4999,
            Self::Other(code) => code,
        }
    }

    /// Codes that end a connection without raising a panic notification.
    pub fn is_expected(self) -> bool {
        matches!(self, Self::Normal | Self::PoolFull)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1006 => Self::Abnormal,
            4001 => Self::MissingField,
            4002 => Self::BadOpcode,
            4003 => Self::InvalidOpcode,
            4004 => Self::AuthFailed,
            4005 => Self::NotAuthenticated,
            4006 => Self::HeartbeatTimeout,
            4007 => Self::PoolFull,
            4999 => Self::ClientException,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A close code with its human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn missing_field(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::MissingField, reason)
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::AuthFailed, reason)
    }
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.reason)
    }
}

// ============================================================================
// Envelope decoding
// ============================================================================

/// A decoded client frame whose opcode is known but whose fields are not
/// yet checked.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub op: OpCode,
    pub data: Map<String, Value>,
}

/// Decode a raw text frame into a [`Message`].
pub fn decode(raw: &str) -> Result<Message, CloseFrame> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|_| CloseFrame::missing_field("Payload could not be interpreted as JSON"))?;
    let Value::Object(mut payload) = value else {
        return Err(CloseFrame::missing_field("Payload was not a JSON object"));
    };

    let code = match payload.get("op") {
        None | Some(Value::Null) => {
            return Err(CloseFrame::missing_field("Payload did not contain an opcode"))
        }
        Some(op) => opcode_value(op).ok_or_else(|| {
            CloseFrame::new(CloseCode::BadOpcode, "Payload opcode was not an integer")
        })?,
    };
    let op = OpCode::from_code(code)
        .filter(|op| !op.is_server_only())
        .ok_or_else(|| {
            CloseFrame::new(CloseCode::InvalidOpcode, "Payload opcode was not acceptable")
        })?;

    match payload.remove("data") {
        Some(Value::Object(data)) => Ok(Message { op, data }),
        None | Some(Value::Null) => Err(CloseFrame::missing_field("No payload data")),
        Some(_) => Err(CloseFrame::missing_field("Payload data was not an object")),
    }
}

/// Integer opcodes may arrive as JSON integers or as strings holding one.
fn opcode_value(op: &Value) -> Option<i64> {
    match op {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ============================================================================
// Typed requests
// ============================================================================

/// A validated client request, one variant per client-sendable opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Identify {
        authorization: String,
        identifier: String,
    },
    HeartbeatAck,
    Broadcast {
        intent: String,
        content: Value,
    },
    Dedupe {
        scope: String,
        /// A string or number identifying the deduplicated item.
        content: Value,
        req: Value,
    },
    Event {
        intent: String,
    },
    Panic {
        error: Option<Value>,
        traceback: Option<Value>,
    },
}

impl Request {
    /// Check the opcode-specific fields of `message`.
    pub fn parse(message: Message) -> Result<Self, CloseFrame> {
        let Message { op, mut data } = message;
        match op {
            OpCode::Identify => {
                let authorization = take_string(&mut data, "authorization")
                    .ok_or_else(|| CloseFrame::auth_failed("No client authorization"))?;
                let identifier = take_string(&mut data, "identifier")
                    .ok_or_else(|| CloseFrame::auth_failed("No client identifier"))?;
                Ok(Self::Identify {
                    authorization,
                    identifier,
                })
            }
            OpCode::HeartbeatAck => Ok(Self::HeartbeatAck),
            OpCode::Broadcast => {
                let intent = take_string(&mut data, "intent")
                    .ok_or_else(|| CloseFrame::missing_field("No intent provided"))?;
                let content = take_value(&mut data, "content")
                    .ok_or_else(|| CloseFrame::missing_field("No content provided"))?;
                Ok(Self::Broadcast { intent, content })
            }
            OpCode::Dedupe => {
                let scope = take_string(&mut data, "scope")
                    .ok_or_else(|| CloseFrame::missing_field("No scope provided"))?;
                let content = take_value(&mut data, "content")
                    .filter(|v| v.is_string() || v.is_number())
                    .ok_or_else(|| CloseFrame::missing_field("No content provided"))?;
                let req = take_value(&mut data, "req")
                    .ok_or_else(|| CloseFrame::missing_field("No request id provided"))?;
                Ok(Self::Dedupe {
                    scope,
                    content,
                    req,
                })
            }
            OpCode::Event => {
                let intent = take_string(&mut data, "intent")
                    .ok_or_else(|| CloseFrame::missing_field("No intent for event payload"))?;
                Ok(Self::Event { intent })
            }
            OpCode::Panic => Ok(Self::Panic {
                error: take_value(&mut data, "error"),
                traceback: take_value(&mut data, "traceback"),
            }),
            OpCode::Hello | OpCode::Ack => Err(CloseFrame::new(
                CloseCode::InvalidOpcode,
                "Payload opcode was not acceptable",
            )),
        }
    }

    pub fn op(&self) -> OpCode {
        match self {
            Self::Identify { .. } => OpCode::Identify,
            Self::HeartbeatAck => OpCode::HeartbeatAck,
            Self::Broadcast { .. } => OpCode::Broadcast,
            Self::Dedupe { .. } => OpCode::Dedupe,
            Self::Event { .. } => OpCode::Event,
            Self::Panic { .. } => OpCode::Panic,
        }
    }
}

fn take_value(data: &mut Map<String, Value>, key: &str) -> Option<Value> {
    data.remove(key).filter(|v| !v.is_null())
}

fn take_string(data: &mut Map<String, Value>, key: &str) -> Option<String> {
    match data.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

// ============================================================================
// Outbound frames
// ============================================================================

/// Server → client frame.
#[derive(Debug, Serialize)]
pub struct Frame<'a> {
    pub op: OpCode,
    pub seq: u64,
    pub data: &'a Value,
}

impl Frame<'_> {
    pub fn encode(&self) -> String {
        // Serializing a Value-backed frame cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Relay envelope fanned out to every other cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub name: String,
    pub content: Value,
}

impl Intent {
    /// Intent names are normalised to upper case.
    pub fn new(name: &str, content: Value) -> Self {
        Self {
            name: name.to_uppercase(),
            content,
        }
    }

    pub fn op(&self) -> OpCode {
        OpCode::Event
    }

    pub fn payload(&self) -> Value {
        serde_json::json!({
            "intent": self.name,
            "content": self.content,
        })
    }
}
