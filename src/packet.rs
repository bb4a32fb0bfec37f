use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::errors::EngineError;
use crate::sid::Sid;
use crate::transport::TransportType;

/// The eight packet kinds of the protocol with their wire identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    Binary,
    Upgrade,
    Noop,
}

impl PacketType {
    pub fn id(&self) -> char {
        match self {
            PacketType::Open => '0',
            PacketType::Close => '1',
            PacketType::Ping => '2',
            PacketType::Pong => '3',
            PacketType::Message => '4',
            PacketType::Binary => 'b',
            PacketType::Upgrade => '5',
            PacketType::Noop => '6',
        }
    }

    pub fn from_id(id: char) -> Result<Self, EngineError> {
        match id {
            '0' => Ok(PacketType::Open),
            '1' => Ok(PacketType::Close),
            '2' => Ok(PacketType::Ping),
            '3' => Ok(PacketType::Pong),
            '4' => Ok(PacketType::Message),
            'b' => Ok(PacketType::Binary),
            '5' => Ok(PacketType::Upgrade),
            '6' => Ok(PacketType::Noop),
            _ => Err(EngineError::DecodingPacketFailed),
        }
    }
}

/// The payload of the `open` packet, sent by the server as the very first
/// packet of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    pub sid: Sid,
    pub upgrades: Vec<TransportType>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    pub max_payload: u64,
}

impl OpenPacket {
    pub(crate) fn new(transport: TransportType, sid: Sid, config: &ServerConfig) -> Self {
        let upgrades = transport
            .upgrades_to()
            .iter()
            .copied()
            .filter(|t| config.transports.contains(t))
            .collect();
        OpenPacket {
            sid,
            upgrades,
            ping_interval: config.ping_interval.as_millis() as u64,
            ping_timeout: config.ping_timeout.as_millis() as u64,
            max_payload: config.max_payload as u64,
        }
    }
}

/// A packet as it travels over either transport.
///
/// Ping and pong carry their probe flag; the wire payload is empty for a
/// plain heartbeat and the literal `probe` during an upgrade.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(OpenPacket),
    Close,
    Ping { probe: bool },
    Pong { probe: bool },
    Message(String),
    Binary(Vec<u8>),
    Upgrade,
    Noop,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Open(_) => PacketType::Open,
            Packet::Close => PacketType::Close,
            Packet::Ping { .. } => PacketType::Ping,
            Packet::Pong { .. } => PacketType::Pong,
            Packet::Message(_) => PacketType::Message,
            Packet::Binary(_) => PacketType::Binary,
            Packet::Upgrade => PacketType::Upgrade,
            Packet::Noop => PacketType::Noop,
        }
    }

    /// Binary packets travel base64-encoded over polling and as raw binary
    /// frames over websocket.
    pub fn is_binary(&self) -> bool {
        matches!(self, Packet::Binary(_))
    }

    /// Only the `open` packet carries a JSON payload.
    pub fn is_json(&self) -> bool {
        matches!(self, Packet::Open(_))
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.packet_type().id());
        match self {
            Packet::Open(open) => {
                out.push_str(&serde_json::to_string(open).unwrap());
            }
            Packet::Ping { probe } | Packet::Pong { probe } => {
                if *probe {
                    out.push_str("probe");
                }
            }
            Packet::Message(msg) => out.push_str(msg),
            Packet::Binary(data) => out.push_str(&BASE64.encode(data)),
            Packet::Close | Packet::Upgrade | Packet::Noop => {}
        }
        out
    }

    pub fn decode(s: &str) -> Result<Self, EngineError> {
        let mut chars = s.chars();
        let id = chars.next().ok_or(EngineError::DecodingPacketFailed)?;
        let payload = chars.as_str();
        let packet = match PacketType::from_id(id)? {
            PacketType::Open => Packet::Open(decode_open(payload)?),
            PacketType::Close => {
                require_empty(payload)?;
                Packet::Close
            }
            PacketType::Ping => Packet::Ping {
                probe: decode_probe(payload)?,
            },
            PacketType::Pong => Packet::Pong {
                probe: decode_probe(payload)?,
            },
            PacketType::Message => Packet::Message(payload.to_owned()),
            PacketType::Binary => Packet::Binary(
                BASE64
                    .decode(payload)
                    .map_err(|_| EngineError::DecodingPacketFailed)?,
            ),
            PacketType::Upgrade => {
                require_empty(payload)?;
                Packet::Upgrade
            }
            PacketType::Noop => {
                require_empty(payload)?;
                Packet::Noop
            }
        };
        Ok(packet)
    }
}

fn decode_open(payload: &str) -> Result<OpenPacket, EngineError> {
    serde_json::from_str(payload).map_err(|_| EngineError::DecodingPacketFailed)
}

fn decode_probe(payload: &str) -> Result<bool, EngineError> {
    match payload {
        "" => Ok(false),
        "probe" => Ok(true),
        _ => Err(EngineError::DecodingPacketFailed),
    }
}

fn require_empty(payload: &str) -> Result<(), EngineError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(EngineError::DecodingPacketFailed)
    }
}
