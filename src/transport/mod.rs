use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::heartbeat::Heart;
use crate::packet::Packet;

pub mod polling;
pub mod ws;

use polling::PollingTransport;
use ws::WsTransport;

/// The transport through which the client is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Polling,
    Websocket,
}

impl TransportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Polling => "polling",
            TransportType::Websocket => "websocket",
        }
    }

    /// The transports a session on this transport may upgrade to.
    pub fn upgrades_to(&self) -> &'static [TransportType] {
        match self {
            TransportType::Polling => &[TransportType::Websocket],
            TransportType::Websocket => &[],
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(TransportType::Polling),
            "websocket" => Ok(TransportType::Websocket),
            _ => Err(EngineError::TransportUnknown),
        }
    }
}

/// A live transport instance bound to one session.
#[derive(Clone)]
pub(crate) enum Transport {
    Polling(Arc<PollingTransport>),
    Websocket(Arc<WsTransport>),
}

impl Transport {
    pub(crate) fn transport_type(&self) -> TransportType {
        match self {
            Transport::Polling(_) => TransportType::Polling,
            Transport::Websocket(_) => TransportType::Websocket,
        }
    }

    /// Identity comparison; two handles are the same transport when they
    /// point at the same instance.
    pub(crate) fn same(&self, other: &Transport) -> bool {
        match (self, other) {
            (Transport::Polling(a), Transport::Polling(b)) => Arc::ptr_eq(a, b),
            (Transport::Websocket(a), Transport::Websocket(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn send(&self, packet: Packet) -> Result<(), EngineError> {
        match self {
            Transport::Polling(t) => t.send(packet),
            Transport::Websocket(t) => t.send(packet),
        }
    }

    /// Sends a batch in order, used to hand a residual polling queue over
    /// to the transport that replaces it.
    pub(crate) fn send_all(&self, packets: Vec<Packet>) -> Result<(), EngineError> {
        for packet in packets {
            self.send(packet)?;
        }
        Ok(())
    }

    /// Closes the transport. `err` selects the close frame on a websocket;
    /// `None` is a clean closure. Closing twice is a no-op.
    pub(crate) fn close(&self, err: Option<&EngineError>) {
        match self {
            Transport::Polling(t) => t.close(),
            Transport::Websocket(t) => t.close(err),
        }
    }

    pub(crate) fn heart(&self) -> &Heart {
        match self {
            Transport::Polling(t) => &t.heart,
            Transport::Websocket(t) => &t.heart,
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transport")
            .field(&self.transport_type())
            .finish()
    }
}
