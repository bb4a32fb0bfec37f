//! Record-separated payload framing for the polling transport.

use std::collections::VecDeque;

use crate::errors::EngineError;
use crate::packet::Packet;

/// Packets in a polling body are joined by the ASCII record separator.
pub(crate) const RECORD_SEPARATOR: char = '\u{1e}';

pub(crate) const TEXT_PLAIN: &str = "text/plain";
pub(crate) const APPLICATION_JSON: &str = "application/json";
pub(crate) const OCTET_STREAM: &str = "application/octet-stream";

/// An encoded batch of packets, ready to be written as a response body.
#[derive(Debug)]
pub(crate) struct Payload {
    pub data: String,
    pub content_type: &'static str,
}

/// The content type implied by a batch of packets: binary wins over JSON,
/// plain text is the implicit default.
pub(crate) fn content_type(packets: &[Packet]) -> &'static str {
    if packets.iter().any(Packet::is_binary) {
        OCTET_STREAM
    } else if packets.iter().any(Packet::is_json) {
        APPLICATION_JSON
    } else {
        TEXT_PLAIN
    }
}

/// Drains the queue greedily in FIFO order into a single body.
///
/// The running byte total counts the one-byte separator between
/// consecutive packets; a packet that would push the total past
/// `max_payload` stays queued. The head packet is included even when it
/// exceeds the budget on its own, since a non-empty drain cannot yield
/// zero packets.
pub(crate) fn encoder(queue: &mut VecDeque<Packet>, max_payload: usize) -> Payload {
    let mut included = Vec::new();
    let mut data = String::new();
    while let Some(packet) = queue.front() {
        let encoded = packet.encode();
        if !included.is_empty() && data.len() + 1 + encoded.len() > max_payload {
            break;
        }
        if !included.is_empty() {
            data.push(RECORD_SEPARATOR);
        }
        data.push_str(&encoded);
        included.extend(queue.pop_front());
    }
    Payload {
        content_type: content_type(&included),
        data,
    }
}

/// Splits a request body on the record separator and decodes every
/// segment; any segment failure fails the batch as a whole.
pub(crate) fn decoder(body: &str) -> Result<Vec<Packet>, EngineError> {
    body.split(RECORD_SEPARATOR)
        .map(Packet::decode)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| EngineError::DecodingPacketsFailed)
}
