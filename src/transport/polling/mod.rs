//! The polling transport module handles handshake, polling and post requests.
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use http::{header, HeaderMap, Request, Response, StatusCode};
use http_body::Body;
use tokio::sync::OwnedMutexGuard;

use crate::body::ResponseBody;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::futures::http_response;
use crate::heartbeat::Heart;
use crate::packet::{OpenPacket, Packet};
use crate::sid::Sid;
use crate::socket::Socket;
use crate::transport::{Transport, TransportType};

pub(crate) mod payload;

use payload::Payload;

/// The long-polling side of a session: an outbound FIFO queue drained by
/// GET requests, and a POST intake. Each direction admits a single
/// in-flight request.
pub(crate) struct PollingTransport {
    socket: Weak<Socket>,
    queue: Mutex<VecDeque<Packet>>,
    get_gate: Arc<tokio::sync::Mutex<()>>,
    post_gate: tokio::sync::Mutex<()>,
    pub(crate) heart: Heart,
    max_payload: usize,
    closed: AtomicBool,
}

impl PollingTransport {
    pub(crate) fn new(
        socket: Weak<Socket>,
        ping_interval: std::time::Duration,
        ping_timeout: std::time::Duration,
        max_payload: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<PollingTransport>| {
            let on_tick = {
                let weak = weak.clone();
                move || {
                    if let Some(transport) = weak.upgrade() {
                        transport.send(Packet::Ping { probe: false }).ok();
                    }
                }
            };
            let on_timeout = {
                let socket = socket.clone();
                move || {
                    if let Some(socket) = socket.upgrade() {
                        socket.handle_heartbeat_timeout();
                    }
                }
            };
            PollingTransport {
                socket,
                queue: Mutex::new(VecDeque::new()),
                get_gate: Arc::new(tokio::sync::Mutex::new(())),
                post_gate: tokio::sync::Mutex::new(()),
                heart: Heart::new(ping_interval, ping_timeout, on_tick, on_timeout),
                max_payload,
                closed: AtomicBool::new(false),
            }
        })
    }

    /// Appends a packet to the outbound queue, to be delivered by the next
    /// GET in enqueue order.
    pub(crate) fn send(&self, packet: Packet) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::TransportClosed);
        }
        self.queue.lock().unwrap().push_back(packet);
        Ok(())
    }

    /// Takes every queued packet, in order. Used when the session is
    /// handed over to another transport.
    pub(crate) fn drain(&self) -> Vec<Packet> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    /// Drains the queue for a GET response.
    ///
    /// The returned guard is the `get` gate: it travels with the response
    /// body and releases once the response has been written, so a second
    /// GET arriving in the meantime is rejected.
    pub(crate) fn offload(&self) -> Result<(Payload, OwnedMutexGuard<()>), EngineError> {
        let guard = self
            .get_gate
            .clone()
            .try_lock_owned()
            .map_err(|_| EngineError::DuplicateGetRequest)?;
        let mut queue = self.queue.lock().unwrap();
        Ok((payload::encoder(&mut queue, self.max_payload), guard))
    }

    /// Consumes a POST request body and runs every decoded packet through
    /// the session.
    pub(crate) async fn receive<R>(self: Arc<Self>, req: Request<R>) -> Result<(), EngineError>
    where
        R: Body + Send + Unpin + 'static,
        <R as Body>::Data: Send,
    {
        let _gate = self
            .post_gate
            .try_lock()
            .map_err(|_| EngineError::DuplicatePostRequest)?;

        let declared_len = declared_content_length(req.headers());
        let specified_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_owned());

        let data = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(|_| EngineError::ReadingBodyFailed)?;

        if let Some(declared) = declared_len {
            if declared != data.len() {
                return Err(EngineError::ContentLengthDisparity);
            }
        }
        if data.len() > self.max_payload {
            return Err(EngineError::ContentLengthLimitExceeded);
        }
        if data.is_empty() {
            return Ok(());
        }

        let text = std::str::from_utf8(&data).map_err(|_| EngineError::DecodingBodyFailed)?;
        let packets = payload::decoder(text)?;

        let inferred = payload::content_type(&packets);
        match specified_type.as_deref() {
            None if inferred != payload::TEXT_PLAIN => {
                return Err(EngineError::ContentTypeDifferentToImplicit);
            }
            Some(specified) if specified != inferred => {
                return Err(EngineError::ContentTypeDifferentToSpecified);
            }
            _ => {}
        }

        let socket = self.socket.upgrade().ok_or(EngineError::ClosedForcefully)?;
        let transport = Transport::Polling(self.clone());
        for packet in packets {
            match socket.process_packet(&transport, packet) {
                Ok(()) => {}
                // a requested closure ends the batch with a success status
                Err(err) if err.is_success() => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.heart.dispose();
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

/// `Content-Length` when it is present and parses to a usable length;
/// unknown or negative declarations fall back to the received byte count.
fn declared_content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
}

/// Handle a handshake request: allocate the session and answer with its
/// `open` packet.
pub(crate) fn open_req<B>(
    engine: &Arc<Engine>,
    peer_addr: IpAddr,
) -> Result<Response<ResponseBody<B>>, EngineError> {
    let socket = engine.create_session(peer_addr)?;

    #[cfg(feature = "tracing")]
    tracing::debug!("[sid={}] new polling session", socket.id);

    let packet = Packet::Open(OpenPacket::new(
        TransportType::Polling,
        socket.id,
        &engine.config,
    ));
    http_response(
        StatusCode::OK,
        payload::APPLICATION_JSON,
        packet.encode(),
        None,
    )
}

/// Handle a polling GET: drain whatever the session has queued.
pub(crate) fn polling_req<B>(
    engine: &Arc<Engine>,
    sid: Sid,
) -> Result<Response<ResponseBody<B>>, EngineError> {
    let socket = engine
        .get_socket(sid)
        .ok_or(EngineError::InvalidSessionId)?;
    let polling = socket.polling_transport()?;

    let (payload, guard) = match polling.offload() {
        Ok(drained) => drained,
        Err(err) => {
            socket.transport_exception(err.clone());
            return Err(err);
        }
    };

    #[cfg(feature = "tracing")]
    tracing::debug!("[sid={sid}] sending data: {:?}", payload.data);

    http_response(StatusCode::OK, payload.content_type, payload.data, Some(guard))
}

/// Handle a polling POST: split the body into packets and run them
/// through the session.
pub(crate) async fn post_req<R, B>(
    engine: Arc<Engine>,
    sid: Sid,
    req: Request<R>,
) -> Result<Response<ResponseBody<B>>, EngineError>
where
    R: Body + Send + Unpin + 'static,
    <R as Body>::Data: Send,
{
    let socket = engine
        .get_socket(sid)
        .ok_or(EngineError::InvalidSessionId)?;
    let polling = socket.polling_transport()?;

    if let Err(err) = polling.receive(req).await {
        #[cfg(feature = "tracing")]
        tracing::debug!("[sid={sid}] post request failed: {:?}", err);
        if !err.is_fatal() {
            socket.transport_exception(err.clone());
        }
        return Err(err);
    }
    http_response(StatusCode::OK, payload::TEXT_PLAIN, "ok".to_string(), None)
}
