//! The ws transport module handles websocket upgrade requests and carries
//! a session over a websocket connection once the probe handshake is done.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use http::{header, HeaderMap, HeaderName, Method, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::body::ResponseBody;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::futures::ws_response;
use crate::heartbeat::Heart;
use crate::packet::Packet;
use crate::sid::Sid;
use crate::socket::{DisconnectReason, Socket};
use crate::transport::{Transport, TransportType};

enum Outgoing {
    Packet(Packet),
    Close(Option<CloseFrame<'static>>),
}

/// The websocket side of a session. Outbound packets go through a bounded
/// channel to a writer task owning the sink half; the reader half is
/// consumed by [`attach`].
pub(crate) struct WsTransport {
    tx: mpsc::Sender<Outgoing>,
    pub(crate) heart: Heart,
    closed: AtomicBool,
}

impl WsTransport {
    pub(crate) fn new<S>(
        socket: Weak<Socket>,
        ping_interval: Duration,
        ping_timeout: Duration,
        max_buffer_size: usize,
        sink: SplitSink<WebSocketStream<S>, Message>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(max_buffer_size);
        forward_to_peer(rx, sink);
        Arc::new_cyclic(|weak: &Weak<WsTransport>| {
            let on_tick = {
                let weak = weak.clone();
                move || {
                    if let Some(transport) = weak.upgrade() {
                        transport.send(Packet::Ping { probe: false }).ok();
                    }
                }
            };
            let on_timeout = move || {
                if let Some(socket) = socket.upgrade() {
                    socket.handle_heartbeat_timeout();
                }
            };
            WsTransport {
                tx,
                heart: Heart::new(ping_interval, ping_timeout, on_tick, on_timeout),
                closed: AtomicBool::new(false),
            }
        })
    }

    /// Queues a packet for the writer task. Binary packets travel as raw
    /// binary frames, everything else as text.
    pub(crate) fn send(&self, packet: Packet) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::TransportClosed);
        }
        self.tx
            .try_send(Outgoing::Packet(packet))
            .map_err(|err| match err {
                TrySendError::Full(_) => EngineError::SendBufferFull,
                TrySendError::Closed(_) => EngineError::TransportClosed,
            })
    }

    /// Closes the connection. `err` selects the close code, a plain
    /// closure sends an empty close frame. Closing twice is a no-op.
    pub(crate) fn close(&self, err: Option<&EngineError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.heart.dispose();
        let frame = err.map(|err| CloseFrame {
            code: CloseCode::from(err.ws_close_code()),
            reason: err.to_string().into(),
        });
        self.tx.try_send(Outgoing::Close(frame)).ok();
    }
}

/// Forwards everything queued on the session to the websocket peer.
///
/// The sink is flushed only once the channel is drained.
fn forward_to_peer<S>(
    mut rx: mpsc::Receiver<Outgoing>,
    mut tx: SplitSink<WebSocketStream<S>, Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // declared as a macro rather than a closure so it can break out of
        // the outer loop
        macro_rules! forward {
            ($item:ident) => {
                let res = match $item {
                    Outgoing::Packet(Packet::Binary(bin)) => tx.feed(Message::Binary(bin)).await,
                    // a noop left over from a polling handover carries
                    // nothing the websocket peer needs
                    Outgoing::Packet(Packet::Noop) => Ok(()),
                    Outgoing::Packet(packet) => tx.feed(Message::Text(packet.encode())).await,
                    Outgoing::Close(frame) => {
                        tx.send(Message::Close(frame)).await.ok();
                        rx.close();
                        break;
                    }
                };
                if let Err(_e) = res {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("websocket send failed: {_e}");
                }
            };
        }

        while let Some(item) = rx.recv().await {
            forward!(item);

            // drain whatever accumulated before paying for a flush
            while let Ok(item) = rx.try_recv() {
                forward!(item);
            }

            tx.flush().await.ok();
        }
    });
}

/// Validates the RFC 6455 request headers and derives the accept token.
pub(crate) fn validate_upgrade_request<R>(req: &Request<R>) -> Result<String, EngineError> {
    if req.method() != Method::GET {
        return Err(EngineError::UpgradeRequestInvalid);
    }
    if !header_contains(req.headers(), header::CONNECTION, "upgrade")
        || !header_eq(req.headers(), header::UPGRADE, "websocket")
        || !header_eq(req.headers(), header::SEC_WEBSOCKET_VERSION, "13")
    {
        return Err(EngineError::UpgradeRequestInvalid);
    }
    let key = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(EngineError::UpgradeRequestInvalid)?;
    let decoded = BASE64
        .decode(key.as_bytes())
        .map_err(|_| EngineError::UpgradeRequestInvalid)?;
    if decoded.len() != 16 {
        return Err(EngineError::UpgradeRequestInvalid);
    }
    Ok(derive_accept_key(key.as_bytes()))
}

fn header_eq(headers: &HeaderMap, key: HeaderName, value: &'static str) -> bool {
    headers
        .get(&key)
        .map(|header| header.as_bytes().eq_ignore_ascii_case(value.as_bytes()))
        .unwrap_or(false)
}

fn header_contains(headers: &HeaderMap, key: HeaderName, value: &'static str) -> bool {
    headers
        .get(&key)
        .and_then(|header| std::str::from_utf8(header.as_bytes()).ok())
        .map(|header| header.to_ascii_lowercase().contains(value))
        .unwrap_or(false)
}

/// Handle a websocket upgrade request on an existing polling session.
///
/// The upgrade course and concurrency rules run before the 101 goes out;
/// the probe handshake itself happens packet by packet once the
/// connection is upgraded:
///
/// ```text
/// client                                   server
///   │  GET ..&transport=websocket&sid=..     │
///   │ ─────────────────────────────────────► │
///   │ ◄───────────────────────────────────── │
///   │        HTTP 101 + Sec-WebSocket-Accept │
///   │  2probe  ────────────────────────────► │ (probe ping)
///   │ ◄────────────────────────────  3probe  │ (probe pong)
///   │  5       ────────────────────────────► │ (upgrade)
/// ```
pub(crate) fn upgrade_req<R, B>(
    engine: &Arc<Engine>,
    sid: Sid,
    req: Request<R>,
) -> Result<Response<ResponseBody<B>>, EngineError> {
    let socket = engine
        .get_socket(sid)
        .ok_or(EngineError::InvalidSessionId)?;
    socket.prepare_upgrade(TransportType::Websocket)?;
    let accept = validate_upgrade_request(&req)?;

    let (parts, _) = req.into_parts();
    let req = Request::from_parts(parts, ());
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(conn) => {
                let ws = WebSocketStream::from_raw_socket(conn, Role::Server, None).await;
                attach(socket, ws).await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("[sid={}] ws upgrade failed: {_e}", socket.id);
                socket.cancel_upgrade(EngineError::UpgradeRequestInvalid);
            }
        }
    });

    ws_response(&accept)
}

/// Installs the established connection as the session's probe transport
/// and reads frames until the connection goes away.
pub(crate) async fn attach<S>(socket: Arc<Socket>, ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let transport = WsTransport::new(
        Arc::downgrade(&socket),
        socket.config.ping_interval,
        socket.config.ping_timeout,
        socket.config.max_buffer_size,
        sink,
    );
    let probe = Transport::Websocket(transport);
    if socket.install_probe(probe.clone()).is_err() {
        probe.close(Some(&EngineError::UpgradeAlreadyInitiated));
        return;
    }

    read_loop(socket, probe, stream).await;
}

async fn read_loop<S>(
    socket: Arc<Socket>,
    transport: Transport,
    mut stream: SplitStream<WebSocketStream<S>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(item) = stream.next().await {
        let result = match item {
            Ok(Message::Text(text)) => match Packet::decode(&text) {
                Ok(packet) => socket.process_packet(&transport, packet),
                Err(_) => Err(EngineError::DecodingPacketFailed),
            },
            Ok(Message::Binary(data)) => socket.process_packet(&transport, Packet::Binary(data)),
            Ok(Message::Close(_)) => {
                // the peer dropped the connection underneath the session
                if socket.is_probe(&transport) {
                    socket.cancel_upgrade(EngineError::ClosedForcefully);
                } else {
                    socket.close(DisconnectReason::TransportClose);
                }
                break;
            }
            Ok(_) => Err(EngineError::UnknownDataType),
            Err(_) => Err(EngineError::ClosedForcefully),
        };
        if let Err(err) = result {
            if !err.is_success() {
                socket.handle_ws_failure(&transport, &err);
            }
            break;
        }
    }
    #[cfg(feature = "tracing")]
    tracing::debug!("[sid={}] ws read loop ended", socket.id);
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::io::DuplexStream;

    use super::*;
    use crate::config::ServerConfig;

    async fn client_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (client, server) = tokio::io::duplex(4096);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        (client, server)
    }

    fn polling_socket(config: ServerConfig) -> Arc<Socket> {
        Socket::new_polling(
            Sid::new(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Arc::new(config),
            Weak::new(),
        )
    }

    fn upgrade_request(key: &str, version: &str) -> Request<()> {
        Request::builder()
            .method(Method::GET)
            .header(header::CONNECTION, "keep-alive, Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, version)
            .header(header::SEC_WEBSOCKET_KEY, key)
            .body(())
            .unwrap()
    }

    #[test]
    fn accept_token_matches_rfc_6455() {
        // the worked example from the RFC
        let req = upgrade_request("dGhlIHNhbXBsZSBub25jZQ==", "13");
        assert_eq!(
            validate_upgrade_request(&req).unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn handshake_requires_all_headers() {
        let mut req = upgrade_request("dGhlIHNhbXBsZSBub25jZQ==", "13");
        req.headers_mut().remove(header::CONNECTION);
        assert!(validate_upgrade_request(&req).is_err());

        let req = upgrade_request("dGhlIHNhbXBsZSBub25jZQ==", "12");
        assert!(validate_upgrade_request(&req).is_err());

        // a key that does not decode to exactly 16 bytes
        let req = upgrade_request("c2hvcnQ=", "13");
        assert!(validate_upgrade_request(&req).is_err());
        let req = upgrade_request("not base64 at all", "13");
        assert!(validate_upgrade_request(&req).is_err());
    }

    #[tokio::test]
    async fn probe_handshake_and_messages_end_to_end() {
        let socket = polling_socket(ServerConfig::default());
        socket.send(Packet::Message("buffered".to_string())).unwrap();

        let (mut client, server) = client_pair().await;
        let mut messages = socket.on_message();
        tokio::spawn(attach(socket.clone(), server));

        client
            .send(Message::Text("2probe".to_string()))
            .await
            .unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text("3probe".to_string())
        );
        client.send(Message::Text("5".to_string())).await.unwrap();

        // the buffered polling packet is flushed onto the websocket
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text("4buffered".to_string())
        );
        assert_eq!(socket.transport_type(), TransportType::Websocket);

        // text in
        client.send(Message::Text("4hi".to_string())).await.unwrap();
        assert_eq!(
            messages.recv().await.unwrap(),
            Packet::Message("hi".to_string())
        );

        // binary frames skip base64 entirely, in both directions
        client
            .send(Message::Binary(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(messages.recv().await.unwrap(), Packet::Binary(vec![1, 2, 3]));
        socket.send(Packet::Binary(vec![9, 8, 7])).unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Binary(vec![9, 8, 7])
        );
    }

    #[tokio::test]
    async fn undecodable_text_closes_with_policy_violation() {
        let socket = polling_socket(ServerConfig::default());
        let (mut client, server) = client_pair().await;
        tokio::spawn(attach(socket.clone(), server));

        client
            .send(Message::Text("2probe".to_string()))
            .await
            .unwrap();
        client.next().await.unwrap().unwrap();
        client.send(Message::Text("5".to_string())).await.unwrap();

        // on the current transport a decode failure is terminal
        client
            .send(Message::Text("zz".to_string()))
            .await
            .unwrap();
        let frame = loop {
            match client.next().await.unwrap().unwrap() {
                Message::Close(frame) => break frame,
                _ => continue,
            }
        };
        assert_eq!(frame.unwrap().code, CloseCode::from(1008));
        assert!(socket.is_closed());
    }

    #[tokio::test]
    async fn garbage_during_probing_cancels_only_the_upgrade() {
        let socket = polling_socket(ServerConfig::default());
        let (mut client, server) = client_pair().await;
        let mut upgrade_errors = socket.on_upgrade_exception();
        tokio::spawn(attach(socket.clone(), server));

        client
            .send(Message::Text("2probe".to_string()))
            .await
            .unwrap();
        client.next().await.unwrap().unwrap();
        client.send(Message::Text("zz".to_string())).await.unwrap();

        assert_eq!(
            upgrade_errors.recv().await.unwrap(),
            EngineError::DecodingPacketFailed
        );
        assert!(!socket.is_closed());
        assert_eq!(socket.transport_type(), TransportType::Polling);
    }
}
