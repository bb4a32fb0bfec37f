use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::packet::Packet;
use crate::sid::Sid;
use crate::transport::polling::PollingTransport;
use crate::transport::{Transport, TransportType};
use crate::upgrade::{UpgradeState, UpgradeStatus};

/// Why a session ended, as delivered on the close events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent a `close` packet.
    TransportClose,
    /// The transport failed underneath the session.
    TransportError,
    /// The client did not answer a ping in time.
    HeartbeatTimeout,
    /// The client sent a packet it may not send.
    PacketParsingError,
    /// The server is shutting down.
    ClosingServer,
}

impl From<&EngineError> for DisconnectReason {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::RequestedClosure => DisconnectReason::TransportClose,
            EngineError::HeartbeatTimedOut | EngineError::HeartbeatUnexpected => {
                DisconnectReason::HeartbeatTimeout
            }
            EngineError::PacketIllegal
            | EngineError::DecodingPacketFailed
            | EngineError::UnknownDataType => DisconnectReason::PacketParsingError,
            EngineError::ServerClosing => DisconnectReason::ClosingServer,
            _ => DisconnectReason::TransportError,
        }
    }
}

const EVENT_CAPACITY: usize = 32;

/// One lossy broadcast channel per lifecycle event. Observers that lag
/// lose messages rather than backpressure the session.
struct Events {
    message: broadcast::Sender<Packet>,
    heartbeat: broadcast::Sender<()>,
    sent: broadcast::Sender<Packet>,
    received: broadcast::Sender<Packet>,
    initiate_upgrade: broadcast::Sender<()>,
    upgrade: broadcast::Sender<()>,
    upgrade_exception: broadcast::Sender<EngineError>,
    transport_exception: broadcast::Sender<EngineError>,
    transport_close: broadcast::Sender<DisconnectReason>,
    exception: broadcast::Sender<EngineError>,
    close: broadcast::Sender<DisconnectReason>,
}

impl Events {
    fn new() -> Self {
        Self {
            message: broadcast::channel(EVENT_CAPACITY).0,
            heartbeat: broadcast::channel(EVENT_CAPACITY).0,
            sent: broadcast::channel(EVENT_CAPACITY).0,
            received: broadcast::channel(EVENT_CAPACITY).0,
            initiate_upgrade: broadcast::channel(EVENT_CAPACITY).0,
            upgrade: broadcast::channel(EVENT_CAPACITY).0,
            upgrade_exception: broadcast::channel(EVENT_CAPACITY).0,
            transport_exception: broadcast::channel(EVENT_CAPACITY).0,
            transport_close: broadcast::channel(EVENT_CAPACITY).0,
            exception: broadcast::channel(EVENT_CAPACITY).0,
            close: broadcast::channel(EVENT_CAPACITY).0,
        }
    }
}

/// One session: a client identified by its session id, bound to a current
/// transport and, during an upgrade, to a probe transport.
pub struct Socket {
    pub id: Sid,
    pub peer_addr: IpAddr,
    pub(crate) config: Arc<ServerConfig>,
    engine: Weak<Engine>,
    weak_self: Weak<Socket>,
    transport: RwLock<Transport>,
    upgrade: Mutex<UpgradeState>,
    events: Events,
    closed: AtomicBool,
}

impl Socket {
    pub(crate) fn new_polling(
        id: Sid,
        peer_addr: IpAddr,
        config: Arc<ServerConfig>,
        engine: Weak<Engine>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Socket>| {
            let transport = PollingTransport::new(
                weak.clone(),
                config.ping_interval,
                config.ping_timeout,
                config.max_payload,
            );
            Socket {
                id,
                peer_addr,
                config,
                engine,
                weak_self: weak.clone(),
                transport: RwLock::new(Transport::Polling(transport)),
                upgrade: Mutex::new(UpgradeState::new()),
                events: Events::new(),
                closed: AtomicBool::new(false),
            }
        })
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport.read().unwrap().transport_type()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn current_transport(&self) -> Transport {
        self.transport.read().unwrap().clone()
    }

    pub(crate) fn polling_transport(&self) -> Result<Arc<PollingTransport>, EngineError> {
        match &*self.transport.read().unwrap() {
            Transport::Polling(polling) => Ok(polling.clone()),
            Transport::Websocket(_) => Err(EngineError::TransportMismatch),
        }
    }

    // Event streams. Each is closed exactly once, when the session is
    // dropped; emission after closure is a no-op.

    /// Text and binary message packets received from the client.
    pub fn on_message(&self) -> broadcast::Receiver<Packet> {
        self.events.message.subscribe()
    }

    /// Fires every time the client answers a ping in time.
    pub fn on_heartbeat(&self) -> broadcast::Receiver<()> {
        self.events.heartbeat.subscribe()
    }

    pub fn on_send(&self) -> broadcast::Receiver<Packet> {
        self.events.sent.subscribe()
    }

    /// Every packet accepted from the client, at the wire level.
    pub fn on_receive(&self) -> broadcast::Receiver<Packet> {
        self.events.received.subscribe()
    }

    pub fn on_initiate_upgrade(&self) -> broadcast::Receiver<()> {
        self.events.initiate_upgrade.subscribe()
    }

    pub fn on_upgrade(&self) -> broadcast::Receiver<()> {
        self.events.upgrade.subscribe()
    }

    /// Failures on the probe transport; they cancel the upgrade but leave
    /// the session running.
    pub fn on_upgrade_exception(&self) -> broadcast::Receiver<EngineError> {
        self.events.upgrade_exception.subscribe()
    }

    pub fn on_transport_exception(&self) -> broadcast::Receiver<EngineError> {
        self.events.transport_exception.subscribe()
    }

    pub fn on_transport_close(&self) -> broadcast::Receiver<DisconnectReason> {
        self.events.transport_close.subscribe()
    }

    /// Failures that end the session.
    pub fn on_exception(&self) -> broadcast::Receiver<EngineError> {
        self.events.exception.subscribe()
    }

    pub fn on_close(&self) -> broadcast::Receiver<DisconnectReason> {
        self.events.close.subscribe()
    }

    fn emit<T: Clone>(&self, tx: &broadcast::Sender<T>, value: T) {
        if !self.is_closed() {
            tx.send(value).ok();
        }
    }

    /// Sends a packet to the client over the current transport.
    ///
    /// During an upgrade the current transport is still the origin; the
    /// packet is carried over to the new transport if it has not been
    /// delivered by the time the upgrade completes.
    pub fn send(&self, packet: Packet) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::ClosedForcefully);
        }
        {
            // hold the lock across the send so a concurrent transport swap
            // cannot slip between routing and the residual transfer
            let transport = self.transport.read().unwrap();
            transport.send(packet.clone())?;
        }
        self.emit(&self.events.sent, packet);
        Ok(())
    }

    /// Closes the session from the server side, telling the client first.
    pub fn disconnect(&self) {
        self.send(Packet::Close).ok();
        self.close(DisconnectReason::TransportClose);
    }

    /// Runs one packet received on `transport` through the session: the
    /// upgrade rules first, then heartbeat and message dispatch.
    pub(crate) fn process_packet(
        &self,
        transport: &Transport,
        packet: Packet,
    ) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::ClosedForcefully);
        }
        if let Err(err) = self.apply(transport, &packet) {
            self.route_error(transport, &err);
            return Err(err);
        }
        self.emit(&self.events.received, packet);
        Ok(())
    }

    fn apply(&self, transport: &Transport, packet: &Packet) -> Result<(), EngineError> {
        match packet {
            Packet::Ping { probe: true } => self.handle_probe_ping(transport),
            Packet::Upgrade => self.handle_upgrade_packet(transport),
            Packet::Ping { probe: false }
            | Packet::Pong { probe: true }
            | Packet::Open(_)
            | Packet::Noop => Err(EngineError::PacketIllegal),
            Packet::Close => {
                self.close(DisconnectReason::TransportClose);
                Err(EngineError::RequestedClosure)
            }
            Packet::Pong { probe: false } => self.handle_pong(transport),
            Packet::Message(_) | Packet::Binary(_) => {
                self.emit(&self.events.message, packet.clone());
                Ok(())
            }
        }
    }

    fn handle_pong(&self, transport: &Transport) -> Result<(), EngineError> {
        let heart = transport.heart();
        if !heart.is_expecting() {
            return Err(EngineError::HeartbeatUnexpected);
        }
        heart.reset();
        self.emit(&self.events.heartbeat, ());
        Ok(())
    }

    fn handle_probe_ping(&self, transport: &Transport) -> Result<(), EngineError> {
        let mut upgrade = self.upgrade.lock().unwrap();
        if upgrade.status == UpgradeStatus::None {
            return Err(EngineError::UpgradeNotUnderway);
        }
        if transport.same(&self.transport.read().unwrap()) {
            return Err(EngineError::TransportIsOrigin);
        }
        match upgrade.status {
            UpgradeStatus::Initiated => {
                match &upgrade.probe {
                    Some(probe) if probe.same(transport) => {}
                    _ => return Err(EngineError::UpgradeNotUnderway),
                }
                upgrade.status = UpgradeStatus::Probed;
                drop(upgrade);
                transport.send(Packet::Pong { probe: true })
            }
            _ => Err(EngineError::TransportAlreadyProbed),
        }
    }

    fn handle_upgrade_packet(&self, transport: &Transport) -> Result<(), EngineError> {
        let mut upgrade = self.upgrade.lock().unwrap();
        if transport.same(&self.transport.read().unwrap()) {
            return Err(
                if upgrade.status == UpgradeStatus::None
                    && transport.transport_type() == TransportType::Websocket
                {
                    EngineError::TransportAlreadyUpgraded
                } else {
                    EngineError::TransportIsOrigin
                },
            );
        }
        match upgrade.status {
            UpgradeStatus::Probed => {
                match &upgrade.probe {
                    Some(probe) if probe.same(transport) => {}
                    _ => return Err(EngineError::TransportNotProbed),
                }
                upgrade.status = UpgradeStatus::Complete;
                let (probe, timeout_task) = upgrade.reset();
                drop(upgrade);
                if let Some(task) = timeout_task {
                    task.abort();
                }
                let probe = probe.unwrap_or_else(|| transport.clone());

                #[cfg(feature = "tracing")]
                tracing::debug!("[sid={}] transport upgraded", self.id);

                {
                    // swap under the transport lock so no send can slip in
                    // between the handover and the residual transfer
                    let mut current = self.transport.write().unwrap();
                    let origin = std::mem::replace(&mut *current, probe.clone());
                    if let Transport::Polling(polling) = &origin {
                        probe.send_all(polling.drain()).ok();
                    }
                    origin.close(None);
                }
                probe.heart().start();
                self.emit(&self.events.upgrade, ());
                Ok(())
            }
            _ => Err(EngineError::TransportNotProbed),
        }
    }

    /// Steps 1 and 2 of an upgrade request, run before answering 101: the
    /// course must be legal, and a concurrent upgrade cancels both.
    pub(crate) fn prepare_upgrade(&self, target: TransportType) -> Result<(), EngineError> {
        let current_type = self.transport.read().unwrap().transport_type();
        if !current_type.upgrades_to().contains(&target) {
            return Err(EngineError::UpgradeCourseNotAllowed);
        }
        if self.upgrade.lock().unwrap().in_progress() {
            self.cancel_upgrade(EngineError::UpgradeAlreadyInitiated);
            return Err(EngineError::UpgradeAlreadyInitiated);
        }
        Ok(())
    }

    /// Installs a freshly established transport as the probe.
    pub(crate) fn install_probe(&self, probe: Transport) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::ClosedForcefully);
        }
        let mut upgrade = self.upgrade.lock().unwrap();
        if upgrade.in_progress() {
            drop(upgrade);
            self.cancel_upgrade(EngineError::UpgradeAlreadyInitiated);
            return Err(EngineError::UpgradeAlreadyInitiated);
        }
        upgrade.status = UpgradeStatus::Initiated;
        upgrade.probe = Some(probe.clone());
        upgrade.started_at = Some(Instant::now());
        upgrade.timeout_task = Some(self.spawn_upgrade_timeout(probe));
        drop(upgrade);
        self.emit(&self.events.initiate_upgrade, ());
        Ok(())
    }

    fn spawn_upgrade_timeout(&self, probe: Transport) -> JoinHandle<()> {
        let socket = self.weak_self.clone();
        let timeout = self.config.upgrade_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(socket) = socket.upgrade() {
                if socket.is_probe(&probe) {
                    socket.cancel_upgrade(EngineError::UpgradeTimedOut);
                }
            }
        })
    }

    pub(crate) fn is_probe(&self, transport: &Transport) -> bool {
        let upgrade = self.upgrade.lock().unwrap();
        upgrade.in_progress()
            && upgrade
                .probe
                .as_ref()
                .map_or(false, |probe| probe.same(transport))
    }

    /// Abandons an in-flight upgrade: the probe is disposed, the session
    /// keeps running on its origin transport.
    pub(crate) fn cancel_upgrade(&self, err: EngineError) {
        let (probe, task) = self.upgrade.lock().unwrap().reset();
        let probe = match probe {
            Some(probe) => probe,
            None => return,
        };
        if let Some(task) = task {
            task.abort();
        }
        #[cfg(feature = "tracing")]
        tracing::debug!("[sid={}] upgrade cancelled: {:?}", self.id, err);
        self.emit(&self.events.upgrade_exception, err.clone());
        probe.close(Some(&err));
    }

    /// Surfaces a request-scoped transport failure.
    pub(crate) fn transport_exception(&self, err: EngineError) {
        self.emit(&self.events.transport_exception, err);
    }

    /// A failure on a websocket carrying this session. On the probe it
    /// cancels the upgrade; on the current transport there is nothing to
    /// fall back to, so the session ends. Failures already routed by
    /// packet processing come out as no-ops here.
    pub(crate) fn handle_ws_failure(&self, transport: &Transport, err: &EngineError) {
        if self.is_closed() {
            return;
        }
        if self.is_probe(transport) {
            self.cancel_upgrade(err.clone());
            return;
        }
        if transport.same(&self.transport.read().unwrap()) {
            self.emit(&self.events.transport_exception, err.clone());
            self.emit(&self.events.exception, err.clone());
            self.close_with(DisconnectReason::from(err), Some(err));
        }
    }

    pub(crate) fn handle_heartbeat_timeout(&self) {
        #[cfg(feature = "tracing")]
        tracing::debug!("[sid={}] heartbeat timed out", self.id);
        self.emit(&self.events.exception, EngineError::HeartbeatTimedOut);
        self.close_with(
            DisconnectReason::HeartbeatTimeout,
            Some(&EngineError::HeartbeatTimedOut),
        );
    }

    /// Failures on the probe cancel the upgrade; fatal failures end the
    /// session; anything else is left to the observing request handler.
    pub(crate) fn route_error(&self, transport: &Transport, err: &EngineError) {
        if err.is_success() {
            return;
        }
        if self.is_probe(transport) {
            self.cancel_upgrade(err.clone());
        } else if err.is_fatal() {
            self.emit(&self.events.exception, err.clone());
            self.close_with(DisconnectReason::from(err), Some(err));
        }
    }

    pub(crate) fn close(&self, reason: DisconnectReason) {
        self.close_with(reason, None);
    }

    fn close_with(&self, reason: DisconnectReason, err: Option<&EngineError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("[sid={}] closing session: {:?}", self.id, reason);

        // an upgrade in flight goes down with the session
        let (probe, task) = self.upgrade.lock().unwrap().reset();
        if let Some(task) = task {
            task.abort();
        }
        if let Some(probe) = probe {
            self.events
                .upgrade_exception
                .send(EngineError::ConnectionClosedDuringUpgrade)
                .ok();
            probe.close(Some(&EngineError::ConnectionClosedDuringUpgrade));
        }

        let transport = self.transport.read().unwrap().clone();
        match (reason, err) {
            (DisconnectReason::TransportClose, _) => transport.close(None),
            (_, Some(err)) => transport.close(Some(err)),
            (DisconnectReason::ClosingServer, None) => {
                transport.close(Some(&EngineError::ServerClosing))
            }
            (_, None) => transport.close(Some(&EngineError::ClosedForcefully)),
        }

        self.events.transport_close.send(reason).ok();
        self.events.close.send(reason).ok();

        if let Some(engine) = self.engine.upgrade() {
            engine.remove_session(self.id);
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("transport", &self.transport_type())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use futures::StreamExt;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    use super::*;
    use crate::transport::ws::WsTransport;

    fn socket() -> Arc<Socket> {
        let config = Arc::new(ServerConfig::default());
        Socket::new_polling(
            Sid::new(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            config,
            Weak::new(),
        )
    }

    /// A websocket transport backed by an in-memory stream; the returned
    /// reader sees the frames the transport writes.
    async fn ws_probe(
        socket: &Arc<Socket>,
    ) -> (
        Transport,
        futures::stream::SplitStream<WebSocketStream<tokio::io::DuplexStream>>,
    ) {
        let (client, server) = tokio::io::duplex(4096);
        let ws = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let (sink, _ignored) = ws.split();
        let client_ws = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let (_client_sink, client_stream) = client_ws.split();
        let transport = WsTransport::new(
            Arc::downgrade(socket),
            socket.config.ping_interval,
            socket.config.ping_timeout,
            socket.config.max_buffer_size,
            sink,
        );
        (Transport::Websocket(transport), client_stream)
    }

    fn current(socket: &Arc<Socket>) -> Transport {
        socket.current_transport()
    }

    #[tokio::test]
    async fn probe_ping_without_an_upgrade_is_rejected() {
        let socket = socket();
        let origin = current(&socket);
        let err = socket
            .process_packet(&origin, Packet::Ping { probe: true })
            .unwrap_err();
        assert_eq!(err, EngineError::UpgradeNotUnderway);
        assert!(!socket.is_closed());
    }

    #[tokio::test]
    async fn upgrade_packet_without_probing_is_rejected() {
        let socket = socket();
        let (probe, _rx) = ws_probe(&socket).await;
        socket.install_probe(probe.clone()).unwrap();
        let err = socket.process_packet(&probe, Packet::Upgrade).unwrap_err();
        assert_eq!(err, EngineError::TransportNotProbed);
        // the failing probe cancelled the upgrade
        assert!(!socket.upgrade.lock().unwrap().in_progress());
        assert!(!socket.is_closed());
    }

    #[tokio::test]
    async fn probe_ping_on_the_origin_is_rejected() {
        let socket = socket();
        let origin = current(&socket);
        let (probe, _rx) = ws_probe(&socket).await;
        socket.install_probe(probe).unwrap();
        let err = socket
            .process_packet(&origin, Packet::Ping { probe: true })
            .unwrap_err();
        assert_eq!(err, EngineError::TransportIsOrigin);
        // origin failures do not cancel the upgrade
        assert!(socket.upgrade.lock().unwrap().in_progress());
    }

    #[tokio::test]
    async fn duplicate_probe_ping_cancels_the_upgrade() {
        let socket = socket();
        let (probe, _rx) = ws_probe(&socket).await;
        let mut upgrade_errors = socket.on_upgrade_exception();
        socket.install_probe(probe.clone()).unwrap();
        socket
            .process_packet(&probe, Packet::Ping { probe: true })
            .unwrap();
        let err = socket
            .process_packet(&probe, Packet::Ping { probe: true })
            .unwrap_err();
        assert_eq!(err, EngineError::TransportAlreadyProbed);
        assert_eq!(
            upgrade_errors.recv().await.unwrap(),
            EngineError::TransportAlreadyProbed
        );
        assert!(!socket.is_closed());
    }

    #[tokio::test]
    async fn full_upgrade_swaps_the_transport_and_transfers_the_queue() {
        let socket = socket();
        let mut upgraded = socket.on_upgrade();
        socket.send(Packet::Message("queued".to_string())).unwrap();

        let (probe, mut client) = ws_probe(&socket).await;
        socket.install_probe(probe.clone()).unwrap();
        socket
            .process_packet(&probe, Packet::Ping { probe: true })
            .unwrap();
        // the pong answering the probe goes out on the probe transport
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text("3probe".to_string())
        );

        socket.process_packet(&probe, Packet::Upgrade).unwrap();
        assert_eq!(socket.transport_type(), TransportType::Websocket);
        upgraded.recv().await.unwrap();

        // the residual polling queue was carried over
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text("4queued".to_string())
        );
    }

    #[tokio::test]
    async fn sends_during_upgrade_reach_the_peer_in_order() {
        let socket = socket();
        socket.send(Packet::Message("first".to_string())).unwrap();

        let (probe, mut client) = ws_probe(&socket).await;
        socket.install_probe(probe.clone()).unwrap();
        socket
            .process_packet(&probe, Packet::Ping { probe: true })
            .unwrap();
        // still buffered on the origin while the upgrade is in flight
        socket.send(Packet::Message("second".to_string())).unwrap();
        socket.process_packet(&probe, Packet::Upgrade).unwrap();
        socket.send(Packet::Message("third".to_string())).unwrap();

        let mut texts = Vec::new();
        for _ in 0..4 {
            if let Message::Text(text) = client.next().await.unwrap().unwrap() {
                texts.push(text);
            }
        }
        assert_eq!(texts, vec!["3probe", "4first", "4second", "4third"]);
    }

    #[tokio::test]
    async fn illegal_packets_end_the_session() {
        for packet in [
            Packet::Ping { probe: false },
            Packet::Pong { probe: true },
            Packet::Noop,
        ] {
            let socket = socket();
            let origin = current(&socket);
            let mut closed = socket.on_close();
            let err = socket.process_packet(&origin, packet).unwrap_err();
            assert_eq!(err, EngineError::PacketIllegal);
            assert!(socket.is_closed());
            assert_eq!(
                closed.recv().await.unwrap(),
                DisconnectReason::PacketParsingError
            );
        }
    }

    #[tokio::test]
    async fn unexpected_pong_ends_the_session() {
        let socket = socket();
        let origin = current(&socket);
        let err = socket
            .process_packet(&origin, Packet::Pong { probe: false })
            .unwrap_err();
        assert_eq!(err, EngineError::HeartbeatUnexpected);
        assert!(socket.is_closed());
    }

    #[tokio::test]
    async fn close_packet_requests_closure() {
        let socket = socket();
        let origin = current(&socket);
        let mut closed = socket.on_close();
        let err = socket.process_packet(&origin, Packet::Close).unwrap_err();
        assert_eq!(err, EngineError::RequestedClosure);
        assert!(err.is_success());
        assert_eq!(
            closed.recv().await.unwrap(),
            DisconnectReason::TransportClose
        );
        assert!(socket
            .send(Packet::Message("late".to_string()))
            .is_err());
    }

    #[tokio::test]
    async fn closing_mid_upgrade_notifies_and_disposes_the_probe() {
        let socket = socket();
        let (probe, _rx) = ws_probe(&socket).await;
        let mut upgrade_errors = socket.on_upgrade_exception();
        socket.install_probe(probe).unwrap();
        socket.close(DisconnectReason::ClosingServer);
        assert_eq!(
            upgrade_errors.recv().await.unwrap(),
            EngineError::ConnectionClosedDuringUpgrade
        );
        assert!(!socket.upgrade.lock().unwrap().in_progress());
    }

    #[tokio::test]
    async fn message_packets_reach_the_message_stream() {
        let socket = socket();
        let origin = current(&socket);
        let mut messages = socket.on_message();
        let mut received = socket.on_receive();
        socket
            .process_packet(&origin, Packet::Message("hi".to_string()))
            .unwrap();
        socket
            .process_packet(&origin, Packet::Binary(vec![1, 2, 3]))
            .unwrap();
        assert_eq!(
            messages.recv().await.unwrap(),
            Packet::Message("hi".to_string())
        );
        assert_eq!(messages.recv().await.unwrap(), Packet::Binary(vec![1, 2, 3]));
        assert_eq!(
            received.recv().await.unwrap(),
            Packet::Message("hi".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_upgrades_time_out() {
        let socket = socket();
        let (probe, _rx) = ws_probe(&socket).await;
        let mut upgrade_errors = socket.on_upgrade_exception();
        socket.install_probe(probe).unwrap();
        tokio::time::sleep(socket.config.upgrade_timeout + std::time::Duration::from_millis(1))
            .await;
        assert_eq!(
            upgrade_errors.recv().await.unwrap(),
            EngineError::UpgradeTimedOut
        );
        assert!(!socket.upgrade.lock().unwrap().in_progress());
        assert!(!socket.is_closed());
    }
}
