use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::broadcast;

use crate::config::ServerConfig;
use crate::errors::EngineError;
use crate::packet::Packet;
use crate::sid::Sid;
use crate::socket::{DisconnectReason, Socket};

/// Both session indexes live behind one lock so they move together:
/// every address entry points at a registered session and back.
#[derive(Default)]
struct Indices {
    sessions: HashMap<Sid, Arc<Socket>>,
    by_addr: HashMap<IpAddr, Sid>,
}

pub(crate) struct ClientManager {
    indices: RwLock<Indices>,
}

impl ClientManager {
    fn new() -> Self {
        Self {
            indices: RwLock::new(Indices::default()),
        }
    }

    fn add(&self, socket: Arc<Socket>) {
        let mut indices = self.indices.write().unwrap();
        indices.by_addr.insert(socket.peer_addr, socket.id);
        indices.sessions.insert(socket.id, socket);
    }

    fn get(&self, sid: Sid) -> Option<Arc<Socket>> {
        self.indices.read().unwrap().sessions.get(&sid).cloned()
    }

    fn sid_by_addr(&self, addr: IpAddr) -> Option<Sid> {
        self.indices.read().unwrap().by_addr.get(&addr).copied()
    }

    fn remove(&self, sid: Sid) -> Option<Arc<Socket>> {
        let mut indices = self.indices.write().unwrap();
        let socket = indices.sessions.remove(&sid)?;
        indices.by_addr.remove(&socket.peer_addr);
        Some(socket)
    }

    fn sockets(&self) -> Vec<Arc<Socket>> {
        self.indices
            .read()
            .unwrap()
            .sessions
            .values()
            .cloned()
            .collect()
    }
}

/// The shared state of one server: configuration, the session indexes and
/// the connect stream.
pub(crate) struct Engine {
    pub(crate) config: Arc<ServerConfig>,
    clients: ClientManager,
    connect: broadcast::Sender<Arc<Socket>>,
    weak_self: Weak<Engine>,
}

impl Engine {
    pub(crate) fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Engine {
            config: Arc::new(config),
            clients: ClientManager::new(),
            connect: broadcast::channel(32).0,
            weak_self: weak.clone(),
        })
    }

    /// Allocates a new session on a polling transport and starts its
    /// heartbeat. A peer that already owns a session must poll it with
    /// its session id instead of handshaking again.
    pub(crate) fn create_session(&self, peer_addr: IpAddr) -> Result<Arc<Socket>, EngineError> {
        if self.clients.sid_by_addr(peer_addr).is_some() {
            return Err(EngineError::SessionIdRequired);
        }
        let socket = Socket::new_polling(
            Sid::new(),
            peer_addr,
            self.config.clone(),
            self.weak_self.clone(),
        );
        self.clients.add(socket.clone());
        socket.current_transport().heart().start();
        self.connect.send(socket.clone()).ok();
        Ok(socket)
    }

    pub(crate) fn get_socket(&self, sid: Sid) -> Option<Arc<Socket>> {
        self.clients.get(sid)
    }

    pub(crate) fn session_of_addr(&self, addr: IpAddr) -> Option<Sid> {
        self.clients.sid_by_addr(addr)
    }

    /// Deregisters a session; called by the socket as it closes.
    pub(crate) fn remove_session(&self, sid: Sid) {
        self.clients.remove(sid);
    }

    pub(crate) fn sockets(&self) -> Vec<Arc<Socket>> {
        self.clients.sockets()
    }

    pub(crate) fn subscribe_connect(&self) -> broadcast::Receiver<Arc<Socket>> {
        self.connect.subscribe()
    }

    pub(crate) fn broadcast(&self, packet: Packet) {
        for socket in self.clients.sockets() {
            socket.send(packet.clone()).ok();
        }
    }

    pub(crate) fn disconnect_all(&self, reason: DisconnectReason) {
        for socket in self.clients.sockets() {
            socket.close(reason);
        }
    }
}

/// Handle onto a running server, for the embedding application: new
/// sessions arrive on [`EngineIo::on_connect`], existing ones can be
/// looked up, broadcast to, and torn down.
#[derive(Clone)]
pub struct EngineIo(pub(crate) Arc<Engine>);

impl EngineIo {
    pub fn config(&self) -> &ServerConfig {
        &self.0.config
    }

    /// New sessions, emitted right before their handshake response goes
    /// out.
    pub fn on_connect(&self) -> broadcast::Receiver<Arc<Socket>> {
        self.0.subscribe_connect()
    }

    pub fn get_socket(&self, sid: Sid) -> Option<Arc<Socket>> {
        self.0.get_socket(sid)
    }

    pub fn sockets(&self) -> Vec<Arc<Socket>> {
        self.0.sockets()
    }

    /// Sends a packet to every connected session.
    pub fn broadcast(&self, packet: Packet) {
        self.0.broadcast(packet);
    }

    /// Disconnects every session; websocket peers receive a going-away
    /// close frame.
    pub fn close(&self) {
        self.0.disconnect_all(DisconnectReason::ClosingServer);
    }
}
