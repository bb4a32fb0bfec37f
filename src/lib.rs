//! Engine.IO v4 server core, exposed as a [`tower::Service`].
//!
//! Sessions open over HTTP long-polling and may upgrade to websocket; the
//! engine multiplexes packets over whichever transport the client is
//! bound to, runs the bidirectional heartbeat and surfaces per-session
//! lifecycle events to the embedding application.
//!
//! ```no_run
//! use std::convert::Infallible;
//!
//! use engineio_server::EngineIoService;
//! use hyper::service::make_service_fn;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (svc, io) = EngineIoService::new();
//!
//!     let mut connections = io.on_connect();
//!     tokio::spawn(async move {
//!         while let Ok(socket) = connections.recv().await {
//!             println!("session {} connected from {}", socket.id, socket.peer_addr);
//!         }
//!     });
//!
//!     let make_svc = make_service_fn(move |_conn| {
//!         let svc = svc.clone();
//!         async move { Ok::<_, Infallible>(svc) }
//!     });
//!     hyper::Server::bind(&([127, 0, 0, 1], 3000).into())
//!         .serve(make_svc)
//!         .await
//!         .unwrap();
//! }
//! ```
//!
//! To index sessions by their real peer address, insert a
//! [`service::PeerAddr`] extension into each request before it reaches
//! the service.

mod body;
mod engine;
mod futures;
mod heartbeat;
mod upgrade;

pub mod config;
pub mod errors;
pub mod packet;
pub mod service;
pub mod sid;
pub mod socket;
pub mod transport;

pub use body::ResponseBody;
pub use config::{ServerConfig, ServerConfigBuilder};
pub use engine::EngineIo;
pub use futures::ResponseFuture;
pub use errors::EngineError;
pub use packet::{OpenPacket, Packet, PacketType};
pub use service::{EngineIoService, PeerAddr};
pub use sid::Sid;
pub use socket::{DisconnectReason, Socket};
pub use transport::TransportType;
