//! The tower service answering on the engine path: it classifies every
//! request as handshake, polling GET/POST, websocket upgrade or preflight
//! and dispatches it to the owning session.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::FutureExt;
use http::{Method, Request, Response};
use http_body::{Body, Full};
use tower::Service;

use crate::body::ResponseBody;
use crate::config::ServerConfig;
use crate::engine::{Engine, EngineIo};
use crate::errors::EngineError;
use crate::futures::{preflight_response, ResponseFuture};
use crate::sid::Sid;
use crate::transport::{polling, ws, TransportType};

/// The peer address of the connection a request arrived on. The embedding
/// server inserts it as a request extension; without it the engine falls
/// back to the `X-Forwarded-For` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// A [`tower::Service`] hosting one engine. Requests outside the engine
/// path go to the inner service, which by default rejects them the way
/// the engine rejects a wrong path.
pub struct EngineIoService<S = InvalidPathService> {
    inner: S,
    engine: Arc<Engine>,
}

impl EngineIoService {
    pub fn new() -> (Self, EngineIo) {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> (Self, EngineIo) {
        Self::with_inner(InvalidPathService, config)
    }
}

impl<S> EngineIoService<S> {
    /// Builds a service with a custom fallback for non-engine paths.
    pub fn with_inner(inner: S, config: ServerConfig) -> (Self, EngineIo) {
        let engine = Engine::new(config);
        let io = EngineIo(engine.clone());
        (Self { inner, engine }, io)
    }

    pub fn io(&self) -> EngineIo {
        EngineIo(self.engine.clone())
    }
}

impl<S: Clone> Clone for EngineIoService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: self.engine.clone(),
        }
    }
}

impl<ReqBody, ResBody, S> Service<Request<ReqBody>> for EngineIoService<S>
where
    ReqBody: Body + Send + Unpin + 'static,
    <ReqBody as Body>::Data: Send,
    ResBody: 'static,
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = Response<ResponseBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if !path_matches(req.uri().path(), &self.engine.config.req_path) {
            return ResponseFuture::new_inner(self.inner.call(req));
        }
        let engine = self.engine.clone();
        let method = req.method().clone();

        if method == Method::OPTIONS {
            return ResponseFuture::ready(preflight_response());
        }
        if method != Method::GET && method != Method::POST {
            return ResponseFuture::ready(Err(EngineError::MethodNotAllowed));
        }

        let info = match RequestInfo::parse(&req, &engine.config) {
            Ok(info) => info,
            Err(err) => return ResponseFuture::ready(Err(err)),
        };

        match (info.transport, info.sid) {
            (TransportType::Polling, None) if method == Method::GET => {
                let peer_addr = peer_ip(&req);
                ResponseFuture::ready(polling::open_req(&engine, peer_addr))
            }
            (TransportType::Polling, Some(sid)) if method == Method::GET => {
                ResponseFuture::ready(polling::polling_req(&engine, sid))
            }
            (TransportType::Polling, Some(sid)) if method == Method::POST => {
                ResponseFuture::async_response(polling::post_req(engine, sid, req).boxed())
            }
            (TransportType::Polling, None) => {
                ResponseFuture::ready(Err(EngineError::SessionIdRequired))
            }
            // method is GET or POST here, so the guarded arms above cover
            // every (polling, sid) request
            (TransportType::Polling, Some(_)) => unreachable!(),
            (TransportType::Websocket, Some(sid)) if method == Method::GET => {
                ResponseFuture::ready(ws::upgrade_req(&engine, sid, req))
            }
            (TransportType::Websocket, None) if method == Method::GET => {
                ResponseFuture::ready(Err(EngineError::UpgradeRequestUnexpected))
            }
            (TransportType::Websocket, _) => {
                ResponseFuture::ready(Err(EngineError::TransportMismatch))
            }
        }
    }
}

/// Mandatory and optional query parameters of an engine request, already
/// validated against the server configuration.
struct RequestInfo {
    transport: TransportType,
    sid: Option<Sid>,
}

impl RequestInfo {
    fn parse<B>(req: &Request<B>, config: &ServerConfig) -> Result<Self, EngineError> {
        let query = req.uri().query().unwrap_or("");
        let mut eio = None;
        let mut transport = None;
        let mut sid = None;
        for pair in query.split('&') {
            let mut parts = pair.splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some("EIO"), Some(value)) => eio = Some(value),
                (Some("transport"), Some(value)) => transport = Some(value),
                (Some("sid"), Some(value)) => sid = Some(value),
                _ => {}
            }
        }

        let (eio, transport) = match (eio, transport) {
            (Some(eio), Some(transport)) => (eio, transport),
            _ => return Err(EngineError::MissingQueryParameters),
        };

        let version: u64 = eio
            .parse()
            .map_err(|_| EngineError::ProtocolVersionInvalid)?;
        if version == 0 {
            return Err(EngineError::ProtocolVersionInvalid);
        }
        if version != 4 {
            return Err(EngineError::ProtocolVersionUnsupported);
        }

        let transport: TransportType = transport.parse()?;
        if !config.transports.contains(&transport) {
            return Err(EngineError::TransportUnavailable);
        }

        let sid = sid.map(|s| s.parse()).transpose()?;
        Ok(RequestInfo { transport, sid })
    }
}

fn path_matches(path: &str, req_path: &str) -> bool {
    path.trim_end_matches('/') == req_path.trim_end_matches('/')
}

/// The peer IP a session is indexed under: the connection address when
/// the embedding server provides one, else the first forwarded hop.
fn peer_ip<B>(req: &Request<B>) -> IpAddr {
    if let Some(PeerAddr(addr)) = req.extensions().get::<PeerAddr>() {
        return addr.ip();
    }
    if let Some(addr) = req.extensions().get::<SocketAddr>() {
        return addr.ip();
    }
    req.headers()
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// The default fallback: every request outside the engine path is turned
/// away with the engine's own rejection.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvalidPathService;

impl<ReqBody> Service<Request<ReqBody>> for InvalidPathService {
    type Response = Response<Full<Bytes>>;
    type Error = std::convert::Infallible;
    type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<ReqBody>) -> Self::Future {
        let err = EngineError::InvalidServerPath;
        let mut res = Response::new(Full::new(Bytes::from(err.to_string())));
        *res.status_mut() = err.status_code();
        std::future::ready(Ok(res))
    }
}
