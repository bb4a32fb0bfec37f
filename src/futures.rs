//! Response future and response constructors shared by the transports.
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{header, Response, StatusCode};
use pin_project::pin_project;
use tokio::sync::OwnedMutexGuard;

use crate::body::ResponseBody;
use crate::errors::EngineError;

/// The future returned by the engine service: either an immediate engine
/// response, an in-flight engine request, or the inner service's future.
#[pin_project]
pub struct ResponseFuture<F, B> {
    #[pin]
    inner: ResponseFutureInner<F, B>,
}

#[pin_project(project = FutProj)]
enum ResponseFutureInner<F, B> {
    Ready {
        response: Option<Response<ResponseBody<B>>>,
    },
    Async {
        #[pin]
        future: BoxFuture<'static, Result<Response<ResponseBody<B>>, EngineError>>,
    },
    Inner {
        #[pin]
        future: F,
    },
}

impl<F, B> ResponseFuture<F, B> {
    /// An engine response available immediately; failures become their
    /// HTTP rendering.
    pub(crate) fn ready(result: Result<Response<ResponseBody<B>>, EngineError>) -> Self {
        let response = match result {
            Ok(response) => response,
            Err(err) => err.into(),
        };
        Self {
            inner: ResponseFutureInner::Ready {
                response: Some(response),
            },
        }
    }

    pub(crate) fn async_response(
        future: BoxFuture<'static, Result<Response<ResponseBody<B>>, EngineError>>,
    ) -> Self {
        Self {
            inner: ResponseFutureInner::Async { future },
        }
    }

    pub(crate) fn new_inner(future: F) -> Self {
        Self {
            inner: ResponseFutureInner::Inner { future },
        }
    }
}

impl<F, ResBody, E> Future for ResponseFuture<F, ResBody>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = Result<Response<ResponseBody<ResBody>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().inner.project() {
            FutProj::Ready { response } => {
                Poll::Ready(Ok(response.take().expect("future polled after completion")))
            }
            FutProj::Async { future } => match future.poll(cx) {
                Poll::Ready(Ok(response)) => Poll::Ready(Ok(response)),
                Poll::Ready(Err(err)) => Poll::Ready(Ok(err.into())),
                Poll::Pending => Poll::Pending,
            },
            FutProj::Inner { future } => match future.poll(cx) {
                Poll::Ready(result) => {
                    Poll::Ready(result.map(|response| response.map(ResponseBody::new)))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Builds an engine response with an explicit content type and length.
pub(crate) fn http_response<B>(
    status: StatusCode,
    content_type: &'static str,
    data: String,
    guard: Option<OwnedMutexGuard<()>>,
) -> Result<Response<ResponseBody<B>>, EngineError> {
    let len = data.len();
    let body = match guard {
        Some(guard) => ResponseBody::custom_with_guard(Bytes::from(data), guard),
        None => ResponseBody::custom_response(Bytes::from(data)),
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, len)
        .body(body)
        .map_err(EngineError::from)
}

/// The 101 half of the websocket handshake.
pub(crate) fn ws_response<B>(accept_key: &str) -> Result<Response<ResponseBody<B>>, EngineError> {
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
        .body(ResponseBody::empty_response())
        .map_err(EngineError::from)
}

/// The CORS preflight answer of the engine endpoint.
pub(crate) fn preflight_response<B>() -> Result<Response<ResponseBody<B>>, EngineError> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST")
        .header(header::ACCESS_CONTROL_MAX_AGE, "86400")
        .body(ResponseBody::empty_response())
        .map_err(EngineError::from)
}
