//! Body wrapper unifying engine responses with those of the inner service.
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::HeaderMap;
use http_body::{Body, Empty, Full, SizeHint};
use pin_project::pin_project;
use tokio::sync::OwnedMutexGuard;

/// The response body of the engine service.
///
/// A body can carry a polling `get` gate guard; the gate releases when the
/// response has been written and the body is dropped.
#[pin_project]
pub struct ResponseBody<B> {
    #[pin]
    inner: ResponseBodyInner<B>,
    guard: Option<OwnedMutexGuard<()>>,
}

#[pin_project(project = BodyProj)]
enum ResponseBodyInner<B> {
    Empty {
        #[pin]
        body: Empty<Bytes>,
    },
    Custom {
        #[pin]
        body: Full<Bytes>,
    },
    Inner {
        #[pin]
        body: B,
    },
}

impl<B> ResponseBody<B> {
    pub(crate) fn empty_response() -> Self {
        Self {
            inner: ResponseBodyInner::Empty { body: Empty::new() },
            guard: None,
        }
    }

    pub(crate) fn custom_response(data: Bytes) -> Self {
        Self {
            inner: ResponseBodyInner::Custom {
                body: Full::new(data),
            },
            guard: None,
        }
    }

    pub(crate) fn custom_with_guard(data: Bytes, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            inner: ResponseBodyInner::Custom {
                body: Full::new(data),
            },
            guard: Some(guard),
        }
    }

    pub(crate) fn new(body: B) -> Self {
        Self {
            inner: ResponseBodyInner::Inner { body },
            guard: None,
        }
    }
}

impl<B> Body for ResponseBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        match self.project().inner.project() {
            BodyProj::Empty { body } => body
                .poll_data(cx)
                .map(|opt| opt.map(|res| res.map_err(|err| match err {}))),
            BodyProj::Custom { body } => body
                .poll_data(cx)
                .map(|opt| opt.map(|res| res.map_err(|err| match err {}))),
            BodyProj::Inner { body } => body.poll_data(cx),
        }
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        match self.project().inner.project() {
            BodyProj::Empty { body } => {
                body.poll_trailers(cx).map_err(|err| match err {})
            }
            BodyProj::Custom { body } => {
                body.poll_trailers(cx).map_err(|err| match err {})
            }
            BodyProj::Inner { body } => body.poll_trailers(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            ResponseBodyInner::Empty { body } => body.is_end_stream(),
            ResponseBodyInner::Custom { body } => body.is_end_stream(),
            ResponseBodyInner::Inner { body } => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            ResponseBodyInner::Empty { body } => body.size_hint(),
            ResponseBodyInner::Custom { body } => body.size_hint(),
            ResponseBodyInner::Inner { body } => body.size_hint(),
        }
    }
}
