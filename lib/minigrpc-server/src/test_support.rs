//! Raw gRPC services and request helpers for tests.
//!
//! The services speak the gRPC wire format directly: they echo back the length-prefixed request frames and finish with
//! a `grpc-status: 0` trailer.
use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::{BufMut as _, Bytes, BytesMut};
use futures::stream;
use http::{HeaderMap, HeaderValue, Request, Response, Version};
use http_body::Frame;
use http_body_util::{BodyExt as _, Full, StreamBody};
use tokio::sync::Notify;
use tonic::{body::Body, server::NamedService, Status};
use tower::Service;

type BoxResponseFuture = Pin<Box<dyn Future<Output = Result<Response<Body>, Infallible>> + Send>>;

/// Encodes a single uncompressed gRPC message frame.
pub fn grpc_frame(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(5 + payload.len());
    frame.put_u8(0);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    frame.freeze()
}

/// Builds a native gRPC request.
pub fn grpc_request(path: &str, body: Bytes) -> Request<Body> {
    Request::builder()
        .method("POST")
        .version(Version::HTTP_2)
        .uri(path)
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(Body::new(Full::new(body)))
        .unwrap()
}

async fn echo(req: Request<Body>) -> Response<Body> {
    let payload = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(status) => return status.into_http(),
    };

    let mut trailers = HeaderMap::new();
    trailers.insert("grpc-status", HeaderValue::from_static("0"));

    let frames = vec![
        Ok::<_, Status>(Frame::data(payload)),
        Ok(Frame::trailers(trailers)),
    ];

    Response::builder()
        .header("content-type", "application/grpc")
        .body(Body::new(StreamBody::new(stream::iter(frames))))
        .unwrap()
}

/// Echoes every request back to the caller.
#[derive(Clone, Default)]
pub struct EchoService;

impl NamedService for EchoService {
    const NAME: &'static str = "minigrpc.test.Echo";
}

impl Service<Request<Body>> for EchoService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxResponseFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        Box::pin(async move { Ok(echo(req).await) })
    }
}

/// Sleeps before echoing each request back to the caller.
#[derive(Clone)]
pub struct SleepyService {
    delay: Duration,
    started: Arc<Notify>,
}

impl SleepyService {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: Arc::new(Notify::new()),
        }
    }

    /// Waits until a request has started sleeping.
    pub async fn started(&self) {
        self.started.notified().await
    }
}

impl Default for SleepyService {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

impl NamedService for SleepyService {
    const NAME: &'static str = "minigrpc.test.Sleepy";
}

impl Service<Request<Body>> for SleepyService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxResponseFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let delay = self.delay;
        let started = Arc::clone(&self.started);
        Box::pin(async move {
            started.notify_one();
            tokio::time::sleep(delay).await;
            Ok(echo(req).await)
        })
    }
}
