use std::{
    convert::Infallible,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Request, Response};
use http_body_util::{BodyExt as _, Full};
use tonic::{body::Body, server::NamedService, Status};
use tower::Service;

/// Echoes each request's message frames back to the caller, unchanged.
///
/// Works on raw gRPC framing, so any unary method under `minigrpc.demo.Echo` answers with whatever it was sent.
#[derive(Clone, Default)]
pub struct EchoService;

impl NamedService for EchoService {
    const NAME: &'static str = "minigrpc.demo.Echo";
}

impl Service<Request<Body>> for EchoService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        Box::pin(async move {
            let payload = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(status) => return Ok(status.into_http()),
            };

            Ok(echo_response(payload))
        })
    }
}

fn echo_response(payload: Bytes) -> Response<Body> {
    let mut trailers = HeaderMap::new();
    trailers.insert("grpc-status", HeaderValue::from_static("0"));

    let body = Full::new(payload)
        .map_err(|never: Infallible| -> Status { match never {} })
        .with_trailers(async move { Some(Ok::<_, Status>(trailers)) });

    let mut response = Response::new(Body::new(body));
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("application/grpc"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_frames_with_ok_status() {
        let frame = Bytes::from_static(b"\x00\x00\x00\x00\x02hi");
        let request = Request::builder()
            .uri("/minigrpc.demo.Echo/Echo")
            .body(Body::new(Full::new(frame.clone())))
            .unwrap();

        let response = EchoService.call(request).await.unwrap();
        assert_eq!(response.headers()["content-type"], "application/grpc");

        let collected = response.into_body().collect().await.unwrap();
        assert_eq!(collected.trailers().unwrap()["grpc-status"], "0");
        assert_eq!(collected.to_bytes(), frame);
    }
}
