//! Per-request observation.
//!
//! Every request that reaches a registered service passes through [`RequestLoggingLayer`]. It logs the call and the
//! message frames flowing in both directions, and records the outcome once the response stream ends. The outcome of a
//! gRPC call is only known from its final `grpc-status`, which usually arrives in the trailers, so the response body is
//! observed rather than just the response head.
use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use http::{HeaderMap, Request, Response};
use http_body::{Body as HttpBody, Frame, SizeHint};
use metrics::{counter, histogram};
use minigrpc_io::net::demux::MuxedConnectInfo;
use pin_project::pin_project;
use tokio::time::Instant;
use tonic::{body::Body, metadata::MetadataMap, Code, Status};
use tower::{Layer, Service};
use tracing::{debug, trace, Level};

/// Number of leading bytes of each message frame included in payload logs.
const PAYLOAD_PREVIEW_LEN: usize = 64;

/// A layer that logs every gRPC call and records request metrics.
///
/// Calls are logged at debug level, along with a bounded preview of every request and response frame. Messages are
/// logged in their wire encoding, as services are opaque to the layer.
///
/// Emits `minigrpc_requests_total` (by method and status) and `minigrpc_request_duration_seconds` (by method).
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestLoggingLayer;

impl RequestLoggingLayer {
    /// Creates a new `RequestLoggingLayer`.
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestLoggingLayer {
    type Service = RequestLogging<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLogging { inner }
    }
}

/// Service produced by [`RequestLoggingLayer`].
#[derive(Clone, Debug)]
pub struct RequestLogging<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestLogging<S>
where
    S: Service<Request<Body>, Response = Response<Body>>,
    S::Error: fmt::Display,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let method = req.uri().path().to_string();
        let remote_addr = req
            .extensions()
            .get::<MuxedConnectInfo>()
            .map(|info| info.remote_addr().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        debug!(%method, %remote_addr, "Received gRPC request.");
        if tracing::enabled!(Level::TRACE) {
            let metadata = MetadataMap::from_headers(req.headers().clone());
            trace!(%method, ?metadata, "gRPC request metadata.");
        }

        let req = req.map(|body| {
            Body::new(LoggedRequestBody {
                inner: body,
                method: method.clone(),
            })
        });

        ResponseFuture {
            inner: self.inner.call(req),
            record: Some(CallRecord::new(method, remote_addr)),
        }
    }
}

/// Response future for [`RequestLogging`].
#[pin_project]
pub struct ResponseFuture<F> {
    #[pin]
    inner: F,
    record: Option<CallRecord>,
}

impl<F, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<Body>, E>>,
    E: fmt::Display,
{
    type Output = Result<Response<Body>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));

        let Some(mut record) = this.record.take() else {
            return Poll::Ready(result);
        };

        match result {
            Ok(response) => {
                // Trailers-only responses carry their status in the headers and have nothing left to observe.
                if grpc_status(response.headers()).is_some() {
                    record.complete_from(response.headers());
                    return Poll::Ready(Ok(response));
                }

                let (parts, body) = response.into_parts();
                let body = Body::new(ObservedBody { inner: body, record });
                Poll::Ready(Ok(Response::from_parts(parts, body)))
            }
            Err(e) => {
                debug!(method = %record.method, error = %e, "gRPC request failed.");
                record.complete("error");
                Poll::Ready(Err(e))
            }
        }
    }
}

/// A request body that logs each frame as the service reads it.
#[pin_project]
struct LoggedRequestBody {
    #[pin]
    inner: Body,
    method: String,
}

impl HttpBody for LoggedRequestBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));

        match &frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    let payload = PayloadPreview(data);
                    debug!(method = %this.method, len = data.len(), %payload, "gRPC request payload.");
                }
            }
            Some(Err(status)) => debug!(method = %this.method, %status, "gRPC request stream failed."),
            None => {}
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// A response body that logs each frame and completes its call record when the stream ends.
#[pin_project]
struct ObservedBody {
    #[pin]
    inner: Body,
    record: CallRecord,
}

impl HttpBody for ObservedBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));

        match &frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    let payload = PayloadPreview(data);
                    debug!(method = %this.record.method, len = data.len(), %payload, "gRPC response payload.");
                } else if let Some(trailers) = frame.trailers_ref() {
                    this.record.complete_from(trailers);
                }
            }
            Some(Err(status)) => {
                debug!(method = %this.record.method, %status, "gRPC response stream failed.");
                this.record.complete(status_label(status.code()));
            }
            None => this.record.complete("unknown"),
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

struct CallRecord {
    method: String,
    remote_addr: String,
    started: Instant,
    completed: bool,
}

impl CallRecord {
    fn new(method: String, remote_addr: String) -> Self {
        Self {
            method,
            remote_addr,
            started: Instant::now(),
            completed: false,
        }
    }

    /// Completes the record from the `grpc-status` and `grpc-message` of a trailers block.
    fn complete_from(&mut self, trailers: &HeaderMap) {
        if let Some(message) = trailers.get("grpc-message").and_then(|value| value.to_str().ok()) {
            debug!(method = %self.method, grpc_message = message, "gRPC call returned an error.");
        }

        self.complete(grpc_status(trailers).map(status_label).unwrap_or("unknown"));
    }

    fn complete(&mut self, status: &'static str) {
        if self.completed {
            return;
        }
        self.completed = true;

        let elapsed = self.started.elapsed();
        counter!("minigrpc_requests_total", "method" => self.method.clone(), "status" => status).increment(1);
        histogram!("minigrpc_request_duration_seconds", "method" => self.method.clone()).record(elapsed.as_secs_f64());

        debug!(method = %self.method, remote_addr = %self.remote_addr, status, ?elapsed, "Completed gRPC request.");
    }
}

impl Drop for CallRecord {
    fn drop(&mut self) {
        // The client went away, or the connection was torn down, before the response finished.
        self.complete("cancelled");
    }
}

/// Escaped leading bytes of a message frame.
struct PayloadPreview<'a>(&'a [u8]);

impl fmt::Display for PayloadPreview<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() > PAYLOAD_PREVIEW_LEN {
            write!(f, "{}...", self.0[..PAYLOAD_PREVIEW_LEN].escape_ascii())
        } else {
            write!(f, "{}", self.0.escape_ascii())
        }
    }
}

fn grpc_status(headers: &HeaderMap) -> Option<Code> {
    headers
        .get("grpc-status")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i32>().ok())
        .map(Code::from_i32)
}

const fn status_label(code: Code) -> &'static str {
    match code {
        Code::Ok => "ok",
        Code::Cancelled => "cancelled",
        Code::Unknown => "unknown",
        Code::InvalidArgument => "invalid_argument",
        Code::DeadlineExceeded => "deadline_exceeded",
        Code::NotFound => "not_found",
        Code::AlreadyExists => "already_exists",
        Code::PermissionDenied => "permission_denied",
        Code::ResourceExhausted => "resource_exhausted",
        Code::FailedPrecondition => "failed_precondition",
        Code::Aborted => "aborted",
        Code::OutOfRange => "out_of_range",
        Code::Unimplemented => "unimplemented",
        Code::Internal => "internal",
        Code::Unavailable => "unavailable",
        Code::DataLoss => "data_loss",
        Code::Unauthenticated => "unauthenticated",
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        io,
        sync::{Arc, Mutex},
    };

    use http_body_util::BodyExt as _;
    use metrics_util::{
        debugging::{DebugValue, DebuggingRecorder, Snapshotter},
        CompositeKey, MetricKind,
    };
    use tower::ServiceExt as _;

    use super::*;
    use crate::test_support::{grpc_frame, grpc_request, EchoService, SleepyService};

    fn run<F: Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_logs<F: FnOnce()>(f: F) -> String {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, f);
        let output = logs.0.lock().unwrap().clone();
        String::from_utf8(output).unwrap()
    }

    fn log_line<'a>(logs: &'a str, message: &str) -> &'a str {
        logs.lines()
            .find(|line| line.contains(message))
            .unwrap_or_else(|| panic!("no log line containing {:?} in:\n{}", message, logs))
    }

    fn request_count(snapshotter: &Snapshotter, method: &str, status: &str) -> u64 {
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find_map(|(key, _, _, value)| {
                let matches = key_matches(&key, "minigrpc_requests_total", method)
                    && key.key().labels().any(|l| l.key() == "status" && l.value() == status);
                match value {
                    DebugValue::Counter(n) if matches => Some(n),
                    _ => None,
                }
            })
            .unwrap_or(0)
    }

    fn has_duration(snapshotter: &Snapshotter, method: &str) -> bool {
        snapshotter.snapshot().into_vec().into_iter().any(|(key, _, _, value)| {
            key_matches(&key, "minigrpc_request_duration_seconds", method)
                && matches!(value, DebugValue::Histogram(ref samples) if !samples.is_empty())
        })
    }

    fn key_matches(key: &CompositeKey, name: &str, method: &str) -> bool {
        key.key().name() == name && key.key().labels().any(|l| l.key() == "method" && l.value() == method)
    }

    #[test]
    fn completed_call_is_recorded_with_trailer_status() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            run(async {
                let svc = RequestLoggingLayer::new().layer(EchoService::default());
                let response = svc
                    .oneshot(grpc_request("/minigrpc.test.Echo/Echo", grpc_frame(b"hello")))
                    .await
                    .unwrap();

                // Nothing is recorded until the body has been fully streamed.
                assert_eq!(request_count(&snapshotter, "/minigrpc.test.Echo/Echo", "ok"), 0);

                let collected = response.into_body().collect().await.unwrap();
                let trailers = collected.trailers().cloned().unwrap();
                assert_eq!(trailers.get("grpc-status").unwrap(), "0");
                assert_eq!(collected.to_bytes(), grpc_frame(b"hello"));
            })
        });

        assert_eq!(request_count(&snapshotter, "/minigrpc.test.Echo/Echo", "ok"), 1);
        assert!(has_duration(&snapshotter, "/minigrpc.test.Echo/Echo"));
    }

    #[test]
    fn trailers_only_response_is_recorded_immediately() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            run(async {
                let svc = RequestLoggingLayer::new().layer(tower::service_fn(|_req: Request<Body>| async {
                    let response = Response::builder()
                        .header("content-type", "application/grpc")
                        .header("grpc-status", "12")
                        .body(Body::default())
                        .unwrap();
                    Ok::<_, Infallible>(response)
                }));

                let _response = svc
                    .oneshot(grpc_request("/minigrpc.test.Echo/Missing", Bytes::new()))
                    .await
                    .unwrap();
            })
        });

        assert_eq!(request_count(&snapshotter, "/minigrpc.test.Echo/Missing", "unimplemented"), 1);
    }

    #[test]
    fn abandoned_response_is_recorded_as_cancelled() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            run(async {
                let svc = RequestLoggingLayer::new().layer(SleepyService::default());
                let call = svc.oneshot(grpc_request("/minigrpc.test.Sleepy/Sleep", grpc_frame(b"")));
                let result = tokio::time::timeout(std::time::Duration::from_millis(50), call).await;
                assert!(result.is_err());
            })
        });

        assert_eq!(request_count(&snapshotter, "/minigrpc.test.Sleepy/Sleep", "cancelled"), 1);
        assert_eq!(
            snapshotter
                .snapshot()
                .into_vec()
                .iter()
                .filter(|(key, ..)| key.kind() == MetricKind::Counter)
                .count(),
            1
        );
    }

    #[test]
    fn status_labels() {
        assert_eq!(status_label(Code::Ok), "ok");
        assert_eq!(status_label(Code::DeadlineExceeded), "deadline_exceeded");

        let mut headers = HeaderMap::new();
        assert_eq!(grpc_status(&headers), None);
        headers.insert("grpc-status", "14".parse().unwrap());
        assert_eq!(grpc_status(&headers), Some(Code::Unavailable));
    }

    #[test]
    fn payloads_are_logged_in_both_directions() {
        let logs = capture_logs(|| {
            run(async {
                let svc = RequestLoggingLayer::new().layer(EchoService::default());
                let response = svc
                    .oneshot(grpc_request("/minigrpc.test.Echo/Echo", grpc_frame(b"ping-payload")))
                    .await
                    .unwrap();
                response.into_body().collect().await.unwrap();
            })
        });

        let request = log_line(&logs, "gRPC request payload.");
        assert!(request.contains("method=/minigrpc.test.Echo/Echo"), "{}", request);
        assert!(request.contains("len=17"), "{}", request);
        assert!(request.contains("ping-payload"), "{}", request);

        let response = log_line(&logs, "gRPC response payload.");
        assert!(response.contains("ping-payload"), "{}", response);

        let completed = log_line(&logs, "Completed gRPC request.");
        assert!(completed.contains("status=\"ok\""), "{}", completed);
    }

    #[test]
    fn long_payloads_are_truncated() {
        let payload = vec![b'x'; PAYLOAD_PREVIEW_LEN * 2];
        let preview = PayloadPreview(&payload).to_string();

        assert_eq!(preview, format!("{}...", "x".repeat(PAYLOAD_PREVIEW_LEN)));
        assert_eq!(PayloadPreview(b"\0\x05hi").to_string(), "\\x00\\x05hi");
    }

    #[test]
    fn errors_are_logged() {
        let logs = capture_logs(|| {
            run(async {
                let failing = RequestLoggingLayer::new().layer(tower::service_fn(|_req: Request<Body>| async {
                    Err::<Response<Body>, _>(Status::internal("backend exploded"))
                }));
                let result = failing
                    .oneshot(grpc_request("/minigrpc.test.Echo/Echo", grpc_frame(b"")))
                    .await;
                assert!(result.is_err());

                let rejecting = RequestLoggingLayer::new().layer(tower::service_fn(|_req: Request<Body>| async {
                    Ok::<_, Infallible>(Status::permission_denied("caller-not-allowed").into_http())
                }));
                rejecting
                    .oneshot(grpc_request("/minigrpc.test.Echo/Echo", grpc_frame(b"")))
                    .await
                    .unwrap();
            })
        });

        let failed = log_line(&logs, "gRPC request failed.");
        assert!(failed.contains("backend exploded"), "{}", failed);

        let rejected = log_line(&logs, "gRPC call returned an error.");
        assert!(rejected.contains("caller-not-allowed"), "{}", rejected);
    }
}
