//! Access logging
//!
//! [`AccessLogLayer`] wraps a service and emits one [`AccessLogRecord`] per
//! request through an explicitly constructed [`AccessLogger`]. The record is
//! emitted once the response body has been fully sent, or when it is
//! abandoned (client disconnect), never both.

use axum::{
    body::{Body, Bytes},
    extract::ConnectInfo,
    http::{Request, Response, StatusCode},
    response::IntoResponse,
};
use futures_util::future::{BoxFuture, FutureExt};
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower::{Layer, Service};
use tracing::{debug, error, info};

/// One line of the access log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogRecord {
    /// Client address, or "-" when unknown
    pub remote_addr: String,
    pub method: String,
    /// Request URI as received (path and query)
    pub uri: String,
    /// Status sent to the client
    pub status: u16,
    /// Response body bytes sent to the client
    pub bytes: u64,
    pub duration: Duration,
}

impl fmt::Display for AccessLogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {} {} {} {:?}",
            self.remote_addr, self.method, self.uri, self.status, self.bytes, self.duration
        )
    }
}

/// Destination for access log records
pub trait LogSink: Send + Sync {
    fn emit(&self, record: &AccessLogRecord);
}

/// Writes records as `tracing` events with target `access_log`
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, record: &AccessLogRecord) {
        info!(
            target: "access_log",
            remote_addr = %record.remote_addr,
            method = %record.method,
            uri = %record.uri,
            status = record.status,
            bytes = record.bytes,
            duration_us = record.duration.as_micros() as u64,
            "{}",
            record
        );
    }
}

/// Keeps records in memory, for embedding and tests
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<AccessLogRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far
    pub fn records(&self) -> Vec<AccessLogRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, record: &AccessLogRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
    }
}

/// Default local syslog socket
#[cfg(unix)]
pub const SYSLOG_SOCKET: &str = "/dev/log";

/// daemon.info
#[cfg(unix)]
const SYSLOG_PRIORITY: u8 = (3 << 3) | 6;

/// Sends records to the local syslog daemon, facility daemon
///
/// Lines use the BSD syslog format. The socket is non-blocking; a line the
/// daemon cannot take immediately is dropped.
#[cfg(unix)]
#[derive(Debug)]
pub struct SyslogSink {
    socket: std::os::unix::net::UnixDatagram,
    tag: String,
}

#[cfg(unix)]
impl SyslogSink {
    /// Connect to the syslog socket at `path`
    pub fn connect(path: impl AsRef<std::path::Path>, tag: &str) -> std::io::Result<Self> {
        let socket = std::os::unix::net::UnixDatagram::unbound()?;
        socket.connect(path)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            tag: format!("{}[{}]", tag, std::process::id()),
        })
    }

    fn format_line(&self, record: &AccessLogRecord) -> String {
        format!(
            "<{}>{} {}: {}",
            SYSLOG_PRIORITY,
            chrono::Local::now().format("%b %e %H:%M:%S"),
            self.tag,
            record
        )
    }
}

#[cfg(unix)]
impl LogSink for SyslogSink {
    fn emit(&self, record: &AccessLogRecord) {
        if let Err(e) = self.socket.send(self.format_line(record).as_bytes()) {
            debug!("Dropped syslog access line: {}", e);
        }
    }
}

/// Handle to the access log, created once at startup
#[derive(Clone)]
pub struct AccessLogger {
    sink: Arc<dyn LogSink>,
}

impl AccessLogger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    /// Logger writing through `tracing`
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingSink))
    }

    pub fn log(&self, record: &AccessLogRecord) {
        self.sink.emit(record);
    }

    /// Tower layer logging every request of the wrapped service
    pub fn layer(&self) -> AccessLogLayer {
        AccessLogLayer {
            logger: self.clone(),
        }
    }
}

/// Layer producing [`AccessLog`] services
#[derive(Clone)]
pub struct AccessLogLayer {
    logger: AccessLogger,
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLog<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLog {
            inner,
            logger: self.logger.clone(),
        }
    }
}

/// Access logging service
#[derive(Clone)]
pub struct AccessLog<S> {
    inner: S,
    logger: AccessLogger,
}

impl<S> Service<Request<Body>> for AccessLog<S>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let start = Instant::now();
        let remote_addr = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_else(|| "-".to_string());
        let method = req.method().to_string();
        let uri = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| req.uri().to_string());

        let logger = self.logger.clone();
        let response = AssertUnwindSafe(self.inner.call(req)).catch_unwind();

        Box::pin(async move {
            let response = match response.await {
                Ok(Ok(response)) => response,
                Ok(Err(never)) => match never {},
                Err(panic) => {
                    error!(
                        method = %method,
                        uri = %uri,
                        "Request handler panicked: {}",
                        panic_message(&*panic)
                    );
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            };

            let pending = PendingRecord {
                logger,
                start,
                record: AccessLogRecord {
                    remote_addr,
                    method,
                    uri,
                    status: response.status().as_u16(),
                    bytes: 0,
                    duration: Duration::ZERO,
                },
            };

            let (parts, body) = response.into_parts();
            let body = Body::new(CountingBody {
                inner: body,
                pending: Some(pending),
            });
            Ok(Response::from_parts(parts, body))
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Record waiting for its body to finish; emitted on drop
struct PendingRecord {
    logger: AccessLogger,
    start: Instant,
    record: AccessLogRecord,
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        self.record.duration = self.start.elapsed();
        self.logger.log(&self.record);
    }
}

/// Response body that counts data bytes as they are sent
struct CountingBody {
    inner: Body,
    pending: Option<PendingRecord>,
}

impl HttpBody for CountingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_frame(cx);

        match &poll {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(data), Some(pending)) = (frame.data_ref(), this.pending.as_mut()) {
                    pending.record.bytes += data.len() as u64;
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => {
                this.pending.take();
            }
            Poll::Pending => {}
        }

        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[cfg(unix)]
    #[test]
    fn test_syslog_sink_sends_daemon_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.sock");
        let daemon = std::os::unix::net::UnixDatagram::bind(&path).unwrap();

        let sink = SyslogSink::connect(&path, "acme-proxy").unwrap();
        sink.emit(&AccessLogRecord {
            remote_addr: "192.0.2.1:5000".to_string(),
            method: "GET".to_string(),
            uri: "/foo?x=1".to_string(),
            status: 200,
            bytes: 2,
            duration: Duration::from_millis(3),
        });

        let mut buf = [0u8; 512];
        let n = daemon.recv(&mut buf).unwrap();
        let line = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(line.starts_with("<30>"));
        assert!(line.contains(&format!(" acme-proxy[{}]: ", std::process::id())));
        assert!(line.ends_with("192.0.2.1:5000 [GET] /foo?x=1 200 2 3ms"));
    }

    fn app(sink: Arc<MemorySink>) -> Router {
        Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, "nope") }),
            )
            .route(
                "/chunked",
                get(|| async {
                    let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
                        Ok(Bytes::from_static(b"abc")),
                        Ok(Bytes::from_static(b"defg")),
                        Ok(Bytes::from_static(b"h")),
                    ];
                    Body::from_stream(futures_util::stream::iter(chunks))
                }),
            )
            .route(
                "/panic",
                get(|| async {
                    if true {
                        panic!("boom");
                    }
                    "unreachable"
                }),
            )
            .fallback(|| async { (StatusCode::NOT_FOUND, "no route") })
            .layer(AccessLogger::new(sink).layer())
    }

    fn request(uri: &str) -> Request<Body> {
        let mut req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ConnectInfo("192.0.2.7:51000".parse::<SocketAddr>().unwrap()));
        req
    }

    #[test]
    fn test_record_format() {
        let record = AccessLogRecord {
            remote_addr: "192.0.2.7:51000".to_string(),
            method: "GET".to_string(),
            uri: "/foo?x=1".to_string(),
            status: 200,
            bytes: 2,
            duration: Duration::from_micros(1500),
        };
        assert_eq!(record.to_string(), "192.0.2.7:51000 [GET] /foo?x=1 200 2 1.5ms");
    }

    #[tokio::test]
    async fn test_logs_status_and_bytes_after_body() {
        let sink = Arc::new(MemorySink::new());
        let response = app(sink.clone()).oneshot(request("/ok?x=1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Nothing is logged until the body has been sent.
        assert!(sink.records().is_empty());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].remote_addr, "192.0.2.7:51000");
        assert_eq!(records[0].method, "GET");
        assert_eq!(records[0].uri, "/ok?x=1");
        assert_eq!(records[0].status, 200);
        assert_eq!(records[0].bytes, 2);
    }

    #[tokio::test]
    async fn test_counts_chunked_body() {
        let sink = Arc::new(MemorySink::new());
        let response = app(sink.clone()).oneshot(request("/chunked")).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();

        assert_eq!(body.len(), 8);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes, 8);
    }

    #[tokio::test]
    async fn test_logs_handler_status() {
        let sink = Arc::new(MemorySink::new());
        let response = app(sink.clone()).oneshot(request("/missing")).await.unwrap();
        response.into_body().collect().await.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, 404);
        assert_eq!(records[0].bytes, 4);
    }

    #[tokio::test]
    async fn test_unmatched_route_is_logged() {
        let sink = Arc::new(MemorySink::new());
        let response = app(sink.clone()).oneshot(request("/nowhere")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        drop(response);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, 404);
    }

    #[tokio::test]
    async fn test_panic_is_logged_as_500() {
        let sink = Arc::new(MemorySink::new());
        let response = app(sink.clone()).oneshot(request("/panic")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        response.into_body().collect().await.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, 500);
    }

    #[tokio::test]
    async fn test_abandoned_body_logged_once() {
        let sink = Arc::new(MemorySink::new());
        let response = app(sink.clone()).oneshot(request("/chunked")).await.unwrap();

        let mut body = response.into_body();
        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.data_ref().unwrap().len(), 3);
        drop(body);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes, 3);
    }

    #[tokio::test]
    async fn test_missing_connect_info() {
        let sink = Arc::new(MemorySink::new());
        let req = Request::builder().uri("/ok").body(Body::empty()).unwrap();
        let response = app(sink.clone()).oneshot(req).await.unwrap();
        response.into_body().collect().await.unwrap();

        assert_eq!(sink.records()[0].remote_addr, "-");
    }
}
