//! HTTP CONNECT tunnel session handler.
//!
//! Each tethered client opens a TCP connection to the proxy and sends:
//!
//! ```text
//! CONNECT api.example.com:443 HTTP/1.1
//! Host: api.example.com:443
//!
//! ```
//!
//! The connection is served by hyper's HTTP/1 server with upgrades enabled.
//! For a CONNECT request the relay dials the target through the session's
//! [`SocketBinder`], answers `200`, and once hyper hands over the upgraded
//! connection splices it with the upstream socket. Anything else is refused
//! with a plain-text status response.
//!
//! Traffic is metered on the upstream socket as it flows, so the bytes that
//! crossed it are booked into the [`ClientHistory`] however the session ends:
//! clean close, client reset, or the session task being aborted when the proxy
//! stops.

use std::convert::Infallible;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use tetherproxy_core::{
    ByteTransferReport, ClientHistory, ClientRecord, ClientSession, EventBus,
    RefreshNotification, SessionHandler, SocketBinder,
};

/// Largest accepted request head, request line and headers together.
///
/// This is also hyper's minimum read buffer size.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

/// How long to wait for the upstream TCP handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Port used when a CONNECT authority has none.
pub const DEFAULT_TARGET_PORT: u16 = 443;

/// Relaxed is enough: counters are only read once the copy has stopped.
const METER_ORDERING: Ordering = Ordering::Relaxed;

/// Why a tunnel could not be set up or ended abnormally.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Only `CONNECT` is relayed.
    #[error("method {0} not allowed")]
    MethodNotAllowed(String),

    /// Target authority is missing or unusable.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Every resolved address refused or timed out.
    #[error("upstream {target} unreachable: {source}")]
    Upstream {
        /// The requested `host:port`.
        target: String,
        /// Last connect error.
        #[source]
        source: io::Error,
    },

    /// The HTTP/1 connection failed before or while reading the request.
    #[error("HTTP error: {0}")]
    Http(#[source] hyper::Error),

    /// hyper did not hand over the upgraded connection.
    #[error("upgrade failed: {0}")]
    Upgrade(#[source] hyper::Error),

    /// Socket failure while tunnelling.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Status sent to the client for a refused request.
    #[must_use]
    pub const fn status(&self) -> Option<StatusCode> {
        match self {
            Self::MethodNotAllowed(_) => Some(StatusCode::METHOD_NOT_ALLOWED),
            Self::InvalidTarget(_) => Some(StatusCode::BAD_REQUEST),
            Self::Upstream { .. } => Some(StatusCode::BAD_GATEWAY),
            Self::Http(_) | Self::Upgrade(_) | Self::Io(_) => None,
        }
    }

    /// Whether this is a routine client hang-up rather than a fault.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Http(e) => e.is_incomplete_message() || e.is_closed(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// `host:port` requested by a CONNECT line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Host name or IP literal, without IPv6 brackets.
    pub host: String,
    /// Target port; [`DEFAULT_TARGET_PORT`] when the request omits it.
    pub port: u16,
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Resolve the tunnel target of a request, accepting only `CONNECT`.
///
/// # Errors
///
/// `MethodNotAllowed` for anything but `CONNECT`, `InvalidTarget` when the
/// request target has no authority, an empty host, or port 0.
pub fn connect_target(method: &Method, uri: &Uri) -> Result<ConnectTarget, RelayError> {
    if *method != Method::CONNECT {
        return Err(RelayError::MethodNotAllowed(method.to_string()));
    }

    let authority = uri
        .authority()
        .ok_or_else(|| RelayError::InvalidTarget(uri.to_string()))?;
    let host = authority.host();
    let host = host
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(host);
    let port = authority.port_u16().unwrap_or(DEFAULT_TARGET_PORT);

    if host.is_empty() || port == 0 {
        return Err(RelayError::InvalidTarget(authority.to_string()));
    }
    Ok(ConnectTarget {
        host: host.to_string(),
        port,
    })
}

// =============================================================================
// TRAFFIC METERING
// =============================================================================

/// Byte counters for one tunnel.
///
/// Downloads are bytes read from the upstream socket, uploads are bytes
/// written to it.
#[derive(Debug, Default)]
pub struct TrafficMeter {
    downloaded: AtomicU64,
    uploaded: AtomicU64,
}

impl TrafficMeter {
    /// Counts so far.
    #[must_use]
    pub fn report(&self) -> ByteTransferReport {
        ByteTransferReport::new(
            self.downloaded.load(METER_ORDERING),
            self.uploaded.load(METER_ORDERING),
        )
    }
}

/// Stream wrapper that adds every transferred byte to a [`TrafficMeter`].
pub struct MeteredStream<S> {
    inner: S,
    meter: Arc<TrafficMeter>,
}

impl<S> MeteredStream<S> {
    /// Meter `inner` into `meter`.
    pub const fn new(inner: S, meter: Arc<TrafficMeter>) -> Self {
        Self { inner, meter }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            let read = (buf.filled().len() - before) as u64;
            self.meter.downloaded.fetch_add(read, METER_ORDERING);
        }
        polled
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let polled = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = polled {
            self.meter.uploaded.fetch_add(written as u64, METER_ORDERING);
        }
        polled
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Books a session's metered traffic exactly once.
///
/// [`Self::settle`] books inline. If the session future is dropped first,
/// for example because the proxy aborted it, the drop books on a spawned task.
struct SessionLedger {
    history: Arc<ClientHistory>,
    client_key: String,
    refresh_bus: EventBus<RefreshNotification>,
    meter: Arc<TrafficMeter>,
    settled: bool,
}

impl SessionLedger {
    fn new(
        history: Arc<ClientHistory>,
        client_key: String,
        refresh_bus: EventBus<RefreshNotification>,
    ) -> Self {
        Self {
            history,
            client_key,
            refresh_bus,
            meter: Arc::new(TrafficMeter::default()),
            settled: false,
        }
    }

    fn meter(&self) -> Arc<TrafficMeter> {
        Arc::clone(&self.meter)
    }

    async fn settle(mut self) -> Option<(ByteTransferReport, ClientRecord)> {
        let report = self.meter.report();
        let record = if report.is_empty() {
            None
        } else {
            Some(book(&self.history, &self.client_key, report, &self.refresh_bus).await)
        };
        self.settled = true;
        record.map(|record| (report, record))
    }
}

impl Drop for SessionLedger {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let report = self.meter.report();
        if report.is_empty() {
            return;
        }

        let history = Arc::clone(&self.history);
        let client_key = std::mem::take(&mut self.client_key);
        let refresh_bus = self.refresh_bus.clone();
        match Handle::try_current() {
            Ok(handle) => {
                debug!(client = %client_key, "Session interrupted; booking metered traffic");
                handle.spawn(async move {
                    book(&history, &client_key, report, &refresh_bus).await;
                });
            }
            Err(_) => warn!(
                client = %client_key,
                download = report.internet_to_proxy,
                upload = report.proxy_to_internet,
                "Runtime gone; session traffic not booked"
            ),
        }
    }
}

async fn book(
    history: &ClientHistory,
    client_key: &str,
    report: ByteTransferReport,
    refresh_bus: &EventBus<RefreshNotification>,
) -> ClientRecord {
    let record = history.record_report(client_key, report).await;
    refresh_bus.publish(RefreshNotification);
    record
}

// =============================================================================
// RELAY
// =============================================================================

/// Upstream socket and upgrade handle parked between the `200` and the tunnel.
struct PendingTunnel {
    target: ConnectTarget,
    upstream: TcpStream,
    on_upgrade: OnUpgrade,
}

type PendingSlot = Mutex<Option<PendingTunnel>>;

/// Session handler that tunnels CONNECT requests and books their traffic.
pub struct ConnectRelay {
    history: Arc<ClientHistory>,
    refresh_bus: EventBus<RefreshNotification>,
    connect_timeout: Duration,
}

impl ConnectRelay {
    /// Relay booking traffic into `history` and announcing it on `refresh_bus`.
    #[must_use]
    pub const fn new(
        history: Arc<ClientHistory>,
        refresh_bus: EventBus<RefreshNotification>,
    ) -> Self {
        Self {
            history,
            refresh_bus,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the upstream connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn dial(
        &self,
        target: &ConnectTarget,
        binder: &dyn SocketBinder,
    ) -> Result<TcpStream, RelayError> {
        let unreachable = |source| RelayError::Upstream {
            target: target.to_string(),
            source,
        };

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(unreachable)?
            .collect();

        let mut last_error = None;
        for addr in addrs {
            match self.connect_one(addr, binder).await {
                Ok(stream) => {
                    debug!(%addr, "Upstream connected");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "Upstream address failed");
                    last_error = Some(e);
                }
            }
        }

        Err(unreachable(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
        })))
    }

    async fn connect_one(
        &self,
        addr: SocketAddr,
        binder: &dyn SocketBinder,
    ) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        binder.bind(&socket, addr)?;

        tokio::time::timeout(self.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
    }

    /// Answer one request. A CONNECT whose upstream is reachable parks the
    /// tunnel in `pending` and gets an empty `200`.
    async fn answer(
        &self,
        mut req: Request<Incoming>,
        binder: &dyn SocketBinder,
        pending: &PendingSlot,
    ) -> Response<Full<Bytes>> {
        let target = match connect_target(req.method(), req.uri()) {
            Ok(target) => target,
            Err(e) => return refusal(&e),
        };
        debug!(%target, "CONNECT requested");

        let upstream = match self.dial(&target, binder).await {
            Ok(upstream) => upstream,
            Err(e) => return refusal(&e),
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        *pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(PendingTunnel {
            target,
            upstream,
            on_upgrade,
        });
        Response::new(Full::new(Bytes::new()))
    }

    async fn serve(
        &self,
        stream: TcpStream,
        binder: Arc<dyn SocketBinder>,
        meter: Arc<TrafficMeter>,
    ) -> Result<(), RelayError> {
        let pending: Arc<PendingSlot> = Arc::default();
        let service = {
            let pending = Arc::clone(&pending);
            service_fn(move |req: Request<Incoming>| {
                let binder = Arc::clone(&binder);
                let pending = Arc::clone(&pending);
                async move {
                    Ok::<_, Infallible>(self.answer(req, binder.as_ref(), &pending).await)
                }
            })
        };

        // Serve HTTP/1.1 with upgrades so CONNECT can take over the socket
        http1::Builder::new()
            .max_buf_size(MAX_HEAD_BYTES)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
            .map_err(RelayError::Http)?;

        let parked = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(PendingTunnel {
            target,
            upstream,
            on_upgrade,
        }) = parked
        else {
            return Ok(());
        };

        let upgraded = on_upgrade.await.map_err(RelayError::Upgrade)?;
        let mut client = TokioIo::new(upgraded);
        let mut upstream = MeteredStream::new(upstream, meter);

        let (to_upstream, to_client) =
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        debug!(%target, to_upstream, to_client, "Tunnel closed");
        Ok(())
    }
}

/// Plain-text refusal that closes the connection.
fn refusal(err: &RelayError) -> Response<Full<Bytes>> {
    warn!(error = %err, "Refusing request");

    let mut response = Response::new(Full::new(Bytes::from(format!("{err}\n"))));
    *response.status_mut() = err.status().unwrap_or(StatusCode::BAD_REQUEST);
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

#[async_trait]
impl SessionHandler for ConnectRelay {
    async fn handle(&self, session: ClientSession) {
        let ClientSession {
            stream,
            peer,
            binder,
        } = session;
        let client_key = peer.ip().to_canonical().to_string();
        let span = info_span!("relay", client = %client_key, session = %Uuid::new_v4());

        async move {
            self.history.observe(&client_key).await;
            let ledger = SessionLedger::new(
                Arc::clone(&self.history),
                client_key,
                self.refresh_bus.clone(),
            );

            match self.serve(stream, binder, ledger.meter()).await {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => debug!(error = %e, "Client disconnected"),
                Err(e) => warn!(error = %e, "Session failed"),
            }

            if let Some((report, record)) = ledger.settle().await {
                info!(
                    download = report.internet_to_proxy,
                    upload = report.proxy_to_internet,
                    total = %record.total_transfer_display(),
                    "Session finished"
                );
            }
        }
        .instrument(span)
        .await;
    }
}
