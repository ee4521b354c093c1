//! One client connection, end to end: parse, authenticate, dial, pump, close.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::auth::{BasicCredentials, CredentialError, CredentialVerifier};
use crate::buffer_pool::BufferLease;
use crate::connection::SessionGuard;
use crate::downstream::{DownstreamConnector, DownstreamError, DownstreamStream};
use crate::quota::QuotaEnforcer;
use crate::request::{read_connect_request, ParseError};
use crate::response::{
    connection_established_response, proxy_auth_required_response, send_response,
    status_response,
};
use crate::session::new_session_id;
use crate::traffic::{record_session, TrafficCounters};

/// Sessions moving more than this are logged at info on close
const LARGE_TRANSFER_BYTES: u64 = 10 * 1024 * 1024;

/// Everything a session needs, shared by all sessions
pub struct Gateway {
    pub verifier: CredentialVerifier,
    pub quota: QuotaEnforcer,
    pub downstream: DownstreamConnector,
    /// Realm named in the 407 challenge
    pub realm: String,
    /// Deadline covering request parsing, authentication and the downstream
    /// handshake; `None` waits forever
    pub handshake_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Parsing,
    Authenticating,
    Dialing,
    Tunneling,
    Closed,
    Error,
}

/// Why a session ended before reaching the tunnel
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("malformed request: {0}")]
    MalformedRequest(#[source] ParseError),

    #[error("unusable request: {0}")]
    Parse(#[source] ParseError),

    #[error("bad credential encoding: {0}")]
    BadCredentialEncoding(#[from] CredentialError),

    #[error("credential verification failed for {identity}")]
    VerificationFailed { identity: String },

    #[error("downstream unavailable: {0}")]
    DownstreamUnavailable(#[from] DownstreamError),

    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("client i/o error: {0}")]
    Io(#[from] io::Error),
}

impl From<ParseError> for SessionError {
    fn from(e: ParseError) -> Self {
        if e.is_malformed() {
            SessionError::MalformedRequest(e)
        } else {
            SessionError::Parse(e)
        }
    }
}

impl SessionError {
    /// Bytes owed to the client, if any.
    ///
    /// All authentication failures share one 407 so they cannot be told apart.
    pub fn response(&self, realm: &str) -> Option<String> {
        match self {
            SessionError::MalformedRequest(_) => Some(status_response(StatusCode::BAD_REQUEST)),
            SessionError::Parse(_)
            | SessionError::BadCredentialEncoding(_)
            | SessionError::VerificationFailed { .. } => Some(proxy_auth_required_response(realm)),
            SessionError::DownstreamUnavailable(_) => {
                Some(status_response(StatusCode::BAD_GATEWAY))
            }
            SessionError::HandshakeTimeout(_) | SessionError::Io(_) => None,
        }
    }
}

/// Tunnel direction; upstream is client → downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upstream,
    Downstream,
}

impl Direction {
    fn record(self, counters: &TrafficCounters, n: u64) {
        match self {
            Direction::Upstream => counters.add_upstream(n),
            Direction::Downstream => counters.add_downstream(n),
        }
    }
}

/// How one byte pump stopped
#[derive(Debug)]
pub enum PumpEnd {
    Eof,
    QuotaExceeded { total: u64 },
    ReadError(io::Error),
    WriteError(io::Error),
    /// The other pump ended first
    Cancelled,
}

struct TunnelSession {
    gateway: Arc<Gateway>,
    state: SessionState,
    counters: Arc<TrafficCounters>,
}

/// Serve one accepted client connection to completion
pub async fn run_session(gateway: Arc<Gateway>, stream: TcpStream, peer: SocketAddr) {
    let _guard = SessionGuard::new();
    let id = new_session_id();
    let span = info_span!("session", %id, %peer);

    let mut session = TunnelSession {
        gateway,
        state: SessionState::Parsing,
        counters: TrafficCounters::new(),
    };
    session.run(stream).instrument(span).await;
}

impl TunnelSession {
    fn enter(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    async fn run(&mut self, stream: TcpStream) {
        stream.set_nodelay(true).ok();
        let (read_half, mut client_writer) = stream.into_split();
        let mut client_reader = BufReader::new(read_half);

        let deadline = self.gateway.handshake_timeout;
        let handshake = self.handshake(&mut client_reader, &mut client_writer);
        let result = match deadline {
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, handshake).await;
                outcome.unwrap_or_else(|_| Err(self.deadline_error(limit)))
            }
            None => handshake.await,
        };

        match result {
            Ok((identity, downstream)) => {
                self.enter(SessionState::Tunneling);
                self.tunnel(identity, client_reader, client_writer, downstream)
                    .await;
            }
            Err(e) => {
                self.enter(SessionState::Error);
                match &e {
                    SessionError::MalformedRequest(_) | SessionError::Io(_) => {
                        debug!("Session rejected: {}", e)
                    }
                    _ => warn!("Session rejected: {}", e),
                }
                if let Some(response) = e.response(&self.gateway.realm) {
                    if let Err(e) = send_response(&mut client_writer, &response).await {
                        debug!("Failed to deliver error response: {}", e);
                    }
                }
            }
        }

        self.enter(SessionState::Closed);
    }

    /// An expired deadline while Dialing means the downstream never answered
    fn deadline_error(&self, limit: Duration) -> SessionError {
        match self.state {
            SessionState::Dialing => SessionError::DownstreamUnavailable(
                DownstreamError::Unresponsive(self.gateway.downstream.addr()),
            ),
            _ => SessionError::HandshakeTimeout(limit),
        }
    }

    /// Parsing → Authenticating → Dialing; returns the verified identity and
    /// a downstream that already confirmed the tunnel
    async fn handshake(
        &mut self,
        client_reader: &mut BufReader<OwnedReadHalf>,
        client_writer: &mut OwnedWriteHalf,
    ) -> Result<(String, DownstreamStream), SessionError> {
        let request = read_connect_request(client_reader).await?;
        debug!("CONNECT request to {}", request.target);

        self.enter(SessionState::Authenticating);
        let creds = BasicCredentials::from_header_value(&request.proxy_authorization)?;
        if !self
            .gateway
            .verifier
            .verify(&creds.identity, &creds.secret)
            .await
        {
            return Err(SessionError::VerificationFailed {
                identity: creds.identity,
            });
        }

        self.enter(SessionState::Dialing);
        let downstream = self.gateway.downstream.connect(&request.target).await?;
        send_response(client_writer, connection_established_response()).await?;
        debug!("Tunnel for {} to {} established", creds.identity, request.target);

        Ok((creds.identity, downstream))
    }

    /// Run both byte pumps until either one stops, then release both sides
    async fn tunnel(
        &mut self,
        identity: String,
        client_reader: BufReader<OwnedReadHalf>,
        client_writer: OwnedWriteHalf,
        downstream: DownstreamStream,
    ) {
        let cancel = CancellationToken::new();
        let identity: Arc<str> = Arc::from(identity);

        let upstream = tokio::spawn(
            pump(
                Direction::Upstream,
                client_reader,
                downstream.writer,
                identity.clone(),
                self.gateway.quota.clone(),
                self.counters.clone(),
                cancel.clone(),
            )
            .in_current_span(),
        );
        let down_end = pump(
            Direction::Downstream,
            downstream.reader,
            client_writer,
            identity.clone(),
            self.gateway.quota.clone(),
            self.counters.clone(),
            cancel.clone(),
        )
        .await;
        let up_end = match upstream.await {
            Ok(end) => end,
            Err(e) => {
                warn!("Upstream pump task failed: {}", e);
                PumpEnd::Cancelled
            }
        };

        let (up, down) = self.counters.get();
        record_session(&self.counters);
        if up + down > LARGE_TRANSFER_BYTES {
            info!(
                "Tunnel for {} completed large transfer: {}↑ {}↓ bytes",
                identity, up, down
            );
        }
        log_pump_end(Direction::Upstream, &up_end);
        log_pump_end(Direction::Downstream, &down_end);
        debug!(up, down, "Tunnel for {} closed", identity);
    }
}

fn log_pump_end(direction: Direction, end: &PumpEnd) {
    match end {
        PumpEnd::ReadError(e) => debug!(?direction, "Pump stopped on read error: {}", e),
        PumpEnd::WriteError(e) => debug!(?direction, "Pump stopped on write error: {}", e),
        PumpEnd::QuotaExceeded { total } => debug!(?direction, total, "Pump stopped by quota"),
        PumpEnd::Eof => debug!(?direction, "Pump reached EOF"),
        PumpEnd::Cancelled => {}
    }
}

/// Copy `reader` to `writer`, charging every chunk to `identity` before it
/// is written.
///
/// Any stop condition cancels `cancel`, which stops the opposite pump at its
/// next read, quota check or write.
pub async fn pump<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    identity: Arc<str>,
    quota: QuotaEnforcer,
    counters: Arc<TrafficCounters>,
    cancel: CancellationToken,
) -> PumpEnd
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut lease = BufferLease::new();
    let buf = lease.as_mut_slice();

    let end = loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            res = reader.read(&mut buf[..]) => res,
        };
        let n = match read {
            Ok(0) => break PumpEnd::Eof,
            Ok(n) => n,
            Err(e) => break PumpEnd::ReadError(e),
        };

        let admission = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            admission = quota.admit(&identity, n as u64) => admission,
        };
        if admission.exceeded {
            warn!(
                ?direction,
                "Quota exceeded for {}: {} > {} bytes, closing tunnel",
                identity,
                admission.total,
                quota.limit_bytes()
            );
            break PumpEnd::QuotaExceeded {
                total: admission.total,
            };
        }

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpEnd::Cancelled,
            res = writer.write_all(&buf[..n]) => res,
        };
        if let Err(e) = written {
            break PumpEnd::WriteError(e);
        }
        direction.record(&counters, n as u64);
    };

    cancel.cancel();
    if let Err(e) = writer.shutdown().await {
        debug!(?direction, "Shutdown after pump end: {}", e);
    }
    end
}
