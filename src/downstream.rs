use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, Chain};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::Auth;
use crate::request::MAX_HEADER_LINES;

/// Largest downstream response head accepted before giving up
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Error type for downstream dial and handshake
#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    #[error("failed to connect to downstream {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("downstream connect to {0} timed out")]
    DialTimeout(SocketAddr),

    #[error("downstream {0} did not answer the CONNECT in time")]
    Unresponsive(SocketAddr),

    #[error("downstream handshake failed: {0}")]
    Handshake(#[from] std::io::Error),

    #[error("downstream sent an invalid response: {0}")]
    BadResponse(String),

    #[error("downstream refused the tunnel with status {0}")]
    Rejected(StatusCode),
}

pub type DownstreamResult<T> = Result<T, DownstreamError>;

/// Bytes the downstream sent after its response head, then the socket
pub type DownstreamReader = Chain<Cursor<Vec<u8>>, OwnedReadHalf>;

/// An established downstream tunnel, split for the two pumps
pub struct DownstreamStream {
    pub reader: DownstreamReader,
    pub writer: OwnedWriteHalf,
}

/// Opens tunnels to the fixed downstream proxy using the gateway credential
#[derive(Debug, Clone)]
pub struct DownstreamConnector {
    addr: SocketAddr,
    auth: Auth,
    connect_timeout: Duration,
}

impl DownstreamConnector {
    pub fn new(addr: SocketAddr, auth: Auth, connect_timeout: Duration) -> Self {
        Self {
            addr,
            auth,
            connect_timeout,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Dial the downstream and complete a CONNECT handshake for `target`
    pub async fn connect(&self, target: &str) -> DownstreamResult<DownstreamStream> {
        let stream = self.dial().await?;
        let (mut read_half, mut writer) = stream.into_split();

        writer
            .write_all(self.connect_request(target).as_bytes())
            .await?;
        writer.flush().await?;

        let (status, rest) = read_response_head(&mut read_half).await?;
        if !status.is_success() {
            return Err(DownstreamError::Rejected(status));
        }
        debug!("Downstream {} accepted tunnel to {}", self.addr, target);

        Ok(DownstreamStream {
            reader: Cursor::new(rest).chain(read_half),
            writer,
        })
    }

    async fn dial(&self) -> DownstreamResult<TcpStream> {
        let connect = TcpStream::connect(self.addr);
        let stream = if self.connect_timeout.is_zero() {
            connect.await
        } else {
            tokio::time::timeout(self.connect_timeout, connect)
                .await
                .map_err(|_| DownstreamError::DialTimeout(self.addr))?
        }
        .map_err(|source| DownstreamError::Dial {
            addr: self.addr,
            source,
        })?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    /// The client's target with the gateway's own credential
    fn connect_request(&self, target: &str) -> String {
        format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Authorization: {}\r\n\r\n",
            self.auth.basic_header_value()
        )
    }
}

/// Buffer until the response head is complete.
///
/// Returns the status and whatever tunnel bytes arrived behind the head.
async fn read_response_head<R>(reader: &mut R) -> DownstreamResult<(StatusCode, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    loop {
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(DownstreamError::Handshake(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "downstream closed before completing its response",
            )));
        }
        if let Some((len, status)) = parse_response_head(&buf)? {
            return Ok((status, buf.split_off(len)));
        }
        if buf.len() >= MAX_RESPONSE_HEAD {
            return Err(DownstreamError::BadResponse(
                "response head too large".to_string(),
            ));
        }
    }
}

/// Parse a response head, `None` while it is still incomplete
fn parse_response_head(buf: &[u8]) -> DownstreamResult<Option<(usize, StatusCode)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_LINES];
    let mut res = httparse::Response::new(&mut headers);
    match res.parse(buf) {
        Ok(httparse::Status::Partial) => Ok(None),
        Ok(httparse::Status::Complete(len)) => {
            let code = res
                .code
                .ok_or_else(|| DownstreamError::BadResponse("missing status code".to_string()))?;
            let status = StatusCode::from_u16(code)
                .map_err(|_| DownstreamError::BadResponse(format!("invalid status code {code}")))?;
            Ok(Some((len, status)))
        }
        Err(e) => Err(DownstreamError::BadResponse(e.to_string())),
    }
}
