use http::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Format a header-less status line response
pub fn status_response(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
}

/// 407 with a Basic challenge.
///
/// Every authentication failure gets exactly these bytes.
pub fn proxy_auth_required_response(realm: &str) -> String {
    let status = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
    format!(
        "HTTP/1.1 {} {}\r\nProxy-Authenticate: Basic realm=\"{}\"\r\n\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        realm
    )
}

pub fn connection_established_response() -> &'static str {
    "HTTP/1.1 200 Connection Established\r\n\r\n"
}

/// Write a response and flush it
pub async fn send_response<W>(writer: &mut W, response: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}
