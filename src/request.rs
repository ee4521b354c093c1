//! Line-oriented parser for the client's opening `CONNECT` handshake.
//!
//! The parser is a small state machine fed one line at a time, so it can be
//! driven from a socket by [`read_connect_request`] or directly from tests.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest accepted line, including the terminator
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Most header lines accepted before the blank line
pub const MAX_HEADER_LINES: usize = 64;

const CONNECT_PREFIX: &str = "CONNECT ";
const PROXY_AUTHORIZATION_PREFIX: &str = "proxy-authorization:";

/// A well-formed tunnel request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Request target exactly as the client sent it, without the version token
    pub target: String,
    /// Trimmed value of the `Proxy-Authorization` header
    pub proxy_authorization: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// First line is not `CONNECT <target>`
    #[error("malformed request line: {0:?}")]
    MalformedRequest(String),

    #[error("request carries no Proxy-Authorization header")]
    MissingCredentials,

    #[error("header section exceeds {MAX_HEADER_LINES} lines")]
    TooManyHeaders,

    #[error("header line is longer than {MAX_LINE_LENGTH} bytes or not UTF-8")]
    BadHeaderLine,

    #[error("failed to read header section: {0}")]
    Io(#[source] io::Error),
}

impl ParseError {
    /// Only a bad request line earns a 400; everything else takes the 407 path
    pub fn is_malformed(&self) -> bool {
        matches!(self, ParseError::MalformedRequest(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Done,
}

/// Incremental parser for one handshake
#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    target: Option<String>,
    proxy_authorization: Option<String>,
    header_lines: usize,
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            target: None,
            proxy_authorization: None,
            header_lines: 0,
        }
    }

    /// True once the blank line ending the header section has been seen
    pub fn is_done(&self) -> bool {
        self.state == ParseState::Done
    }

    /// Feed one line with its terminator already stripped
    pub fn feed_line(&mut self, line: &str) -> Result<(), ParseError> {
        match self.state {
            ParseState::RequestLine => {
                let target = line
                    .strip_prefix(CONNECT_PREFIX)
                    .and_then(|rest| rest.split_whitespace().next())
                    .ok_or_else(|| ParseError::MalformedRequest(line.to_string()))?;
                self.target = Some(target.to_string());
                self.state = ParseState::Headers;
            }
            ParseState::Headers => {
                if line.is_empty() {
                    self.state = ParseState::Done;
                    return Ok(());
                }
                self.header_lines += 1;
                if self.header_lines > MAX_HEADER_LINES {
                    return Err(ParseError::TooManyHeaders);
                }
                if let Some(value) = header_value(line, PROXY_AUTHORIZATION_PREFIX) {
                    self.proxy_authorization = Some(value.to_string());
                }
            }
            ParseState::Done => {}
        }
        Ok(())
    }

    /// Close the parse; end of input inside the header section counts as the
    /// blank line.
    pub fn finish(self) -> Result<ConnectRequest, ParseError> {
        let target = match self.target {
            Some(target) => target,
            None => return Err(ParseError::MalformedRequest(String::new())),
        };
        match self.proxy_authorization {
            Some(value) if !value.is_empty() => Ok(ConnectRequest {
                target,
                proxy_authorization: value,
            }),
            _ => Err(ParseError::MissingCredentials),
        }
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Case-insensitive `name:` match returning the trimmed value
fn header_value<'a>(line: &'a str, lowercase_prefix: &str) -> Option<&'a str> {
    let head = line.get(..lowercase_prefix.len())?;
    if head.eq_ignore_ascii_case(lowercase_prefix) {
        Some(line[lowercase_prefix.len()..].trim())
    } else {
        None
    }
}

/// Read a single line of at most [`MAX_LINE_LENGTH`] bytes.
///
/// Returns `Ok(None)` on a clean end of input before any byte was read.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::with_capacity(128);
    let n = (&mut *reader)
        .take(MAX_LINE_LENGTH as u64)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        if n >= MAX_LINE_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "line exceeds maximum length",
            ));
        }
    } else {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Read the request line and header section from a fresh client connection.
///
/// Bytes after the blank line stay buffered in `reader`.
pub async fn read_connect_request<R>(reader: &mut R) -> Result<ConnectRequest, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut parser = RequestParser::new();

    // Any failure to obtain the first line is a malformed request
    match read_line(reader).await {
        Ok(Some(line)) => parser.feed_line(&line)?,
        Ok(None) => return Err(ParseError::MalformedRequest(String::new())),
        Err(e) => return Err(ParseError::MalformedRequest(e.to_string())),
    }

    while !parser.is_done() {
        match read_line(reader).await {
            Ok(Some(line)) => parser.feed_line(&line)?,
            Ok(None) => break,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(ParseError::BadHeaderLine)
            }
            Err(e) => return Err(ParseError::Io(e)),
        }
    }

    parser.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(input: &str) -> Result<ConnectRequest, ParseError> {
        let mut reader = BufReader::new(input.as_bytes());
        read_connect_request(&mut reader).await
    }

    #[tokio::test]
    async fn test_well_formed_request() {
        let req = parse(
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\
             Proxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n\r\n",
        )
        .await
        .expect("request should parse");

        assert_eq!(req.target, "example.com:443");
        assert_eq!(req.proxy_authorization, "Basic YWxpY2U6c2VjcmV0");
    }

    #[tokio::test]
    async fn test_header_name_is_case_insensitive() {
        let req = parse("CONNECT a:1\r\nPROXY-AUTHORIZATION:   Basic abc  \r\n\r\n")
            .await
            .expect("request should parse");

        assert_eq!(req.proxy_authorization, "Basic abc");
    }

    #[tokio::test]
    async fn test_last_authorization_header_wins() {
        let req = parse(
            "CONNECT a:1\r\nProxy-Authorization: Basic first\r\n\
             proxy-authorization: Basic second\r\n\r\n",
        )
        .await
        .expect("request should parse");

        assert_eq!(req.proxy_authorization, "Basic second");
    }

    #[tokio::test]
    async fn test_bare_newlines_accepted() {
        let req = parse("CONNECT a:1\nProxy-Authorization: Basic x\n\n")
            .await
            .expect("request should parse");
        assert_eq!(req.target, "a:1");
    }

    #[tokio::test]
    async fn test_non_connect_is_malformed() {
        let err = parse("GET / HTTP/1.1\r\n\r\n").await.unwrap_err();
        assert!(err.is_malformed());

        let err = parse("connect a:1\r\n\r\n").await.unwrap_err();
        assert!(err.is_malformed());

        let err = parse("CONNECT \r\n\r\n").await.unwrap_err();
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn test_empty_input_is_malformed() {
        let err = parse("").await.unwrap_err();
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let err = parse("CONNECT a:1 HTTP/1.1\r\nHost: a:1\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::MissingCredentials));
    }

    #[tokio::test]
    async fn test_eof_in_headers_ends_section() {
        let req = parse("CONNECT a:1\r\nProxy-Authorization: Basic x\r\n")
            .await
            .expect("eof should end the header section");
        assert_eq!(req.proxy_authorization, "Basic x");

        let err = parse("CONNECT a:1\r\n").await.unwrap_err();
        assert!(matches!(err, ParseError::MissingCredentials));
    }

    #[tokio::test]
    async fn test_too_many_headers() {
        let mut input = String::from("CONNECT a:1\r\n");
        for i in 0..=MAX_HEADER_LINES {
            input.push_str(&format!("X-Filler-{i}: 1\r\n"));
        }
        input.push_str("Proxy-Authorization: Basic x\r\n\r\n");

        let err = parse(&input).await.unwrap_err();
        assert!(matches!(err, ParseError::TooManyHeaders));
        assert!(!err.is_malformed());
    }

    #[tokio::test]
    async fn test_overlong_lines() {
        let long = "a".repeat(MAX_LINE_LENGTH + 10);

        let err = parse(&format!("CONNECT {long}\r\n\r\n")).await.unwrap_err();
        assert!(err.is_malformed());

        let err = parse(&format!("CONNECT a:1\r\nX-Long: {long}\r\n\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::BadHeaderLine));
    }

    #[tokio::test]
    async fn test_trailing_bytes_stay_buffered() {
        let mut reader = BufReader::new(
            &b"CONNECT a:1\r\nProxy-Authorization: Basic x\r\n\r\nearly tunnel bytes"[..],
        );
        read_connect_request(&mut reader)
            .await
            .expect("request should parse");

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "early tunnel bytes");
    }

    #[test]
    fn test_parser_state_machine_directly() {
        let mut parser = RequestParser::new();
        parser.feed_line("CONNECT host:8080 HTTP/1.0").unwrap();
        assert!(!parser.is_done());
        parser.feed_line("Proxy-Authorization: Basic abc").unwrap();
        parser.feed_line("").unwrap();
        assert!(parser.is_done());

        let req = parser.finish().unwrap();
        assert_eq!(req.target, "host:8080");
    }
}
