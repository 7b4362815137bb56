//! HTTP-upgrade handshake mimicry
//!
//! The client sends a plausible `GET` with WebSocket upgrade headers to a
//! fake host; the server validates Host/path/Upgrade and answers `101
//! Switching Protocols`, after which the raw socket carries the AEAD record
//! stream. Requests that fail validation get a decoy page and never learn a
//! tunnel exists.
//!
//! Both header parsers read with a buffer and will usually pull bytes past
//! the header boundary. Those residual bytes are the first bytes of the
//! record stream and are preserved inside [`UpgradedStream`], whose reads
//! drain the residual buffer before touching the socket. Dropping them
//! instead would silently lose the first records and the mux session would
//! stall until its keepalive timeout.

mod decoy;

pub use decoy::respond as decoy_respond;

use crate::crypto::{random_alphanum, random_hex};
use crate::transport::BoxedIo;
use bytes::BytesMut;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::timeout;
use tracing::debug;

/// Server-side deadline for reading the upgrade request
const SERVER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Client-side deadline for the upgrade response
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(25);

/// Upper bound on a header block
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// The fixed success response. The accept value is a decoy, not a real
/// WebSocket accept computation.
pub const UPGRADE_RESPONSE: &str = "HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
\r\n";

/// Handshake errors
#[derive(Debug, Error)]
pub enum MimicError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake timed out")]
    Timeout,

    #[error("Connection closed during handshake")]
    Closed,

    #[error("Header block too large")]
    HeadersTooLarge,

    #[error("Unexpected upgrade status: {0}")]
    BadStatus(u16),

    #[error("Malformed HTTP: {0}")]
    Malformed(String),

    #[error("Upgrade rejected: {0}")]
    Rejected(String),
}

/// Disguise knobs for the upgrade handshake
#[derive(Debug, Clone)]
pub struct MimicParams {
    /// Host header / SNI value
    pub fake_domain: String,
    /// Request path; a `{rand}` token is replaced with 8 random alphanumerics
    pub fake_path: String,
    /// User-Agent header
    pub user_agent: String,
    /// Extra headers, `"Name: value"` strings
    pub custom_headers: Vec<String>,
    /// Attach a random session cookie
    pub session_cookie: bool,
    /// Accepted for config compatibility; only meaningful for the
    /// request-per-batch transport, which this crate does not implement
    pub chunked: bool,
}

impl Default for MimicParams {
    fn default() -> Self {
        Self {
            fake_domain: "www.google.com".to_string(),
            fake_path: "/".to_string(),
            user_agent: crate::transport::tls::BrowserProfile::Chrome
                .user_agent()
                .to_string(),
            custom_headers: Vec::new(),
            session_cookie: false,
            chunked: false,
        }
    }
}

impl MimicParams {
    /// The validated path prefix: everything before a `{` placeholder.
    pub fn path_prefix(&self) -> &str {
        let p = self.fake_path.split('{').next().unwrap_or("/");
        if p.is_empty() {
            "/"
        } else {
            p
        }
    }
}

/// A byte pipe whose handshake is complete. Reads drain the residual bytes
/// the header parser pulled past the boundary before touching the socket.
pub struct UpgradedStream {
    io: BoxedIo,
    residual: BytesMut,
}

impl UpgradedStream {
    pub fn new(io: BoxedIo, residual: BytesMut) -> Self {
        Self { io, residual }
    }
}

impl AsyncRead for UpgradedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.residual.is_empty() {
            let n = this.residual.len().min(buf.remaining());
            buf.put_slice(&this.residual.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for UpgradedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Perform the upgrade handshake as the dialing client.
pub async fn client_handshake(
    mut io: BoxedIo,
    cfg: &MimicParams,
) -> Result<UpgradedStream, MimicError> {
    let request = build_upgrade_request(cfg);
    io.write_all(request.as_bytes()).await?;
    io.flush().await?;

    let (head, residual) = match timeout(CLIENT_READ_TIMEOUT, read_head(&mut io)).await {
        Ok(result) => result?,
        Err(_) => return Err(MimicError::Timeout),
    };

    let status = parse_status_line(&head)?;
    // 200 covers fronting middleboxes that rewrite the switching status
    if status != 101 && status != 200 {
        return Err(MimicError::BadStatus(status));
    }

    Ok(UpgradedStream::new(io, residual))
}

/// Validate an inbound request and complete the upgrade as the server. On
/// validation failure the decoy responder answers and the handshake fails
/// without hinting that a tunnel exists.
pub async fn server_handshake(
    mut io: BoxedIo,
    cfg: &MimicParams,
) -> Result<UpgradedStream, MimicError> {
    let (head, residual) = match timeout(SERVER_READ_TIMEOUT, read_head(&mut io)).await {
        Ok(result) => result?,
        Err(_) => return Err(MimicError::Timeout),
    };

    let req = parse_request_head(&head)?;
    if let Err(reason) = validate_upgrade(&req, cfg) {
        debug!("upgrade rejected ({}), serving decoy", reason);
        let _ = decoy::respond(&mut io, &req.path).await;
        return Err(MimicError::Rejected(reason));
    }

    io.write_all(UPGRADE_RESPONSE.as_bytes()).await?;
    io.flush().await?;

    Ok(UpgradedStream::new(io, residual))
}

fn build_upgrade_request(cfg: &MimicParams) -> String {
    let mut path = cfg.fake_path.clone();
    if path.is_empty() {
        path = "/".to_string();
    }
    if path.contains("{rand}") {
        path = path.replace("{rand}", &random_alphanum(8));
    }
    if !path.starts_with('/') {
        path.insert(0, '/');
    }

    let mut req = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: {}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Accept: */*\r\n\
         Accept-Language: en-US,en;q=0.9\r\n",
        path,
        cfg.fake_domain,
        cfg.user_agent,
        random_hex(16),
    );

    for header in &cfg.custom_headers {
        if let Some((name, value)) = header.split_once(':') {
            req.push_str(name.trim());
            req.push_str(": ");
            req.push_str(value.trim());
            req.push_str("\r\n");
        }
    }
    if cfg.session_cookie {
        req.push_str(&format!("Cookie: session={}\r\n", random_hex(16)));
    }

    req.push_str("\r\n");
    req
}

/// A parsed request head
struct RequestHead {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn validate_upgrade(req: &RequestHead, cfg: &MimicParams) -> Result<(), String> {
    if req.method != "GET" {
        return Err(format!("method {}", req.method));
    }

    let host = req.header("host").unwrap_or("");
    let bare_host = host.rsplit_once(':').map_or(host, |(h, port)| {
        // "[::1]:443" and "host:port" both strip; a bare IPv6 literal keeps
        // its colons because the tail is not a number
        if port.chars().all(|c| c.is_ascii_digit()) {
            h
        } else {
            host
        }
    });
    let host_ok = !cfg.fake_domain.is_empty() && bare_host == cfg.fake_domain
        || bare_host
            .trim_matches(|c| c == '[' || c == ']')
            .parse::<std::net::IpAddr>()
            .is_ok();
    if !host_ok {
        return Err(format!("host {:?}", host));
    }

    if req.header("upgrade").unwrap_or("").is_empty() {
        return Err("missing upgrade header".to_string());
    }
    let connection = req.header("connection").unwrap_or("");
    if !connection.to_ascii_lowercase().contains("upgrade") {
        return Err(format!("connection {:?}", connection));
    }

    let prefix = cfg.path_prefix();
    if !req.path.starts_with(prefix) {
        return Err(format!("path {:?}", req.path));
    }

    Ok(())
}

/// Read bytes until the end of an HTTP header block, returning the head and
/// whatever was read past the boundary.
async fn read_head(io: &mut BoxedIo) -> Result<(Vec<u8>, BytesMut), MimicError> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(end) = find_header_end(&buf) {
            let head = buf.split_to(end + 4).to_vec();
            return Ok((head, buf));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(MimicError::HeadersTooLarge);
        }
        let n = io.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(MimicError::Closed);
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_line(head: &[u8]) -> Result<u16, MimicError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| MimicError::Malformed("non-UTF8 response head".to_string()))?;
    let line = text
        .lines()
        .next()
        .ok_or_else(|| MimicError::Malformed("empty response".to_string()))?;
    line.split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| MimicError::Malformed(format!("bad status line: {:?}", line)))
}

fn parse_request_head(head: &[u8]) -> Result<RequestHead, MimicError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| MimicError::Malformed("non-UTF8 request head".to_string()))?;
    let mut lines = text.lines();

    let request_line = lines
        .next()
        .ok_or_else(|| MimicError::Malformed("empty request".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| MimicError::Malformed("missing method".to_string()))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| MimicError::Malformed("missing path".to_string()))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(RequestHead {
        method,
        path,
        headers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(raw: &str) -> RequestHead {
        parse_request_head(raw.as_bytes()).unwrap()
    }

    fn upgrade_request(host: &str, path: &str) -> String {
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
            path, host
        )
    }

    #[test]
    fn test_build_request_substitutes_rand() {
        let cfg = MimicParams {
            fake_path: "/assets/{rand}".to_string(),
            ..Default::default()
        };
        let req = build_upgrade_request(&cfg);
        let first = req.lines().next().unwrap();
        assert!(first.starts_with("GET /assets/"));
        assert!(!first.contains("{rand}"));
        let path = first.split_whitespace().nth(1).unwrap();
        assert_eq!(path.len(), "/assets/".len() + 8);
        assert!(req.contains("Upgrade: websocket\r\n"));
        assert!(req.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_build_request_custom_headers_and_cookie() {
        let cfg = MimicParams {
            custom_headers: vec!["X-Forwarded-For: 10.1.2.3".to_string()],
            session_cookie: true,
            ..Default::default()
        };
        let req = build_upgrade_request(&cfg);
        assert!(req.contains("X-Forwarded-For: 10.1.2.3\r\n"));
        assert!(req.contains("Cookie: session="));
    }

    #[test]
    fn test_validate_accepts_good_request() {
        let cfg = MimicParams {
            fake_domain: "cdn.example.com".to_string(),
            fake_path: "/api/v2/{rand}".to_string(),
            ..Default::default()
        };
        let req = head(&upgrade_request("cdn.example.com", "/api/v2/a1b2c3d4"));
        assert!(validate_upgrade(&req, &cfg).is_ok());
    }

    #[test]
    fn test_validate_accepts_ip_literal_host() {
        let cfg = MimicParams {
            fake_domain: "cdn.example.com".to_string(),
            ..Default::default()
        };
        let req = head(&upgrade_request("203.0.113.9:8443", "/"));
        assert!(validate_upgrade(&req, &cfg).is_ok());
    }

    #[test]
    fn test_validate_rejects_wrong_host() {
        let cfg = MimicParams {
            fake_domain: "cdn.example.com".to_string(),
            ..Default::default()
        };
        let req = head(&upgrade_request("evil.example.net", "/"));
        assert!(validate_upgrade(&req, &cfg).is_err());
    }

    #[test]
    fn test_validate_rejects_wrong_method_and_path() {
        let cfg = MimicParams {
            fake_domain: "cdn.example.com".to_string(),
            fake_path: "/sync/{rand}".to_string(),
            ..Default::default()
        };
        let post = parse_request_head(
            b"POST /sync/x HTTP/1.1\r\nHost: cdn.example.com\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .unwrap();
        assert!(validate_upgrade(&post, &cfg).is_err());

        let wrong_path = head(&upgrade_request("cdn.example.com", "/other"));
        assert!(validate_upgrade(&wrong_path, &cfg).is_err());
    }

    #[test]
    fn test_validate_requires_upgrade_headers() {
        let cfg = MimicParams {
            fake_domain: "cdn.example.com".to_string(),
            ..Default::default()
        };
        let req = parse_request_head(
            b"GET / HTTP/1.1\r\nHost: cdn.example.com\r\nConnection: keep-alive\r\n\r\n",
        )
        .unwrap();
        assert!(validate_upgrade(&req, &cfg).is_err());
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(
            parse_status_line(b"HTTP/1.1 101 Switching Protocols\r\n\r\n").unwrap(),
            101
        );
        assert_eq!(parse_status_line(b"HTTP/1.1 404 Not Found\r\n\r\n").unwrap(), 404);
        assert!(parse_status_line(b"garbage\r\n\r\n").is_err());
    }

    #[test]
    fn test_path_prefix() {
        let cfg = MimicParams {
            fake_path: "/cdn/{rand}".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.path_prefix(), "/cdn/");

        let plain = MimicParams::default();
        assert_eq!(plain.path_prefix(), "/");
    }

    #[tokio::test]
    async fn test_upgraded_stream_drains_residual_first() {
        let (client, mut server) = tokio::io::duplex(4096);
        server.write_all(b" more from socket").await.unwrap();

        let mut up = UpgradedStream::new(
            Box::new(client),
            BytesMut::from(&b"residual bytes"[..]),
        );
        let mut buf = vec![0u8; 14 + 17];
        up.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"residual bytes more from socket");
    }

    #[tokio::test]
    async fn test_handshake_preserves_residual_records() {
        // The peer sends the 101 response and the first record bytes in one
        // segment; the parser must hand the extra bytes back untouched.
        let (client, mut server) = tokio::io::duplex(8192);
        let trailing = b"\x00\x00\x00\x05hello";

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = server.read(&mut buf).await.unwrap();
            assert!(String::from_utf8_lossy(&buf[..n]).starts_with("GET /"));

            let mut burst = Vec::from(UPGRADE_RESPONSE.as_bytes());
            burst.extend_from_slice(trailing);
            server.write_all(&burst).await.unwrap();
            server
        });

        let up = client_handshake(Box::new(client), &MimicParams::default())
            .await
            .unwrap();
        let _server = server_task.await.unwrap();

        let mut up = up;
        let mut buf = vec![0u8; trailing.len()];
        up.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, trailing);
    }

    #[tokio::test]
    async fn test_server_handshake_rejects_probe_with_decoy() {
        let (client, server) = tokio::io::duplex(8192);
        let cfg = MimicParams {
            fake_domain: "cdn.example.com".to_string(),
            ..Default::default()
        };

        let server_task =
            tokio::spawn(async move { server_handshake(Box::new(server), &cfg).await });

        let mut client = client;
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => response.extend_from_slice(&buf[..n]),
                _ => break,
            }
        }
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("Server: nginx/1.18.0"));
        assert!(text.contains("Welcome to nginx!"));

        assert!(matches!(
            server_task.await.unwrap(),
            Err(MimicError::Rejected(_))
        ));
    }
}
