//! Proxy chains: hop descriptions, proxy list files, and the tunneling
//! connector.
//!
//! A chain is an ordered list of hops. The connector opens TCP to the first
//! hop, asks each hop in turn to connect onward to the next one, and finally
//! asks the last hop to connect to the IRC server. Supported hop protocols:
//!
//! | Kind     | Handshake                                     |
//! |----------|-----------------------------------------------|
//! | SOCKS4   | SOCKS4a CONNECT (hostname sent to the proxy)  |
//! | SOCKS5   | no-auth method, CONNECT with domain address   |
//! | HTTP     | `CONNECT host:port HTTP/1.1`                  |
//!
//! The whole attempt, handshakes included, is bounded by one timeout. The
//! finished tunnel is returned as a plain non-blocking std socket so the
//! readiness loop can take it over.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Proxy protocol spoken by one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ProxyKind {
    Socks4,
    Socks5,
    Http,
}

impl ProxyKind {
    /// Parse the one-letter alias used in proxy list files (`4`, `5`, `H`).
    pub fn from_alias(alias: &str) -> Option<Self> {
        match alias {
            "4" => Some(Self::Socks4),
            "5" => Some(Self::Socks5),
            "H" | "h" => Some(Self::Http),
            _ => None,
        }
    }

    pub fn alias(self) -> &'static str {
        match self {
            Self::Socks4 => "4",
            Self::Socks5 => "5",
            Self::Http => "H",
        }
    }
}

/// One relay in a chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProxyHop {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
}

impl ProxyHop {
    pub fn new(kind: ProxyKind, host: &str, port: u16) -> Self {
        Self {
            kind,
            host: host.to_owned(),
            port,
        }
    }

    /// A SOCKS5 hop from `host:port`.
    pub fn socks5_from_addr(addr: &str) -> Option<Self> {
        let (host, port) = split_host_port(addr)?;
        Some(Self::new(ProxyKind::Socks5, host, port))
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ProxyHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.kind.alias(), self.host, self.port)
    }
}

/// Ordered hops a connection tunnels through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProxyChain {
    hops: Vec<ProxyHop>,
}

impl ProxyChain {
    pub fn new(hops: Vec<ProxyHop>) -> Self {
        Self { hops }
    }

    pub fn hops(&self) -> &[ProxyHop] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn push(&mut self, hop: ProxyHop) {
        self.hops.push(hop);
    }

    /// Usable only when it has at least `min_len` hops.
    pub fn meets_minimum(&self, min_len: usize) -> bool {
        self.hops.len() >= min_len
    }
}

impl fmt::Display for ProxyChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hops.is_empty() {
            return write!(f, "direct");
        }
        let parts: Vec<String> = self.hops.iter().map(ProxyHop::to_string).collect();
        write!(f, "{}", parts.join(" -> "))
    }
}

fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

// ---------------------------------------------------------------------------
// Proxy list files
// ---------------------------------------------------------------------------

/// Parse a proxy list. Two line layouts are accepted:
///
/// ```text
/// 4 1.1.1.1:1234 RU -
/// 4 1234 1.1.1.1 RU -
/// ```
///
/// Blank lines are ignored, malformed lines are logged and skipped, and
/// duplicates collapse. Order of first appearance is kept.
pub fn parse_proxy_list(text: &str) -> Vec<ProxyHop> {
    let mut seen = HashSet::new();
    let mut hops = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        match parse_proxy_fields(&fields) {
            Some(hop) => {
                if seen.insert(hop.clone()) {
                    hops.push(hop);
                }
            }
            None => warn!(line = lineno + 1, "proxy: skipping malformed proxy list entry"),
        }
    }
    hops
}

fn parse_proxy_fields(fields: &[&str]) -> Option<ProxyHop> {
    let kind = ProxyKind::from_alias(fields.first()?)?;
    let second = fields.get(1)?;
    if second.contains(':') {
        let (host, port) = split_host_port(second)?;
        Some(ProxyHop::new(kind, host, port))
    } else {
        let port = second.parse().ok()?;
        let host = fields.get(2)?;
        Some(ProxyHop::new(kind, host, port))
    }
}

/// Read and parse a proxy list file.
pub fn read_proxy_list(path: &Path) -> io::Result<Vec<ProxyHop>> {
    Ok(parse_proxy_list(&std::fs::read_to_string(path)?))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a tunnel (or a circuit request) could not be set up.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("SOCKS4 proxy {hop} refused: {reason}")]
    Socks4 { hop: String, reason: String },

    #[error("SOCKS5 proxy {hop} refused: {reason}")]
    Socks5 { hop: String, reason: String },

    #[error("SOCKS5 proxy {hop} requires authentication")]
    Socks5Auth { hop: String },

    #[error("HTTP proxy {hop} refused CONNECT: {status}")]
    Http { hop: String, status: String },

    #[error("circuit control: {0}")]
    Control(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Builds a socket that tunnels through a chain to `host:port`.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn connect(
        &self,
        chain: &ProxyChain,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<std::net::TcpStream, ProxyError>;
}

/// The real SOCKS/HTTP chaining connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProxyChainConnector;

#[async_trait]
impl ChainConnector for ProxyChainConnector {
    async fn connect(
        &self,
        chain: &ProxyChain,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<std::net::TcpStream, ProxyError> {
        let stream = tokio::time::timeout(timeout, open_tunnel(chain, host, port))
            .await
            .map_err(|_| ProxyError::Timeout(timeout))??;
        let std_stream = stream.into_std()?;
        // into_std leaves the socket non-blocking, which is what the I/O loop wants.
        std_stream.set_nodelay(true)?;
        Ok(std_stream)
    }
}

async fn open_tunnel(chain: &ProxyChain, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
    let Some(first) = chain.hops().first() else {
        return Ok(TcpStream::connect((host, port)).await?);
    };

    let mut stream = TcpStream::connect(first.addr()).await?;
    debug!(hop = %first, "proxy: connected to first hop");

    // Each hop is asked to reach the next; the last one reaches the server.
    let hops = chain.hops();
    for (i, hop) in hops.iter().enumerate() {
        let (next_host, next_port) = match hops.get(i + 1) {
            Some(next) => (next.host.as_str(), next.port),
            None => (host, port),
        };
        handshake(&mut stream, hop, next_host, next_port).await?;
        debug!(hop = %hop, "proxy: tunnel to {next_host}:{next_port} established");
    }
    Ok(stream)
}

async fn handshake(
    stream: &mut TcpStream,
    hop: &ProxyHop,
    host: &str,
    port: u16,
) -> Result<(), ProxyError> {
    match hop.kind {
        ProxyKind::Socks4 => socks4_connect(stream, hop, host, port).await,
        ProxyKind::Socks5 => socks5_connect(stream, hop, host, port).await,
        ProxyKind::Http => http_connect(stream, hop, host, port).await,
    }
}

async fn socks4_connect(
    stream: &mut TcpStream,
    hop: &ProxyHop,
    host: &str,
    port: u16,
) -> Result<(), ProxyError> {
    // SOCKS4a: destination IP 0.0.0.1 signals that a hostname follows the user id.
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&port.to_be_bytes());
    match host.parse::<std::net::Ipv4Addr>() {
        Ok(ip) => {
            request.extend_from_slice(&ip.octets());
            request.push(0x00);
        }
        Err(_) => {
            request.extend_from_slice(&[0, 0, 0, 1]);
            request.push(0x00);
            request.extend_from_slice(host.as_bytes());
            request.push(0x00);
        }
    }
    stream.write_all(&request).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x5a {
        return Err(ProxyError::Socks4 {
            hop: hop.to_string(),
            reason: socks4_reason(reply[1]).into(),
        });
    }
    Ok(())
}

fn socks4_reason(code: u8) -> &'static str {
    match code {
        0x5b => "request rejected or failed",
        0x5c => "identd unreachable",
        0x5d => "identd user mismatch",
        _ => "unknown reply",
    }
}

async fn socks5_connect(
    stream: &mut TcpStream,
    hop: &ProxyHop,
    host: &str,
    port: u16,
) -> Result<(), ProxyError> {
    // Greeting: one method offered, "no authentication".
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != 0x05 {
        return Err(ProxyError::Socks5 {
            hop: hop.to_string(),
            reason: format!("bad version {:#04x}", choice[0]),
        });
    }
    if choice[1] != 0x00 {
        return Err(ProxyError::Socks5Auth { hop: hop.to_string() });
    }

    let name = host.as_bytes();
    let len = u8::try_from(name.len()).map_err(|_| ProxyError::Socks5 {
        hop: hop.to_string(),
        reason: "destination hostname too long".into(),
    })?;
    let mut request = vec![0x05, 0x01, 0x00, 0x03, len];
    request.extend_from_slice(name);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(ProxyError::Socks5 {
            hop: hop.to_string(),
            reason: socks5_reason(head[1]).into(),
        });
    }

    // Drain the bound address the proxy reports back.
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => usize::from(stream.read_u8().await?),
        other => {
            return Err(ProxyError::Socks5 {
                hop: hop.to_string(),
                reason: format!("unknown address type {other:#04x}"),
            })
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

fn socks5_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply",
    }
}

async fn http_connect(
    stream: &mut TcpStream,
    hop: &ProxyHop,
    host: &str,
    port: u16,
) -> Result<(), ProxyError> {
    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read the response head byte-wise so nothing past it is consumed.
    let mut reader = BufReader::with_capacity(1, &mut *stream);
    let mut status = String::new();
    reader.read_line(&mut status).await?;
    loop {
        let mut header = String::new();
        let n = reader.read_line(&mut header).await?;
        if n == 0 || header == "\r\n" || header == "\n" {
            break;
        }
    }

    let code = status.split_whitespace().nth(1).unwrap_or("");
    if !code.starts_with('2') {
        return Err(ProxyError::Http {
            hop: hop.to_string(),
            status: status.trim().to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    // ── Chains ───────────────────────────────────────────────────

    #[test]
    fn chain_minimum_and_display() {
        let mut chain = ProxyChain::default();
        assert!(chain.meets_minimum(0));
        assert!(!chain.meets_minimum(1));
        assert_eq!(chain.to_string(), "direct");

        chain.push(ProxyHop::new(ProxyKind::Socks5, "localhost", 9050));
        chain.push(ProxyHop::new(ProxyKind::Http, "10.0.0.1", 8080));
        assert!(chain.meets_minimum(2));
        assert_eq!(chain.to_string(), "5 localhost:9050 -> H 10.0.0.1:8080");
    }

    #[test]
    fn socks5_from_addr() {
        let hop = ProxyHop::socks5_from_addr("127.0.0.1:9050").unwrap();
        assert_eq!(hop, ProxyHop::new(ProxyKind::Socks5, "127.0.0.1", 9050));
        assert!(ProxyHop::socks5_from_addr("127.0.0.1").is_none());
        assert!(ProxyHop::socks5_from_addr(":9050").is_none());
    }

    // ── Proxy lists ──────────────────────────────────────────────

    #[test]
    fn parse_both_list_layouts() {
        let text = "4 1.1.1.1:1234 RU -\n\n5 1080 2.2.2.2 DE -\nH 3.3.3.3:8080\n";
        assert_eq!(
            parse_proxy_list(text),
            vec![
                ProxyHop::new(ProxyKind::Socks4, "1.1.1.1", 1234),
                ProxyHop::new(ProxyKind::Socks5, "2.2.2.2", 1080),
                ProxyHop::new(ProxyKind::Http, "3.3.3.3", 8080),
            ]
        );
    }

    #[test]
    fn parse_skips_malformed_and_duplicates() {
        let text = "X 1.1.1.1:1\n4\n4 notaport 1.1.1.1\n4 1.1.1.1:1234\n4 1.1.1.1:1234\n";
        assert_eq!(
            parse_proxy_list(text),
            vec![ProxyHop::new(ProxyKind::Socks4, "1.1.1.1", 1234)]
        );
    }

    // ── Handshakes against in-process fake proxies ───────────────

    #[tokio::test]
    async fn socks5_handshake_requests_domain_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let proxy = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            sock.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut rest = vec![0u8; usize::from(head[4]) + 2];
            sock.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..rest.len() - 2], b"irc.example");
            assert_eq!(&rest[rest.len() - 2..], &6667u16.to_be_bytes());

            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.unwrap();
            sock.write_all(b"hello\r\n").await.unwrap();
        });

        let chain = ProxyChain::new(vec![ProxyHop::new(ProxyKind::Socks5, "127.0.0.1", port)]);
        let stream = ProxyChainConnector
            .connect(&chain, "irc.example", 6667, Duration::from_secs(5))
            .await
            .unwrap();
        proxy.await.unwrap();

        // Bytes after the handshake belong to the tunnelled session.
        let mut stream = TcpStream::from_std(stream).unwrap();
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\r\n");
    }

    #[tokio::test]
    async fn socks5_auth_demand_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            sock.read_exact(&mut greeting).await.unwrap();
            sock.write_all(&[0x05, 0xff]).await.unwrap();
        });

        let chain = ProxyChain::new(vec![ProxyHop::new(ProxyKind::Socks5, "127.0.0.1", port)]);
        let err = ProxyChainConnector
            .connect(&chain, "irc.example", 6667, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Socks5Auth { .. }), "{err}");
    }

    #[tokio::test]
    async fn socks4_rejection_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut head = [0u8; 8];
            sock.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..2], &[0x04, 0x01]);
            sock.write_all(&[0x00, 0x5b, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let chain = ProxyChain::new(vec![ProxyHop::new(ProxyKind::Socks4, "127.0.0.1", port)]);
        let err = ProxyChainConnector
            .connect(&chain, "10.1.2.3", 6667, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Socks4 { .. }), "{err}");
    }

    #[tokio::test]
    async fn http_connect_accepts_2xx() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(sock);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "CONNECT irc.example:6667 HTTP/1.1\r\n");
            loop {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" {
                    break;
                }
            }
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 200 Connection established\r\nX-A: b\r\n\r\n")
                .await
                .unwrap();
        });

        let chain = ProxyChain::new(vec![ProxyHop::new(ProxyKind::Http, "127.0.0.1", port)]);
        ProxyChainConnector
            .connect(&chain, "irc.example", 6667, Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn silent_proxy_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });

        let chain = ProxyChain::new(vec![ProxyHop::new(ProxyKind::Socks5, "127.0.0.1", port)]);
        let err = ProxyChainConnector
            .connect(&chain, "irc.example", 6667, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout(_)), "{err}");
    }
}
