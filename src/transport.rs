//! # HTTP Transports
//!
//! The fetch pipeline talks to the network through the [`Transport`] trait so
//! the retry driver and decoders can be exercised with scripted responses.
//!
//! Two real transports are provided:
//! - [`TcpTransport`] for `http://` roots. Speaks HTTP/1.1 directly over a
//!   `TcpStream` and hands the raw body, chunked or not, to the decoders.
//! - [`ReqwestTransport`] for `https://` roots. reqwest terminates TLS and
//!   removes any transfer coding itself, so the response is presented as a
//!   plain length-delimited (or until-close) body.
//!
//! [`SchemeTransport`] picks between them per request.

use crate::stream::BodyStream;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("connection failed: {0}")]
    Connect(#[source] io::Error),

    #[error("malformed response head: {0}")]
    MalformedHead(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// One GET request.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub url: Url,
    pub authorization: Option<String>,
    pub user_agent: String,
    /// Bound on connecting and receiving the response head.
    pub timeout: Duration,
    /// Poll interval used by the returned body stream.
    pub poll_interval: Duration,
}

/// Response headers with case-insensitive lookup.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Status, headers and an unread body.
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    /// Body size as reported by the client library, when it knows it.
    pub reported_len: Option<u64>,
    pub body: Box<dyn BodyStream>,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("reported_len", &self.reported_len)
            .finish_non_exhaustive()
    }
}

pub trait Transport {
    fn get(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn get(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        (**self).get(request)
    }
}

// -- Plain HTTP over TCP --

const MAX_HEAD: usize = 8 * 1024;

/// HTTP/1.1 over a raw `TcpStream`, for `http://` roots only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn get(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = &request.url;
        if url.scheme() != "http" {
            return Err(TransportError::UnsupportedScheme(url.scheme().to_string()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::Resolve(url.to_string()))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| TransportError::Resolve(format!("{host}:{port}")))?
            .next()
            .ok_or_else(|| TransportError::Resolve(format!("{host}:{port}")))?;

        let mut stream =
            TcpStream::connect_timeout(&addr, request.timeout).map_err(TransportError::Connect)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(request.timeout))?;
        stream.set_read_timeout(Some(request.timeout))?;

        stream.write_all(request_head(request, host, url.port()).as_bytes())?;
        stream.flush()?;

        let (head, leftover) = read_head(&mut stream)?;
        let (status, headers) = parse_head(&head)?;

        // body reads poll: a short timeout turns "nothing yet" into Ok(0)
        let poll = request.poll_interval.max(Duration::from_millis(1));
        stream.set_read_timeout(Some(poll))?;

        Ok(HttpResponse {
            status,
            headers,
            reported_len: None,
            body: Box::new(TcpBody {
                stream,
                pending: leftover,
                connected: true,
            }),
        })
    }
}

fn request_head(request: &HttpRequest, host: &str, port: Option<u16>) -> String {
    let url = &request.url;
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    let host_header = match port {
        Some(p) => format!("{host}:{p}"),
        None => host.to_string(),
    };

    let mut head = format!(
        "GET {target} HTTP/1.1\r\nHost: {host_header}\r\nUser-Agent: {}\r\nAccept: image/jpeg\r\nConnection: close\r\n",
        request.user_agent
    );
    if let Some(auth) = &request.authorization {
        head.push_str("Authorization: ");
        head.push_str(auth);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}

/// Read up to and including the blank line ending the head.
fn read_head(stream: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>), TransportError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(TransportError::MalformedHead(
                "connection closed before end of headers".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD {
            return Err(TransportError::MalformedHead("headers too large".into()));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse `HTTP/1.1 200 OK` plus header lines.
pub fn parse_head(head: &[u8]) -> Result<(u16, Headers), TransportError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| TransportError::MalformedHead("non UTF-8 head".into()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(TransportError::MalformedHead(status_line.to_string()));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| TransportError::MalformedHead(status_line.to_string()))?;

    let mut headers = Headers::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| TransportError::MalformedHead(line.to_string()))?;
        headers.insert(name.trim(), value.trim());
    }
    Ok((status, headers))
}

struct TcpBody {
    stream: TcpStream,
    pending: Vec<u8>,
    connected: bool,
}

impl BodyStream for TcpBody {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        if !self.connected {
            return Ok(0);
        }
        match self.stream.read(buf) {
            Ok(0) => {
                self.connected = false;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(0)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                self.connected = false;
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        !self.pending.is_empty() || self.connected
    }
}

// -- HTTPS through reqwest --

/// Blocking reqwest client for `https://` roots.
///
/// The client is built on first use and rebuilt whenever a request asks for
/// a different user agent or connect timeout.
#[derive(Debug, Default)]
pub struct ReqwestTransport {
    client: Option<(ClientSettings, reqwest::blocking::Client)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ClientSettings {
    user_agent: String,
    connect_timeout: Duration,
}

impl ClientSettings {
    fn of(request: &HttpRequest) -> Self {
        Self {
            user_agent: request.user_agent.clone(),
            connect_timeout: request.timeout,
        }
    }
}

impl ReqwestTransport {
    fn client(&mut self, request: &HttpRequest) -> Result<&reqwest::blocking::Client, TransportError> {
        let wanted = ClientSettings::of(request);
        let stale = match &self.client {
            Some((settings, _)) => *settings != wanted,
            None => true,
        };
        if stale {
            let client = reqwest::blocking::Client::builder()
                .user_agent(wanted.user_agent.clone())
                .connect_timeout(wanted.connect_timeout)
                .build()?;
            self.client = Some((wanted, client));
        }
        self.client
            .as_ref()
            .map(|(_, client)| client)
            .ok_or_else(|| TransportError::MalformedHead("client unavailable".into()))
    }
}

impl Transport for ReqwestTransport {
    fn get(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let timeout = request.timeout;
        let client = self.client(request)?;

        let mut builder = client.get(request.url.clone()).timeout(timeout);
        if let Some(auth) = &request.authorization {
            builder = builder.header(reqwest::header::AUTHORIZATION, auth);
        }
        let response = builder.send()?;

        let status = response.status().as_u16();
        let mut headers: Headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        // reqwest has already removed the transfer coding from the body
        headers.remove("Transfer-Encoding");
        let reported_len = response.content_length();

        Ok(HttpResponse {
            status,
            headers,
            reported_len,
            body: Box::new(ReqwestBody {
                response,
                connected: true,
            }),
        })
    }
}

struct ReqwestBody {
    response: reqwest::blocking::Response,
    connected: bool,
}

impl BodyStream for ReqwestBody {
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.connected {
            return Ok(0);
        }
        match self.response.read(buf) {
            Ok(0) => {
                self.connected = false;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => {
                self.connected = false;
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Routes `http` to [`TcpTransport`] and `https` to [`ReqwestTransport`].
#[derive(Debug, Default)]
pub struct SchemeTransport {
    plain: TcpTransport,
    tls: ReqwestTransport,
}

impl Transport for SchemeTransport {
    fn get(&mut self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        match request.url.scheme() {
            "http" => self.plain.get(request),
            "https" => self.tls.get(request),
            other => Err(TransportError::UnsupportedScheme(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{read_body, BodyFraming, ReadTimeouts};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn parses_status_and_headers() {
        let head = b"HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\ntransfer-encoding: chunked\r\n\r\n";
        let (status, headers) = parse_head(head).unwrap();
        assert_eq!(status, 200);
        assert_eq!(headers.get("content-type"), Some("image/jpeg"));
        assert_eq!(headers.get("Transfer-Encoding"), Some("chunked"));
        assert!(!headers.contains("Content-Length"));
    }

    #[test]
    fn rejects_garbage_heads() {
        assert!(parse_head(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
        assert!(parse_head(b"HTTP/1.1 abc\r\n\r\n").is_err());
        assert!(parse_head(b"HTTP/1.1 200 OK\r\nbroken header\r\n\r\n").is_err());
    }

    #[test]
    fn request_head_carries_auth_and_query() {
        let request = HttpRequest {
            url: Url::parse("http://frames.local:8080/api/v1/render?w=600").unwrap(),
            authorization: Some("Basic abc".into()),
            user_agent: "test-agent".into(),
            timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(5),
        };
        let head = request_head(&request, "frames.local", Some(8080));
        assert!(head.starts_with("GET /api/v1/render?w=600 HTTP/1.1\r\n"));
        assert!(head.contains("Host: frames.local:8080\r\n"));
        assert!(head.contains("Authorization: Basic abc\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn https_client_follows_request_settings() {
        let mut request = HttpRequest {
            url: Url::parse("https://frames.local/api/v1/render").unwrap(),
            authorization: None,
            user_agent: "agent-a".into(),
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
        };
        let mut transport = ReqwestTransport::default();
        transport.client(&request).unwrap();
        transport.client(&request).unwrap();
        assert_eq!(transport.client.as_ref().unwrap().0, ClientSettings::of(&request));

        request.user_agent = "agent-b".into();
        request.timeout = Duration::from_secs(9);
        transport.client(&request).unwrap();
        let (settings, _) = transport.client.as_ref().unwrap();
        assert_eq!(settings.user_agent, "agent-b");
        assert_eq!(settings.connect_timeout, Duration::from_secs(9));
    }

    #[test]
    fn tcp_transport_reads_chunked_response() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHEL")
                .unwrap();
            thread::sleep(Duration::from_millis(20));
            socket.write_all(b"LO\r\n0\r\n\r\n").unwrap();
        });

        let request = HttpRequest {
            url: Url::parse(&format!("http://{addr}/img")).unwrap(),
            authorization: None,
            user_agent: "test".into(),
            timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(2),
        };
        let mut response = TcpTransport.get(&request).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("transfer-encoding"), Some("chunked"));

        let timeouts = ReadTimeouts {
            inactivity: Duration::from_secs(1),
            poll_interval: Duration::from_millis(2),
        };
        let body = read_body(response.body.as_mut(), BodyFraming::Chunked, 1024, timeouts).unwrap();
        assert_eq!(body, b"HELLO");
        server.join().unwrap();
    }

    #[test]
    fn scheme_transport_rejects_unknown_schemes() {
        let request = HttpRequest {
            url: Url::parse("ftp://example.com/file").unwrap(),
            authorization: None,
            user_agent: "test".into(),
            timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(5),
        };
        assert!(matches!(
            SchemeTransport::default().get(&request),
            Err(TransportError::UnsupportedScheme(s)) if s == "ftp"
        ));
    }
}
