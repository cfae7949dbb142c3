//! Edge proxy server
//!
//! Accepts HTTP/1.1 on a TCP port, routes each request through the
//! [`RouteTable`] and forwards it to the upstream with `reqwest`. One
//! request is served per connection.

use super::routes::{forward_headers, header, rewrite_headers, Headers, RouteTable, HOP_BY_HOP};
use crate::error::{Result, RolloutError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, Take,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Default listen address
pub const DEFAULT_LISTEN: &str = "0.0.0.0:80";

/// Default time a client gets to send its request
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_HEADERS: usize = 100;
/// Request line plus headers
const MAX_HEAD: usize = 64 * 1024;
const MAX_BODY: usize = 16 * 1024 * 1024;

/// Parsed client request
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    /// Path and query as received
    pub target: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Response written back to the client
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    fn plain(status: u16, reason: &str) -> Self {
        Self {
            status,
            reason: reason.to_string(),
            headers: vec![(
                "Content-Type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: format!("{} {}\n", status, reason).into_bytes(),
        }
    }

    fn redirect(location: &str) -> Self {
        let mut response = Self::plain(301, "Moved Permanently");
        response
            .headers
            .push(("Location".to_string(), location.to_string()));
        response
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        head.push_str("Connection: close\r\n\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Path-routing reverse proxy
#[derive(Clone)]
pub struct EdgeProxy {
    table: Arc<RouteTable>,
    client: reqwest::Client,
    read_timeout: Duration,
}

impl EdgeProxy {
    /// Create a proxy for a route table
    pub fn new(table: RouteTable) -> Result<Self> {
        table.validate()?;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| RolloutError::Proxy(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            table: Arc::new(table),
            client,
            read_timeout: DEFAULT_READ_TIMEOUT,
        })
    }

    /// Limit how long a client may take to send its request
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Bind and serve until the process exits
    pub async fn run(self, listen: &str) -> Result<()> {
        let listener = TcpListener::bind(listen).await?;
        info!("Edge proxy listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    continue;
                }
            };
            let proxy = self.clone();
            tokio::spawn(async move {
                if let Err(e) = proxy.handle_connection(stream, peer).await {
                    debug!("Connection from {} ended with error: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let read = tokio::time::timeout(self.read_timeout, read_request(&mut stream)).await;
        let response = match read {
            Ok(Ok(Some(request))) => self.handle(request, &peer.ip().to_string()).await,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => {
                debug!("Malformed request from {}: {}", peer, e);
                ProxyResponse::plain(400, "Bad Request")
            }
            Err(_) => {
                debug!("Request from {} not received within {:?}", peer, self.read_timeout);
                ProxyResponse::plain(408, "Request Timeout")
            }
        };
        stream.write_all(&response.to_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Route and forward one request
    pub async fn handle(&self, request: ProxyRequest, client_ip: &str) -> ProxyResponse {
        if let Some(location) = self.table.redirect_for(&request.target) {
            return ProxyResponse::redirect(&location);
        }
        let Some(route) = self.table.resolve(&request.target) else {
            debug!("No route for {}", request.target);
            return ProxyResponse::plain(404, "Not Found");
        };

        let url = route.url();
        debug!("{} {} -> {}", request.method, request.target, url);

        let mut headers = forward_headers(&request.headers, client_ip);
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case("content-length"));
        rewrite_headers(&mut headers, route.rule);

        match self.forward(&request, &url, &headers).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Upstream {} failed: {}", route.rule.upstream, e);
                ProxyResponse::plain(502, "Bad Gateway")
            }
        }
    }

    async fn forward(
        &self,
        request: &ProxyRequest,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<ProxyResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| RolloutError::Proxy(e.to_string()))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let upstream = builder
            .send()
            .await
            .map_err(|e| RolloutError::Proxy(e.to_string()))?;

        let status = upstream.status();
        let headers: Headers = upstream
            .headers()
            .iter()
            .filter(|(name, _)| {
                let name = name.as_str();
                !HOP_BY_HOP.contains(&name) && name != "content-length"
            })
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = upstream
            .bytes()
            .await
            .map_err(|e| RolloutError::Proxy(e.to_string()))?;

        Ok(ProxyResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body: body.to_vec(),
        })
    }
}

/// Read one head line, bounded by what is left of the head allowance
async fn read_head_line<R>(reader: &mut Take<R>) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = reader.read_line(&mut line).await?;
    if line.ends_with('\n') {
        return Ok(Some(line));
    }
    if reader.limit() == 0 {
        return Err(RolloutError::Proxy(format!(
            "request head exceeds {} bytes",
            MAX_HEAD
        )));
    }
    if read == 0 {
        return Ok(None);
    }
    Err(RolloutError::Proxy("connection closed mid-line".to_string()))
}

/// Read one request; `None` when the client closed without sending one
async fn read_request<R: AsyncRead + Unpin>(stream: R) -> Result<Option<ProxyRequest>> {
    let mut head = BufReader::new(stream).take(MAX_HEAD as u64);

    let Some(request_line) = read_head_line(&mut head).await? else {
        return Ok(None);
    };
    debug!("Received request: {}", request_line.trim());

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() != 3 || !parts[2].starts_with("HTTP/1.") || !parts[1].starts_with('/') {
        return Err(RolloutError::Proxy(format!(
            "bad request line '{}'",
            request_line.trim()
        )));
    }
    let method = parts[0].to_string();
    let target = parts[1].to_string();

    let mut headers = Headers::new();
    loop {
        let line = read_head_line(&mut head)
            .await?
            .ok_or_else(|| RolloutError::Proxy("connection closed in headers".to_string()))?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RolloutError::Proxy(format!("bad header line '{}'", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
        if headers.len() > MAX_HEADERS {
            return Err(RolloutError::Proxy("too many headers".to_string()));
        }
    }

    if header(&headers, "transfer-encoding").is_some() {
        return Err(RolloutError::Proxy(
            "chunked request bodies are not supported".to_string(),
        ));
    }
    let content_length = match header(&headers, "content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| RolloutError::Proxy(format!("bad content length '{}'", value)))?,
        None => 0,
    };
    if content_length > MAX_BODY {
        return Err(RolloutError::Proxy("request body too large".to_string()));
    }

    let mut body = vec![0u8; content_length];
    head.into_inner().read_exact(&mut body).await?;

    Ok(Some(ProxyRequest {
        method,
        target,
        headers,
        body,
    }))
}
