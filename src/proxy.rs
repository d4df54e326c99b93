use crate::config::Config;
use crate::error::{json_error_response, ForwardError, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::process::BackendState;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that only describe one transport leg (RFC 7230 section 6.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// How often the drain loop checks for open connections
const DRAIN_POLL_INTERVAL_MS: u64 = 50;

/// Per-request behavior of the front door
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub backend_host: String,
    pub backend_port: u16,
    /// Bound on one forwarded request, response headers included
    pub request_timeout: Duration,
    pub allowed_methods: Vec<Method>,
    /// Body of `GET /`
    pub liveness_message: String,
    pub max_body_bytes: usize,
    /// How long shutdown waits for open connections
    pub drain_timeout: Duration,
}

impl ProxySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backend_host: config.backend.host.clone(),
            backend_port: config.backend.port,
            request_timeout: config.backend.request_timeout(),
            allowed_methods: config.server.methods(),
            liveness_message: config.server.liveness_message.clone(),
            max_body_bytes: config.server.max_body_bytes,
            drain_timeout: config.server.drain_timeout(),
        }
    }
}

/// Shared by every connection and request
struct RequestContext {
    settings: ProxySettings,
    pool: Arc<ConnectionPool>,
    backend_state: watch::Receiver<BackendState>,
}

/// The public HTTP listener in front of the backend.
///
/// Holds only a receiver for the backend state, so it can observe readiness
/// but never change it.
pub struct ProxyServer {
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
    context: Arc<RequestContext>,
    active_connections: Arc<AtomicUsize>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        backend_state: watch::Receiver<BackendState>,
        settings: ProxySettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self::with_pool_config(
            bind_addr,
            backend_state,
            settings,
            shutdown_rx,
            PoolConfig::default(),
        )
    }

    pub fn with_pool_config(
        bind_addr: SocketAddr,
        backend_state: watch::Receiver<BackendState>,
        settings: ProxySettings,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(pool_config));
        Self {
            bind_addr,
            shutdown_rx,
            context: Arc::new(RequestContext {
                settings,
                pool,
                backend_state,
            }),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.context.pool
    }

    /// Number of client connections currently open
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown, then drain
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            backend = %format!("{}:{}", self.context.settings.backend_host, self.context.settings.backend_port),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            let guard = ConnectionGuard::new(Arc::clone(&self.active_connections));
                            let conn_shutdown_rx = shutdown_rx.clone();

                            tokio::spawn(async move {
                                let _guard = guard;
                                if let Err(e) = handle_connection(stream, addr, context, conn_shutdown_rx).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    // A dropped sender can never signal again; treat it as shutdown
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        self.drain().await;

        Ok(())
    }

    /// Wait for open connections to finish, bounded by the drain timeout
    async fn drain(&self) {
        let drain_timeout = self.context.settings.drain_timeout;
        let deadline = Instant::now() + drain_timeout;

        let open = self.active_connections();
        if open > 0 {
            info!(open, drain_timeout_secs = drain_timeout.as_secs(), "Draining open connections");
        }

        loop {
            let open = self.active_connections();
            if open == 0 {
                debug!("All connections drained");
                return;
            }
            if Instant::now() >= deadline {
                warn!(open, "Drain timeout exceeded, abandoning open connections");
                return;
            }
            tokio::time::sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }
    }
}

/// Counts a connection as open for as long as it lives
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    context: Arc<RequestContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    // HTTP/1.1 and h2c on the same port
    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;
        }
        _ = shutdown_rx.changed() => {
            // Finish the in-flight request, refuse further ones on this connection
            conn.as_mut().graceful_shutdown();
            conn.await.map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    context: Arc<RequestContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let settings = &context.settings;

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    // The root path is answered here and never proxied
    if req.uri().path() == "/" {
        let response = match *req.method() {
            Method::GET | Method::HEAD => liveness_response(&settings.liveness_message),
            _ => method_not_allowed(&[Method::GET, Method::HEAD]),
        };
        return Ok(with_request_id(response, &request_id));
    }

    if !settings.allowed_methods.contains(req.method()) {
        debug!(method = %req.method(), request_id, "Method not allowed");
        let response = method_not_allowed(&settings.allowed_methods);
        return Ok(with_request_id(response, &request_id));
    }

    let state = *context.backend_state.borrow();
    if state != BackendState::Ready {
        debug!(%state, request_id, "Backend not ready, rejecting request");
        return Ok(with_request_id(
            json_error_response(ProxyErrorCode::BackendUnavailable, None),
            &request_id,
        ));
    }

    let (mut parts, body) = req.into_parts();

    let body = match Limited::new(body, settings.max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            debug!(limit = settings.max_body_bytes, request_id, "Request body too large");
            return Ok(with_request_id(
                json_error_response(
                    ProxyErrorCode::PayloadTooLarge,
                    Some(format!("body exceeds {} bytes", settings.max_body_bytes)),
                ),
                &request_id,
            ));
        }
        Err(e) => {
            debug!(error = %e, request_id, "Failed to read request body");
            return Ok(with_request_id(
                json_error_response(ProxyErrorCode::BadRequest, Some(e.to_string())),
                &request_id,
            ));
        }
    };

    prepare_upstream_headers(&mut parts.headers, &request_id, client_addr);

    let method = parts.method.clone();
    let path = parts.uri.path().to_string();

    // One attempt only: POST/PUT/DELETE are not safe to replay
    let result = tokio::time::timeout(
        settings.request_timeout,
        context
            .pool
            .send_request(parts, body, &settings.backend_host, settings.backend_port),
    )
    .await
    .unwrap_or_else(|_| Err(ForwardError::Timeout(settings.request_timeout)));

    match result {
        Ok(mut response) => {
            debug!(%method, path, status = %response.status(), request_id, "Backend responded");
            strip_hop_by_hop(response.headers_mut());
            // Keep the backend's own ID if it set one
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().entry(X_REQUEST_ID).or_insert(value);
            }
            Ok(response)
        }
        Err(e) => {
            warn!(%method, path, request_id, error = %e, "Failed to forward request");
            Ok(with_request_id(
                json_error_response(ProxyErrorCode::BackendUnavailable, Some(e.details())),
                &request_id,
            ))
        }
    }
}

fn liveness_response(message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from(message.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// 405 with the `Allow` header listing `allowed`
fn method_not_allowed(allowed: &[Method]) -> Response<BoxBody<Bytes, hyper::Error>> {
    let allow = allowed
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ");

    let mut response = json_error_response(ProxyErrorCode::MethodNotAllowed, None);
    if let Ok(value) = HeaderValue::from_str(&allow) {
        response.headers_mut().insert(hyper::header::ALLOW, value);
    }
    response
}

fn with_request_id<B>(mut response: Response<B>, request_id: &str) -> Response<B> {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

/// Remove hop-by-hop headers, including any listed in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Rewrite inbound headers for the backend leg.
///
/// `Host` and `Content-Length` are regenerated by the client. The
/// X-Forwarded-* headers are overwritten rather than appended: this proxy is
/// the first trusted hop.
fn prepare_upstream_headers(headers: &mut HeaderMap, request_id: &str, client_addr: SocketAddr) {
    strip_hop_by_hop(headers);

    let original_host = headers.remove(hyper::header::HOST);
    headers.remove(hyper::header::CONTENT_LENGTH);

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    match original_host {
        Some(host) => {
            headers.insert(X_FORWARDED_HOST, host);
        }
        None => {
            headers.remove(X_FORWARDED_HOST);
        }
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_settings(backend_port: u16) -> ProxySettings {
        let mut config = Config::default();
        config.backend.port = backend_port;
        config.backend.request_timeout_secs = 1;
        config.server.drain_timeout_secs = 1;
        ProxySettings::from_config(&config)
    }

    /// Start a proxy on an ephemeral port with a hand-driven backend state
    async fn start_proxy(
        settings: ProxySettings,
    ) -> (
        SocketAddr,
        watch::Sender<BackendState>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<anyhow::Result<()>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (state_tx, state_rx) = watch::channel(BackendState::Starting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = ProxyServer::new(addr, state_rx, settings, shutdown_rx);
        let handle = tokio::spawn(server.serve(listener));
        (addr, state_tx, shutdown_tx, handle)
    }

    async fn raw_request(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&response).to_string()
    }

    #[test]
    fn test_settings_from_config() {
        let settings = ProxySettings::from_config(&Config::default());
        assert_eq!(settings.backend_host, "127.0.0.1");
        assert_eq!(settings.backend_port, 5000);
        assert_eq!(settings.request_timeout, Duration::from_secs(10));
        assert_eq!(settings.liveness_message, "Todo Backend API is running...");
        assert!(settings.allowed_methods.contains(&Method::GET));
        assert!(settings.allowed_methods.contains(&Method::DELETE));
        assert!(!settings.allowed_methods.contains(&Method::PATCH));
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("h2c"));
        headers.insert("x-session-hint", HeaderValue::from_static("abc"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("upgrade").is_none());
        assert!(headers.get("x-session-hint").is_none());
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("authorization").unwrap(), "Bearer t");
    }

    #[test]
    fn test_prepare_upstream_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("todo.example.com"));
        headers.insert("content-length", HeaderValue::from_static("12"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("6.6.6.6"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert("accept", HeaderValue::from_static("application/json"));

        let client: SocketAddr = "10.1.2.3:45678".parse().unwrap();
        prepare_upstream_headers(&mut headers, "req-1", client);

        assert!(headers.get("host").is_none());
        assert!(headers.get("content-length").is_none());
        assert_eq!(headers.get("x-request-id").unwrap(), "req-1");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.1.2.3");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "todo.example.com");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(headers.get("accept").unwrap(), "application/json");
    }

    #[test]
    fn test_prepare_upstream_headers_drops_spoofed_forwarded_host() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-host", HeaderValue::from_static("spoofed"));

        let client: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        prepare_upstream_headers(&mut headers, "req-2", client);

        assert!(headers.get("x-forwarded-host").is_none());
    }

    #[test]
    fn test_method_not_allowed_sets_allow() {
        let response = method_not_allowed(&[Method::GET, Method::HEAD]);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get("allow").unwrap(), "GET, HEAD");
        assert_eq!(
            response.headers().get("x-proxy-error").unwrap(),
            "METHOD_NOT_ALLOWED"
        );
    }

    #[test]
    fn test_liveness_response() {
        let response = liveness_response("up");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn test_root_is_answered_locally() {
        let (addr, _state_tx, shutdown_tx, handle) = start_proxy(test_settings(1)).await;

        let response = raw_request(
            addr,
            "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.contains("200 OK"), "response: {}", response);
        assert!(response.contains("Todo Backend API is running..."));
        assert!(response.to_lowercase().contains("x-request-id:"));

        let response = raw_request(
            addr,
            "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.contains("405"), "response: {}", response);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_not_ready_is_503_for_every_state() {
        let (addr, state_tx, shutdown_tx, handle) = start_proxy(test_settings(1)).await;

        for state in [
            BackendState::NotStarted,
            BackendState::Starting,
            BackendState::Crashed,
            BackendState::Stopped,
        ] {
            state_tx.send_replace(state);
            let response = raw_request(
                addr,
                "GET /api/todos HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            )
            .await;
            assert!(response.contains("503"), "state {}: {}", state, response);
            assert!(response.contains(r#"{"error":"backend unavailable"}"#));
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_method_is_405() {
        let (addr, state_tx, shutdown_tx, handle) = start_proxy(test_settings(1)).await;
        state_tx.send_replace(BackendState::Ready);

        let response = raw_request(
            addr,
            "PATCH /api/todos/1 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.contains("405"), "response: {}", response);
        assert!(response.to_lowercase().contains("allow: get, post, put, delete, head, options"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ready_but_refused_is_503_with_details() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (addr, state_tx, shutdown_tx, handle) = start_proxy(test_settings(port)).await;
        state_tx.send_replace(BackendState::Ready);

        let response = raw_request(
            addr,
            "GET /api/todos HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.contains("503"), "response: {}", response);
        assert!(response.contains(r#""details":"#));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        // Accepts connections but never answers
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = silent.accept().await {
                held.push(stream);
            }
        });

        let (addr, state_tx, shutdown_tx, handle) = start_proxy(test_settings(port)).await;
        state_tx.send_replace(BackendState::Ready);

        let started = std::time::Instant::now();
        let response = raw_request(
            addr,
            "GET /api/todos HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        let elapsed = started.elapsed();

        assert!(response.contains("503"), "response: {}", response);
        assert!(response.contains("no response from backend within 1000 ms"));
        assert!(elapsed >= Duration::from_millis(900), "elapsed: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(3), "elapsed: {:?}", elapsed);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_body_over_limit_is_413() {
        let mut settings = test_settings(1);
        settings.max_body_bytes = 8;
        let (addr, state_tx, shutdown_tx, handle) = start_proxy(settings).await;
        state_tx.send_replace(BackendState::Ready);

        let response = raw_request(
            addr,
            "POST /api/todos HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: 15\r\nConnection: close\r\n\r\n{\"title\":\"xxx\"}",
        )
        .await;
        assert!(response.contains("413"), "response: {}", response);
        assert!(response.contains("payload too large"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (addr, _state_tx, shutdown_tx, handle) = start_proxy(test_settings(1)).await;

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_drains_idle_keepalive_connection() {
        let (addr, _state_tx, shutdown_tx, handle) = start_proxy(test_settings(1)).await;

        // Keep-alive connection with one finished request
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("200 OK"));

        shutdown_tx.send(true).unwrap();

        // The idle connection is closed by graceful shutdown well before the drain timeout
        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(900));

        let n = stream.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
}
