use crate::pool::PoolStats;
use crate::process::ProcessSupervisor;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the front door
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Local status listener for operators. Read-only; never proxies.
pub struct AdminServer {
    bind_addr: SocketAddr,
    supervisor: Arc<ProcessSupervisor>,
    pool_stats: Arc<PoolStats>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: Arc<ProcessSupervisor>,
        pool_stats: Arc<PoolStats>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            supervisor,
            pool_stats,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let supervisor = Arc::clone(&self.supervisor);
                            let pool_stats = Arc::clone(&self.pool_stats);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, supervisor, pool_stats).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    supervisor: Arc<ProcessSupervisor>,
    pool_stats: Arc<PoolStats>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let supervisor = Arc::clone(&supervisor);
        let pool_stats = Arc::clone(&pool_stats);
        async move { handle_admin_request(req, supervisor, pool_stats).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    supervisor: Arc<ProcessSupervisor>,
    pool_stats: Arc<PoolStats>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin request");

    let response = match (method, path) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, "/status") => {
            let status = serde_json::json!({
                "backend": supervisor.status(),
                "proxy": {
                    "total_requests": pool_stats.get_total_requests(),
                    "failed_requests": pool_stats.get_failed_requests(),
                },
            });
            json_response(StatusCode::OK, status.to_string())
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_admin() -> (SocketAddr, Arc<ProcessSupervisor>, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let supervisor = ProcessSupervisor::new(BackendConfig::local("sleep 60", 5999));
        let stats = Arc::new(PoolStats::default());
        stats.record_request();
        stats.record_request();
        stats.record_failure();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = AdminServer::new(addr, Arc::clone(&supervisor), stats, shutdown_rx);
        tokio::spawn(server.serve(listener));
        (addr, supervisor, shutdown_tx)
    }

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let (addr, _supervisor, _shutdown_tx) = start_admin().await;

        let response = get(addr, "/health").await;
        assert!(response.contains("200 OK"));
        assert!(response.ends_with("ok"));

        let response = get(addr, "/version").await;
        assert!(response.contains("200 OK"));
        assert!(response.contains(r#""name":"frontdoor""#));
        assert!(response.contains(VERSION));
    }

    #[tokio::test]
    async fn test_status_reports_backend_and_pool() {
        let (addr, _supervisor, _shutdown_tx) = start_admin().await;

        let response = get(addr, "/status").await;
        assert!(response.contains("200 OK"));

        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let status: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(status["backend"]["state"], "not_started");
        assert_eq!(status["backend"]["port"], 5999);
        assert_eq!(status["proxy"]["total_requests"], 2);
        assert_eq!(status["proxy"]["failed_requests"], 1);
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let (addr, _supervisor, _shutdown_tx) = start_admin().await;

        let response = get(addr, "/api/todos").await;
        assert!(response.contains("404"));
    }
}
