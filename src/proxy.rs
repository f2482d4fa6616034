//! Host-based request routing
//!
//! Every inbound request is resolved by hostname. The admin hostname is
//! forwarded straight to the local admin API. Any other host goes through
//! the registry, the version selector and the lifecycle manager, and the
//! request is forwarded to the endpoint that comes back.

use crate::config::ServerConfig;
use crate::error::{error_response, ProxyErrorCode};
use crate::lifecycle::{Endpoint, LifecycleError, LifecycleManager};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::{RegistryError, ServiceRegistry};
use crate::selector::{SelectError, VersionSelector};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
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

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Why a request could not be given an endpoint
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Select(#[from] SelectError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl DispatchError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            DispatchError::Registry(RegistryError::NotFound(_)) => ProxyErrorCode::UnknownHost,
            DispatchError::Registry(RegistryError::VersionNotFound { .. }) => {
                ProxyErrorCode::VersionNotFound
            }
            DispatchError::Registry(_) => ProxyErrorCode::InternalError,
            DispatchError::Select(SelectError::NoActiveVersion) => ProxyErrorCode::NoActiveVersion,
            DispatchError::Lifecycle(LifecycleError::NotReady { .. }) => {
                ProxyErrorCode::BackendNotReady
            }
            DispatchError::Lifecycle(LifecycleError::Runtime(_)) => {
                ProxyErrorCode::BackendStartFailed
            }
            DispatchError::Lifecycle(LifecycleError::PortExhaustion { .. }) => {
                ProxyErrorCode::PortsExhausted
            }
            DispatchError::Lifecycle(LifecycleError::ShuttingDown) => ProxyErrorCode::ShuttingDown,
        }
    }

    /// Message shown to the client. Internal details stay in the logs.
    fn public_message(&self) -> &'static str {
        match self.code() {
            ProxyErrorCode::UnknownHost => "Unknown or unconfigured host",
            ProxyErrorCode::NoActiveVersion => "Service has no active version",
            ProxyErrorCode::BackendNotReady => "Service is starting, please retry",
            ProxyErrorCode::ShuttingDown => "Server is shutting down",
            ProxyErrorCode::PortsExhausted => "No capacity to start service",
            ProxyErrorCode::BackendStartFailed => "Service unavailable",
            _ => "Internal error",
        }
    }
}

/// Resolves hostnames to endpoints and forwards requests to them
pub struct Router {
    registry: Arc<ServiceRegistry>,
    selector: Arc<VersionSelector>,
    lifecycle: Arc<LifecycleManager>,
    pool: ConnectionPool,
    admin_host: String,
    admin_endpoint: Endpoint,
    request_timeout: Duration,
}

impl Router {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        selector: Arc<VersionSelector>,
        lifecycle: Arc<LifecycleManager>,
        config: &ServerConfig,
    ) -> Self {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
        });

        Self {
            registry,
            selector,
            lifecycle,
            pool,
            admin_host: config.admin_host.to_lowercase(),
            admin_endpoint: Endpoint::local(config.admin_port),
            request_timeout: config.request_timeout(),
        }
    }

    /// Find (and if needed start) the container that should serve `hostname`
    pub async fn resolve(&self, hostname: &str) -> Result<Endpoint, DispatchError> {
        let definition = self.registry.definition_by_host(hostname)?;
        let version_id = self.selector.choose(&definition)?;
        let versioned = self.registry.versioned_definition(hostname, version_id)?;

        debug!(
            hostname,
            service = %versioned.definition.name,
            version_id,
            "Version selected"
        );

        Ok(self.lifecycle.ensure_running(&versioned).await?)
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        endpoint: &Endpoint,
        hostname: &str,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let result = tokio::time::timeout(self.request_timeout, self.pool.send_request(req, endpoint)).await;

        match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(hostname, %endpoint, error = %e, "Failed to forward request");
                error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend")
            }
            Err(_) => {
                warn!(
                    hostname,
                    %endpoint,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!(
                        "Request timed out after {} seconds",
                        self.request_timeout.as_secs()
                    ),
                )
            }
        }
    }

    pub async fn handle(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let hostname = match extract_hostname(&req) {
            Ok(h) => h,
            Err(code) => return error_response(code, "Missing or invalid Host header"),
        };

        // Overwrite rather than append: this proxy is the first trusted hop
        let original_host = req
            .headers()
            .get(hyper::header::HOST)
            .cloned()
            .or_else(|| HeaderValue::from_str(&hostname).ok());
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = original_host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

        debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        let endpoint = if hostname == self.admin_host {
            self.admin_endpoint.clone()
        } else {
            match self.resolve(&hostname).await {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    let code = e.code();
                    match code {
                        ProxyErrorCode::UnknownHost => debug!(hostname, request_id, "Unknown host"),
                        ProxyErrorCode::BackendNotReady | ProxyErrorCode::ShuttingDown => {
                            warn!(hostname, request_id, error = %e, "Backend unavailable")
                        }
                        _ => error!(hostname, request_id, error = %e, "Failed to dispatch request"),
                    }
                    return error_response(code, e.public_message());
                }
            }
        };

        let mut response = self.forward(req, &endpoint, &hostname).await;
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
        response
    }
}

/// Hostname from the Host header (or the URI authority for HTTP/2),
/// port stripped and lowercased
fn extract_hostname<B>(req: &Request<B>) -> Result<String, ProxyErrorCode> {
    let raw = match req.headers().get(hyper::header::HOST) {
        Some(value) => value.to_str().map_err(|_| ProxyErrorCode::InvalidHost)?,
        None => req.uri().host().ok_or(ProxyErrorCode::MissingHostHeader)?,
    };

    let hostname = raw.split(':').next().unwrap_or_default();

    if hostname.is_empty() {
        return Err(ProxyErrorCode::MissingHostHeader);
    }
    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(ProxyErrorCode::InvalidHost);
    }
    // Alphanumeric, hyphen and dot only; keeps hostnames safe to log
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return Err(ProxyErrorCode::InvalidHost);
    }

    Ok(hostname.to_lowercase())
}

/// The public HTTP listener
pub struct ProxyServer {
    listener: TcpListener,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
    drain_timeout: Duration,
}

impl ProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        router: Arc<Router>,
        shutdown_rx: watch::Receiver<bool>,
        drain_timeout: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router,
            shutdown_rx,
            drain_timeout,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until shutdown is signalled, then let open connections finish
    /// their in-flight requests for at most the drain timeout.
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(%addr, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let router = Arc::clone(&self.router);
                            let shutdown_rx = self.shutdown_rx.clone();
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, client_addr, router, shutdown_rx).await {
                                    debug!(addr = %client_addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        drop(self.listener);

        let open = connections.len();
        if open > 0 {
            info!(open, timeout_secs = self.drain_timeout.as_secs(), "Draining connections");
            let drained = tokio::time::timeout(self.drain_timeout, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(remaining = connections.len(), "Drain timeout reached, closing connections");
                connections.abort_all();
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    router: Arc<Router>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, hyper::Error>(router.handle(req, client_addr).await) }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;
        }
        _ = shutdown_signalled(&mut shutdown_rx) => {
            conn.as_mut().graceful_shutdown();
            conn.await.map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;
        }
    }

    Ok(())
}

async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
