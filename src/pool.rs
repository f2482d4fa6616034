//! Pooled HTTP client used to forward requests to containers

use crate::lifecycle::Endpoint;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderMap, HeaderName};
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per endpoint
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    forwarded: AtomicU64,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            forwarded: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Requests handed to the client so far
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Send `req` to `endpoint`, keeping its path, query and end-to-end headers
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        endpoint: &Endpoint,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let backend_req = backend_request(req, endpoint)?;

        self.forwarded.fetch_add(1, Ordering::Relaxed);
        let mut response = self.client.request(backend_req).await?;
        strip_hop_headers(response.headers_mut());

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Connection-scoped headers that must not cross the proxy
static HOP_HEADERS: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

fn strip_hop_headers(headers: &mut HeaderMap) {
    // Headers listed in Connection are hop-by-hop as well
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_HEADERS.iter()) {
        headers.remove(name);
    }
}

/// Rewrite `req` so it targets `endpoint`
fn backend_request<B>(req: Request<B>, endpoint: &Endpoint) -> Result<Request<B>, PoolError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("{}{}", endpoint.base_url(), path)
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| PoolError::RequestBuild(e.to_string()))?;

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    // The pooled client speaks HTTP/1.1 to containers whatever the client used
    parts.version = Version::HTTP_11;
    strip_hop_headers(&mut parts.headers);

    Ok(Request::from_parts(parts, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_creation() {
        let pool = ConnectionPool::new(PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        });
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.forwarded(), 0);
    }

    #[test]
    fn test_backend_request_targets_endpoint() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/items?page=2")
            .header("host", "shop.example.com")
            .header("x-request-id", "abc")
            .body(())
            .unwrap();

        let out = backend_request(req, &Endpoint::local(8123)).unwrap();
        assert_eq!(out.method(), "POST");
        assert_eq!(out.uri().to_string(), "http://127.0.0.1:8123/api/items?page=2");
        assert_eq!(out.version(), Version::HTTP_11);
        assert_eq!(out.headers()["host"], "shop.example.com");
        assert_eq!(out.headers()["x-request-id"], "abc");
    }

    #[test]
    fn test_backend_request_defaults_to_root() {
        let req = Request::builder()
            .uri("http://shop.example.com")
            .body(())
            .unwrap();
        let out = backend_request(req, &Endpoint::local(8000)).unwrap();
        assert_eq!(out.uri().path(), "/");
    }

    #[test]
    fn test_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "close, x-session-hint".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("x-session-hint", "1".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());

        strip_hop_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
    }
}
