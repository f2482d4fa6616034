//! Admin HTTP API for managing service definitions
//!
//! Bound to loopback only. The public listener forwards requests for the
//! admin hostname here unchanged.

use crate::lifecycle::LifecycleManager;
use crate::registry::{NewService, NewTrafficWeight, NewVersion, RegistryError, ServiceRegistry};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body accepted by the admin API
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: &impl Serialize) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .expect("valid response with StatusCode enum and static header"),
        Err(e) => {
            error!(error = %e, "Failed to serialize admin response");
            response(StatusCode::INTERNAL_SERVER_ERROR, "serialization error")
        }
    }
}

fn error_json(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(status, &serde_json::json!({ "error": message.into() }))
}

fn registry_error_response(err: &RegistryError) -> Response<Full<Bytes>> {
    let status = match err {
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Invalid { .. } | RegistryError::VersionNotFound { .. } => {
            StatusCode::BAD_REQUEST
        }
        RegistryError::AlreadyExists(_) => StatusCode::CONFLICT,
        RegistryError::HostsExhausted => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::Storage(_) => {
            error!(error = %err, "Registry storage failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_json(status, err.to_string())
}

/// Shared state behind every admin request
pub struct AdminState {
    pub registry: Arc<ServiceRegistry>,
    pub lifecycle: Arc<LifecycleManager>,
    /// Required as a bearer token on writes and `/instances` when set
    pub auth_token: Option<String>,
}

pub struct AdminServer {
    listener: TcpListener,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub async fn bind(
        addr: SocketAddr,
        state: Arc<AdminState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(%addr, auth = self.state.auth_token.is_some(), "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(stream: TcpStream, state: Arc<AdminState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, hyper::Error>(handle_admin_request(req, &state).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: Option<&str>) -> bool {
    let Some(expected) = expected_token else {
        return true;
    };
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token == expected)
        .unwrap_or(false)
}

async fn read_json<B, T>(req: Request<B>) -> Result<T, Response<Full<Bytes>>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    T: DeserializeOwned,
{
    let bytes = Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| error_json(StatusCode::BAD_REQUEST, format!("cannot read body: {}", e)))?
        .to_bytes();

    serde_json::from_slice(&bytes)
        .map_err(|e| error_json(StatusCode::BAD_REQUEST, format!("invalid JSON: {}", e)))
}

/// Route one admin request
pub async fn handle_admin_request<B>(req: Request<B>, state: &AdminState) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!(%method, %path, "Admin API request");

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let needs_auth = method == Method::POST || segments == ["instances"];
    if needs_auth && !check_auth(&req, state.auth_token.as_deref()) {
        warn!(%method, %path, "Unauthorized admin API request");
        return response(StatusCode::UNAUTHORIZED, "unauthorized");
    }

    let registry = &state.registry;

    match (&method, segments.as_slice()) {
        (&Method::GET, [""]) => response(StatusCode::OK, "Admin server is running"),

        (&Method::GET, ["health"]) => response(StatusCode::OK, "ok"),

        (&Method::GET, ["version"]) => json_response(
            StatusCode::OK,
            &serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
        ),

        (&Method::GET, ["instances"]) => {
            let instances = state.lifecycle.snapshot();
            json_response(
                StatusCode::OK,
                &serde_json::json!({ "count": instances.len(), "instances": instances }),
            )
        }

        (&Method::GET, ["serviceDefinitions"]) => match registry.list() {
            Ok(services) => json_response(StatusCode::OK, &services),
            Err(e) => registry_error_response(&e),
        },

        (&Method::POST, ["serviceDefinitions"]) => {
            let new: NewService = match read_json(req).await {
                Ok(v) => v,
                Err(resp) => return resp,
            };
            match registry.register(&new) {
                Ok(service) => json_response(StatusCode::CREATED, &service),
                Err(e) => registry_error_response(&e),
            }
        }

        (&Method::GET, ["serviceDefinitions", name]) => match registry.by_name(name) {
            Ok(service) => json_response(StatusCode::OK, &service),
            Err(e) => registry_error_response(&e),
        },

        (&Method::GET, ["serviceDefinitions", name, "versions"]) => match registry.by_name(name) {
            Ok(service) => json_response(StatusCode::OK, &service.versions),
            Err(e) => registry_error_response(&e),
        },

        (&Method::POST, ["serviceDefinitions", name, "versions"]) => {
            let name = name.to_string();
            let new: NewVersion = match read_json(req).await {
                Ok(v) => v,
                Err(resp) => return resp,
            };
            match registry.add_version(&name, &new) {
                Ok(version) => json_response(StatusCode::CREATED, &version),
                Err(e) => registry_error_response(&e),
            }
        }

        (&Method::GET, ["serviceDefinitions", name, "trafficWeights"]) => {
            match registry.by_name(name) {
                Ok(service) => json_response(
                    StatusCode::OK,
                    &serde_json::json!({
                        "active_weight_id": service.active_weight_id,
                        "traffic_weights": service.traffic_weights,
                    }),
                ),
                Err(e) => registry_error_response(&e),
            }
        }

        (&Method::POST, ["serviceDefinitions", name, "trafficWeights"]) => {
            let name = name.to_string();
            let new: NewTrafficWeight = match read_json(req).await {
                Ok(v) => v,
                Err(resp) => return resp,
            };
            match registry.add_traffic_weight(&name, &new) {
                Ok(weight) => json_response(StatusCode::CREATED, &weight),
                Err(e) => registry_error_response(&e),
            }
        }

        (_, ["" | "health" | "version" | "instances" | "serviceDefinitions", ..]) => {
            response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}
