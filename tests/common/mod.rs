//! Test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use versiongate::config::LifecycleConfig;
use versiongate::lifecycle::Endpoint;
use versiongate::probe::Probe;
use versiongate::registry::{ServiceDefinition, ServiceVersion, VersionedDefinition};
use versiongate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError, RuntimeOp};

struct FakeContainer {
    spec: ContainerSpec,
    server: Option<JoinHandle<()>>,
}

/// In-process container runtime.
///
/// Counts every call, fails on demand per image name, and can serve
/// `hello from <image>` over HTTP on the container's host port.
#[derive(Default)]
pub struct FakeRuntime {
    pub creates: AtomicUsize,
    pub starts: AtomicUsize,
    pub kills: AtomicUsize,
    pub removes: AtomicUsize,
    serve_http: bool,
    /// Delay inside `create`, to widen race windows
    create_delay: Option<Duration>,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    /// Images whose containers start but never answer HTTP
    silent_images: Mutex<HashSet<String>>,
    fail_kill_images: Mutex<HashSet<String>>,
    fail_remove_images: Mutex<HashSet<String>>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serving_http() -> Self {
        Self {
            serve_http: true,
            ..Self::default()
        }
    }

    pub fn with_create_delay(delay: Duration) -> Self {
        Self {
            create_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn silence(&self, image: &str) {
        self.silent_images.lock().insert(image.to_string());
    }

    pub fn fail_kill_for(&self, image: &str) {
        self.fail_kill_images.lock().insert(image.to_string());
    }

    pub fn fail_remove_for(&self, image: &str) {
        self.fail_remove_images.lock().insert(image.to_string());
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    /// Containers created and not yet removed
    pub fn live(&self) -> usize {
        self.containers.lock().len()
    }

    fn image_of(&self, container_id: &str) -> Option<String> {
        self.containers
            .lock()
            .get(container_id)
            .map(|c| c.spec.image.clone())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::new(RuntimeOp::Create, &spec.name, "image not found"));
        }

        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                server: None,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::new(RuntimeOp::Start, container_id, "exec format error"));
        }

        let spec = match self.containers.lock().get(container_id) {
            Some(c) => c.spec.clone(),
            None => return Err(RuntimeError::new(RuntimeOp::Start, container_id, "no such container")),
        };
        if !self.serve_http || self.silent_images.lock().contains(&spec.image) {
            return Ok(());
        }

        let listener = TcpListener::bind(("127.0.0.1", spec.host_port))
            .await
            .map_err(|e| RuntimeError::new(RuntimeOp::Start, container_id, e.to_string()))?;
        let server = tokio::spawn(serve_hello(listener, spec.image.clone()));
        if let Some(c) = self.containers.lock().get_mut(container_id) {
            c.server = Some(server);
        }
        Ok(())
    }

    async fn kill(&self, container_id: &str, _signal: &str) -> Result<(), RuntimeError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if let Some(image) = self.image_of(container_id) {
            if self.fail_kill_images.lock().contains(&image) {
                return Err(RuntimeError::new(RuntimeOp::Kill, container_id, "daemon timeout"));
            }
        }
        if let Some(c) = self.containers.lock().get_mut(container_id) {
            if let Some(server) = c.server.take() {
                server.abort();
            }
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        if let Some(image) = self.image_of(container_id) {
            if self.fail_remove_images.lock().contains(&image) {
                return Err(RuntimeError::new(RuntimeOp::Remove, container_id, "device busy"));
            }
        }
        if let Some(c) = self.containers.lock().remove(container_id) {
            if let Some(server) = c.server {
                server.abort();
            }
        }
        Ok(())
    }
}

async fn serve_hello(listener: TcpListener, image: String) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let image = image.clone();
        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                let body = format!("hello from {}", image);
                async move { Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body)))) }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
    }
}

/// Probe whose answer is flipped by the test
#[derive(Default)]
pub struct SwitchProbe {
    ready: AtomicBool,
    pub calls: AtomicUsize,
}

impl SwitchProbe {
    pub fn ready() -> Self {
        let probe = Self::default();
        probe.set_ready(true);
        probe
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for SwitchProbe {
    async fn check(&self, _endpoint: &Endpoint) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ready.load(Ordering::SeqCst)
    }
}

/// Lifecycle settings with a small port range and a fast probe
pub fn lifecycle_config(port_start: u16, port_end: u16) -> LifecycleConfig {
    LifecycleConfig {
        port_range_start: port_start,
        port_range_end: port_end,
        port_allocation_attempts: 8,
        probe_attempts: 3,
        probe_interval_ms: 10,
        probe_request_timeout_ms: 500,
        ..LifecycleConfig::default()
    }
}

/// A (service, version) pair without going through a registry
pub fn versioned(service_id: u64, version_id: u64, image: &str) -> VersionedDefinition {
    VersionedDefinition {
        definition: ServiceDefinition {
            id: service_id,
            name: format!("svc{}", service_id),
            host: format!("svc{}.test", service_id),
            versions: vec![],
            traffic_weights: vec![],
            active_weight_id: None,
            created_at: String::new(),
        },
        version: ServiceVersion {
            id: version_id,
            service_id,
            image_name: image.to_string(),
            image_tag: "latest".to_string(),
            port: 8080,
            env_vars: vec![],
            created_at: String::new(),
        },
    }
}

/// Wait for a port to become available (server listening)
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Send a raw HTTP/1.1 request with a custom Host header
pub async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    host: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Length: {}\r\n",
        method,
        path,
        host,
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    request.push_str(body);
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

pub async fn http_get_with_host(
    port: u16,
    path: &str,
    host: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    http_request(port, "GET", path, host, &[], "").await
}

/// Status code from a raw HTTP response
pub fn status_of(response: &str) -> u16 {
    response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Body from a raw HTTP response (assumes no chunked encoding)
pub fn body_of(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("")
}

/// Value of a header from a raw HTTP response, case-insensitive
pub fn header_of<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    let head = response.split_once("\r\n\r\n").map(|(h, _)| h)?;
    head.lines().skip(1).find_map(|line| {
        let (k, v) = line.split_once(':')?;
        k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}
