//! On-demand container lifecycle
//!
//! [`LifecycleManager`] keeps at most one container per (service, version)
//! key. The first request for a key creates and starts a container on a
//! freshly allocated host port, later requests reuse it, and idle
//! containers are reclaimed by a background sweep.
//!
//! # Locking
//!
//! Two levels of locks are used:
//!
//! - `inner` (a `parking_lot` mutex) guards the slot map, the port
//!   allocator and the shutdown flag. It is never held across an `.await`.
//! - Each key owns a `Slot`, an async mutex. Whoever holds it may
//!   create, probe or destroy that key's container. Concurrent callers for
//!   the same key queue behind it, which is what guarantees a single
//!   creation per key.
//!
//! A slot that has been torn down is marked `evicted` before its lock is
//! released, so a caller that was queued on it starts over with a fresh
//! lookup instead of touching a dead instance.

use crate::config::LifecycleConfig;
use crate::ports::PortAllocator;
use crate::probe::{wait_until_ready, Probe, ProbeOutcome};
use crate::registry::VersionedDefinition;
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError, KILL_SIGNAL};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Identifies one container: a service and one of its versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceKey {
    pub service_id: u64,
    pub version_id: u64,
}

impl InstanceKey {
    pub fn new(service_id: u64, version_id: u64) -> Self {
        Self {
            service_id,
            version_id,
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service_id, self.version_id)
    }
}

/// Local address a request can be forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn local(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("instance {key} not ready after {attempts} probe attempts")]
    NotReady { key: InstanceKey, attempts: u32 },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("no free host port in {start}..={end}")]
    PortExhaustion { start: u16, end: u16 },
    #[error("shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Container started, readiness not yet confirmed
    Provisioning,
    /// Passed its readiness probe; never probed again
    Ready,
}

/// A tracked container
#[derive(Debug)]
struct RunningInstance {
    container_id: String,
    host_port: u16,
    state: InstanceState,
    last_accessed: Instant,
}

#[derive(Debug, Default)]
struct SlotState {
    instance: Option<RunningInstance>,
    /// Set once the slot has been removed from the map
    evicted: bool,
}

/// Per-key lock. Held owned so provisioning can outlive its caller.
type Slot = tokio::sync::Mutex<SlotState>;

struct Inner {
    slots: HashMap<InstanceKey, Arc<Slot>>,
    ports: PortAllocator,
    shutting_down: bool,
}

/// Status of one tracked key, as reported by the admin API
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub key: String,
    pub service_id: u64,
    pub version_id: u64,
    /// `None` while the slot is busy provisioning or probing
    pub container_id: Option<String>,
    pub host_port: Option<u16>,
    pub state: Option<InstanceState>,
    pub busy: bool,
    pub idle_secs: Option<u64>,
}

/// A kill or remove that failed during reclamation or shutdown
#[derive(Debug)]
pub struct TeardownFailure {
    pub key: InstanceKey,
    pub container_id: String,
    pub error: RuntimeError,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.key, self.container_id, self.error)
    }
}

/// Outcome of a sweep. Every key in `removed` is no longer tracked, even
/// if its container reported failures.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub removed: Vec<InstanceKey>,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Builds the container for one version on `host_port`
pub fn container_spec(vd: &VersionedDefinition, host_port: u16, prefix: &str) -> ContainerSpec {
    let short_id = uuid::Uuid::new_v4().simple().to_string();
    let name = format!(
        "{}-{}-v{}-{}",
        prefix,
        sanitize_name(&vd.definition.name),
        vd.version.id,
        &short_id[..8]
    );

    let labels = HashMap::from([
        (format!("{}.service", prefix), vd.definition.name.clone()),
        (format!("{}.service_id", prefix), vd.definition.id.to_string()),
        (format!("{}.version_id", prefix), vd.version.id.to_string()),
    ]);

    ContainerSpec {
        name,
        image: vd.version.image(),
        env: vd.version.env_vars.clone(),
        container_port: vd.version.port,
        host_port,
        labels,
    }
}

/// Container names allow `[a-zA-Z0-9_.-]`
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Manages on-demand containers.
///
/// Constructed behind an `Arc` so the idle reaper task can share it with
/// the request path.
pub struct LifecycleManager {
    inner: Mutex<Inner>,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn Probe>,
    config: LifecycleConfig,
    /// Flipped to true when shutdown begins, interrupting probes
    cancel_tx: watch::Sender<bool>,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn Probe>,
        config: LifecycleConfig,
    ) -> Arc<Self> {
        let ports = PortAllocator::new(
            config.port_range_start..=config.port_range_end,
            config.port_allocation_attempts,
        );
        let (cancel_tx, _) = watch::channel(false);

        Arc::new(Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                ports,
                shutting_down: false,
            }),
            runtime,
            probe,
            config,
            cancel_tx,
        })
    }

    /// Return a ready endpoint for the version, creating and probing a
    /// container first if needed.
    ///
    /// Cancel safe: dropping the returned future never strands a host port
    /// or an untracked container. Provisioning runs in its own task that
    /// owns the slot lock and records the instance before letting go.
    pub async fn ensure_running(
        self: &Arc<Self>,
        vd: &VersionedDefinition,
    ) -> Result<Endpoint, LifecycleError> {
        let key = vd.key();

        loop {
            let slot = self.slot_for(key)?;
            let mut state = Arc::clone(&slot).lock_owned().await;

            if state.evicted {
                debug!(%key, "Slot was evicted while waiting, retrying");
                continue;
            }
            if self.inner.lock().shutting_down {
                return Err(LifecycleError::ShuttingDown);
            }

            if state.instance.is_none() {
                let manager = Arc::clone(self);
                let vd = vd.clone();
                let task = tokio::spawn(async move {
                    let mut state = state;
                    match manager.provision(&vd, key).await {
                        Ok(instance) => {
                            state.instance = Some(instance);
                            Ok(state)
                        }
                        Err(e) => {
                            state.evicted = true;
                            manager.forget(key, &slot, None);
                            Err(e)
                        }
                    }
                });
                state = match task.await {
                    Ok(result) => result?,
                    Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                    Err(_) => return Err(LifecycleError::ShuttingDown),
                };
            }

            let Some(instance) = state.instance.as_mut() else {
                continue;
            };
            instance.last_accessed = Instant::now();
            let endpoint = Endpoint::local(instance.host_port);

            if instance.state == InstanceState::Ready {
                return Ok(endpoint);
            }

            let mut cancel = self.cancel_tx.subscribe();
            let outcome = wait_until_ready(
                self.probe.as_ref(),
                &endpoint,
                self.config.probe_attempts,
                self.config.probe_interval(),
                &mut cancel,
            )
            .await;
            instance.last_accessed = Instant::now();

            return match outcome {
                ProbeOutcome::Ready => {
                    instance.state = InstanceState::Ready;
                    info!(
                        %key,
                        container_id = %instance.container_id,
                        %endpoint,
                        "Instance ready"
                    );
                    Ok(endpoint)
                }
                ProbeOutcome::Exhausted => {
                    warn!(
                        %key,
                        container_id = %instance.container_id,
                        attempts = self.config.probe_attempts,
                        "Instance failed readiness probe, keeping it for retry"
                    );
                    Err(LifecycleError::NotReady {
                        key,
                        attempts: self.config.probe_attempts,
                    })
                }
                ProbeOutcome::Cancelled => Err(LifecycleError::ShuttingDown),
            };
        }
    }

    fn slot_for(&self, key: InstanceKey) -> Result<Arc<Slot>, LifecycleError> {
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            return Err(LifecycleError::ShuttingDown);
        }
        Ok(Arc::clone(inner.slots.entry(key).or_default()))
    }

    /// Drop `slot` from the map if it is still the current slot for `key`,
    /// and release its port.
    fn forget(&self, key: InstanceKey, slot: &Arc<Slot>, port: Option<u16>) {
        let mut inner = self.inner.lock();
        if inner.slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            inner.slots.remove(&key);
        }
        if let Some(port) = port {
            inner.ports.release(port);
        }
    }

    async fn provision(
        &self,
        vd: &VersionedDefinition,
        key: InstanceKey,
    ) -> Result<RunningInstance, LifecycleError> {
        let host_port = self.inner.lock().ports.allocate();
        let host_port = host_port.ok_or(LifecycleError::PortExhaustion {
            start: self.config.port_range_start,
            end: self.config.port_range_end,
        })?;

        let spec = container_spec(vd, host_port, &self.config.container_prefix);
        info!(
            %key,
            service = %vd.definition.name,
            image = %spec.image,
            host_port,
            "Provisioning container"
        );

        let container_id = match self.runtime.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                error!(%key, error = %e, "Failed to create container");
                self.inner.lock().ports.release(host_port);
                return Err(e.into());
            }
        };

        if let Err(e) = self.runtime.start(&container_id).await {
            error!(%key, container_id, error = %e, "Failed to start container");
            if let Err(rm) = self.runtime.remove(&container_id).await {
                warn!(%key, container_id, error = %rm, "Failed to remove unstarted container");
            }
            self.inner.lock().ports.release(host_port);
            return Err(e.into());
        }

        Ok(RunningInstance {
            container_id,
            host_port,
            state: InstanceState::Provisioning,
            last_accessed: Instant::now(),
        })
    }

    /// Kill then remove. Remove is attempted even if kill fails.
    async fn destroy(&self, key: InstanceKey, instance: &RunningInstance, report: &mut TeardownReport) {
        let container_id = &instance.container_id;

        if let Err(error) = self.runtime.kill(container_id, KILL_SIGNAL).await {
            warn!(%key, container_id, error = %error, "Failed to kill container");
            report.failures.push(TeardownFailure {
                key,
                container_id: container_id.clone(),
                error,
            });
        }
        if let Err(error) = self.runtime.remove(container_id).await {
            warn!(%key, container_id, error = %error, "Failed to remove container");
            report.failures.push(TeardownFailure {
                key,
                container_id: container_id.clone(),
                error,
            });
        }
        report.removed.push(key);
    }

    fn tracked_slots(&self) -> Vec<(InstanceKey, Arc<Slot>)> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .map(|(key, slot)| (*key, Arc::clone(slot)))
            .collect()
    }

    /// Reclaim every instance idle for longer than the idle timeout.
    ///
    /// Slots that are locked by a caller are in use and are skipped.
    pub async fn reap_idle(&self) -> TeardownReport {
        let idle_timeout = self.config.idle_timeout();
        let mut report = TeardownReport::default();

        for (key, slot) in self.tracked_slots() {
            let Ok(mut state) = slot.try_lock() else {
                debug!(%key, "Slot busy, skipping idle check");
                continue;
            };
            if state.evicted {
                continue;
            }

            let idle = match &state.instance {
                Some(instance) => Instant::now().saturating_duration_since(instance.last_accessed),
                None => {
                    // Unlocked and empty: no provisioning is in flight for it
                    state.evicted = true;
                    self.forget(key, &slot, None);
                    continue;
                }
            };
            if idle <= idle_timeout {
                continue;
            }

            let Some(instance) = state.instance.take() else {
                continue;
            };
            info!(
                %key,
                container_id = %instance.container_id,
                idle_secs = idle.as_secs(),
                "Instance idle timeout reached"
            );

            self.destroy(key, &instance, &mut report).await;
            state.evicted = true;
            self.forget(key, &slot, Some(instance.host_port));
        }

        report
    }

    /// Refuse new work and interrupt in-flight readiness waits.
    ///
    /// Called as soon as shutdown is signalled, before the listener drains.
    /// Tracked instances stay until [`stop_and_remove_all`](Self::stop_and_remove_all).
    pub fn begin_shutdown(&self) {
        let already = std::mem::replace(&mut self.inner.lock().shutting_down, true);
        self.cancel_tx.send_replace(true);
        if !already {
            info!("Lifecycle shutting down, new instances refused");
        }
    }

    /// Tear down every tracked instance.
    ///
    /// Implies [`begin_shutdown`](Self::begin_shutdown). Each slot is locked
    /// before it is torn down, so a creation in progress finishes first and
    /// is then removed as well.
    pub async fn stop_and_remove_all(&self) -> TeardownReport {
        self.begin_shutdown();
        let slots = self.tracked_slots();

        info!(instances = slots.len(), "Stopping all instances");
        let mut report = TeardownReport::default();

        for (key, slot) in slots {
            let mut state = slot.lock().await;
            let port = match state.instance.take() {
                Some(instance) => {
                    self.destroy(key, &instance, &mut report).await;
                    Some(instance.host_port)
                }
                None => None,
            };
            state.evicted = true;
            self.forget(key, &slot, port);
        }

        report
    }

    /// Run the idle sweep every `reap_interval` until shutdown
    pub async fn run_reaper(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.config.reap_interval();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let report = self.reap_idle().await;
                    if !report.removed.is_empty() {
                        info!(
                            removed = report.removed.len(),
                            failures = report.failures.len(),
                            "Idle sweep finished"
                        );
                    }
                    for failure in &report.failures {
                        warn!(failure = %failure, "Idle reclamation failure");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Idle reaper stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Point-in-time view of tracked instances
    pub fn snapshot(&self) -> Vec<InstanceStatus> {
        let now = Instant::now();
        let mut statuses: Vec<InstanceStatus> = self
            .tracked_slots()
            .into_iter()
            .filter_map(|(key, slot)| {
                let base = InstanceStatus {
                    key: key.to_string(),
                    service_id: key.service_id,
                    version_id: key.version_id,
                    container_id: None,
                    host_port: None,
                    state: None,
                    busy: true,
                    idle_secs: None,
                };
                let Ok(state) = slot.try_lock() else {
                    return Some(base);
                };
                let instance = state.instance.as_ref()?;
                Some(InstanceStatus {
                    container_id: Some(instance.container_id.clone()),
                    host_port: Some(instance.host_port),
                    state: Some(instance.state),
                    busy: false,
                    idle_secs: Some(now.saturating_duration_since(instance.last_accessed).as_secs()),
                    ..base
                })
            })
            .collect();
        statuses.sort_by(|a, b| (a.service_id, a.version_id).cmp(&(b.service_id, b.version_id)));
        statuses
    }

    /// Number of keys currently tracked
    pub fn tracked(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Number of host ports currently held
    pub fn ports_in_use(&self) -> usize {
        self.inner.lock().ports.in_use()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }
}
