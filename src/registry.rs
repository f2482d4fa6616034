//! Service registry: definitions, versions, and traffic splits
//!
//! The registry owns everything that is persisted about a service. The
//! request path only reads from it (`definition_by_host`,
//! `versioned_definition`); writes come from the admin API and are
//! validated here before they reach a [`ServiceStore`].

use crate::config::RegistryConfig;
use crate::lifecycle::InstanceKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Name that can never be used for a service
pub const RESERVED_SERVICE_NAME: &str = "admin";

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Weights of a traffic split must add up to this
pub const TOTAL_WEIGHT: u32 = 100;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service not found: {0}")]
    NotFound(String),
    #[error("version {version_id} not found for service {service}")]
    VersionNotFound { service: String, version_id: u64 },
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },
    #[error("no more hosts available")]
    HostsExhausted,
    #[error("storage error: {0}")]
    Storage(String),
}

impl RegistryError {
    fn invalid(what: &'static str, reason: impl Into<String>) -> Self {
        RegistryError::Invalid {
            what,
            reason: reason.into(),
        }
    }
}

/// A host-bound logical service with its versions and traffic splits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceDefinition {
    pub id: u64,
    pub name: String,
    pub host: String,
    pub versions: Vec<ServiceVersion>,
    pub traffic_weights: Vec<TrafficWeight>,
    /// The split used for version selection
    pub active_weight_id: Option<u64>,
    pub created_at: String,
}

impl ServiceDefinition {
    /// The authoritative traffic split, if one has been set
    pub fn active_weights(&self) -> Option<&TrafficWeight> {
        let id = self.active_weight_id?;
        self.traffic_weights.iter().find(|tw| tw.id == id)
    }

    pub fn version(&self, version_id: u64) -> Option<&ServiceVersion> {
        self.versions.iter().find(|v| v.id == version_id)
    }
}

/// One deployable image + port + env configuration of a service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceVersion {
    pub id: u64,
    pub service_id: u64,
    pub image_name: String,
    pub image_tag: String,
    /// Port the container listens on
    pub port: u16,
    /// `KEY=value` assignments
    pub env_vars: Vec<String>,
    pub created_at: String,
}

impl ServiceVersion {
    /// Image reference in `name:tag` form
    pub fn image(&self) -> String {
        format!("{}:{}", self.image_name, self.image_tag)
    }
}

/// A percentage split of traffic across versions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficWeight {
    pub id: u64,
    pub service_id: u64,
    pub weights: Vec<Weight>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Weight {
    pub version_id: u64,
    pub weight: u32,
}

/// A definition paired with the version chosen for one request
#[derive(Debug, Clone)]
pub struct VersionedDefinition {
    pub definition: ServiceDefinition,
    pub version: ServiceVersion,
}

impl VersionedDefinition {
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.definition.id, self.version.id)
    }
}

/// Payload for registering a service
#[derive(Debug, Clone, Deserialize)]
pub struct NewService {
    pub name: String,
    /// Generated from the host pool when absent
    #[serde(default)]
    pub host: Option<String>,
}

/// Payload for adding a version
#[derive(Debug, Clone, Deserialize)]
pub struct NewVersion {
    pub image_name: String,
    pub image_tag: String,
    pub port: u16,
    #[serde(default)]
    pub env_vars: Vec<String>,
}

/// Payload for adding a traffic split
#[derive(Debug, Clone, Deserialize)]
pub struct NewTrafficWeight {
    pub weights: Vec<Weight>,
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.trim().is_empty() {
        return Err(RegistryError::invalid("service", "name must not be empty"));
    }
    if name == RESERVED_SERVICE_NAME {
        return Err(RegistryError::invalid(
            "service",
            format!("name '{}' is reserved", RESERVED_SERVICE_NAME),
        ));
    }
    Ok(())
}

fn normalize_host(host: &str) -> Result<String, RegistryError> {
    let host = host.trim().to_lowercase();
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return Err(RegistryError::invalid("service", format!("bad host length: '{}'", host)));
    }
    if !host.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return Err(RegistryError::invalid("service", format!("bad host characters: '{}'", host)));
    }
    Ok(host)
}

impl NewVersion {
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.image_name.trim().is_empty() {
            return Err(RegistryError::invalid("version", "image_name must not be empty"));
        }
        if self.image_tag.trim().is_empty() {
            return Err(RegistryError::invalid("version", "image_tag must not be empty"));
        }
        if self.port == 0 {
            return Err(RegistryError::invalid("version", "port must be greater than 0"));
        }
        if let Some(bad) = self.env_vars.iter().find(|e| !e.contains('=')) {
            return Err(RegistryError::invalid(
                "version",
                format!("env var '{}' is not a KEY=value assignment", bad),
            ));
        }
        Ok(())
    }
}

impl NewTrafficWeight {
    /// Check the split against the versions of `service`
    pub fn validate(&self, service: &ServiceDefinition) -> Result<(), RegistryError> {
        if self.weights.is_empty() {
            return Err(RegistryError::invalid("traffic weight", "no weights given"));
        }

        let mut seen = HashSet::new();
        for w in &self.weights {
            if !seen.insert(w.version_id) {
                return Err(RegistryError::invalid(
                    "traffic weight",
                    format!("version {} listed twice", w.version_id),
                ));
            }
            if service.version(w.version_id).is_none() {
                return Err(RegistryError::VersionNotFound {
                    service: service.name.clone(),
                    version_id: w.version_id,
                });
            }
        }

        let sum: u32 = self.weights.iter().map(|w| w.weight).sum();
        if sum != TOTAL_WEIGHT {
            return Err(RegistryError::invalid(
                "traffic weight",
                format!("weights sum to {}, expected {}", sum, TOTAL_WEIGHT),
            ));
        }
        Ok(())
    }
}

/// Persistence seam for service definitions
pub trait ServiceStore: Send + Sync {
    fn list(&self) -> Result<Vec<ServiceDefinition>, RegistryError>;
    fn by_name(&self, name: &str) -> Result<Option<ServiceDefinition>, RegistryError>;
    fn by_host(&self, host: &str) -> Result<Option<ServiceDefinition>, RegistryError>;
    /// Fails with `AlreadyExists` if the name or host is taken
    fn create(&self, name: &str, host: &str) -> Result<ServiceDefinition, RegistryError>;
    fn add_version(&self, service_id: u64, version: &NewVersion)
        -> Result<ServiceVersion, RegistryError>;
    /// Stores the split and makes it the active one
    fn add_traffic_weight(&self, service_id: u64, weights: &[Weight])
        -> Result<TrafficWeight, RegistryError>;
}

/// Validating front of a [`ServiceStore`] with hostname assignment
pub struct ServiceRegistry {
    store: Arc<dyn ServiceStore>,
    /// Generated hostnames not yet bound to a service. Also serializes writes.
    available_hosts: Mutex<BTreeSet<String>>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn ServiceStore>, config: &RegistryConfig) -> Result<Self, RegistryError> {
        let mut hosts: BTreeSet<String> = (0..=config.host_pool_size)
            .map(|i| config.host_template.replace("{}", &i.to_string()))
            .collect();

        let existing = store.list()?;
        for service in &existing {
            hosts.remove(&service.host);
        }

        info!(
            services = existing.len(),
            available_hosts = hosts.len(),
            "Service registry loaded"
        );

        Ok(Self {
            store,
            available_hosts: Mutex::new(hosts),
        })
    }

    pub fn list(&self) -> Result<Vec<ServiceDefinition>, RegistryError> {
        self.store.list()
    }

    pub fn by_name(&self, name: &str) -> Result<ServiceDefinition, RegistryError> {
        self.store
            .by_name(name)?
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn definition_by_host(&self, host: &str) -> Result<ServiceDefinition, RegistryError> {
        self.store
            .by_host(host)?
            .ok_or_else(|| RegistryError::NotFound(host.to_string()))
    }

    pub fn versioned_definition(
        &self,
        host: &str,
        version_id: u64,
    ) -> Result<VersionedDefinition, RegistryError> {
        let definition = self.definition_by_host(host)?;
        let version = definition
            .version(version_id)
            .cloned()
            .ok_or_else(|| RegistryError::VersionNotFound {
                service: definition.name.clone(),
                version_id,
            })?;
        Ok(VersionedDefinition { definition, version })
    }

    pub fn register(&self, new: &NewService) -> Result<ServiceDefinition, RegistryError> {
        validate_name(&new.name)?;

        let mut hosts = self.available_hosts.lock();
        let host = match new.host.as_deref().filter(|h| !h.trim().is_empty()) {
            Some(h) => normalize_host(h)?,
            None => hosts.iter().next().cloned().ok_or(RegistryError::HostsExhausted)?,
        };

        let service = self.store.create(&new.name, &host)?;
        hosts.remove(&service.host);

        info!(name = %service.name, host = %service.host, id = service.id, "Service registered");
        Ok(service)
    }

    pub fn add_version(&self, name: &str, new: &NewVersion) -> Result<ServiceVersion, RegistryError> {
        new.validate()?;
        let _guard = self.available_hosts.lock();
        let service = self.by_name(name)?;
        let version = self.store.add_version(service.id, new)?;
        info!(
            service = %service.name,
            version_id = version.id,
            image = %version.image(),
            "Version added"
        );
        Ok(version)
    }

    pub fn add_traffic_weight(
        &self,
        name: &str,
        new: &NewTrafficWeight,
    ) -> Result<TrafficWeight, RegistryError> {
        let _guard = self.available_hosts.lock();
        let service = self.by_name(name)?;
        new.validate(&service)?;
        let weight = self.store.add_traffic_weight(service.id, &new.weights)?;
        info!(
            service = %service.name,
            weight_id = weight.id,
            weights = ?weight.weights,
            "Traffic split activated"
        );
        Ok(weight)
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// In-process store, used in tests and for throwaway setups
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    services: Vec<ServiceDefinition>,
    next_id: u64,
}

impl MemoryState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn service_mut(&mut self, service_id: u64) -> Result<&mut ServiceDefinition, RegistryError> {
        self.services
            .iter_mut()
            .find(|s| s.id == service_id)
            .ok_or_else(|| RegistryError::NotFound(format!("id {}", service_id)))
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServiceStore for MemoryStore {
    fn list(&self) -> Result<Vec<ServiceDefinition>, RegistryError> {
        Ok(self.state.lock().services.clone())
    }

    fn by_name(&self, name: &str) -> Result<Option<ServiceDefinition>, RegistryError> {
        Ok(self.state.lock().services.iter().find(|s| s.name == name).cloned())
    }

    fn by_host(&self, host: &str) -> Result<Option<ServiceDefinition>, RegistryError> {
        Ok(self.state.lock().services.iter().find(|s| s.host == host).cloned())
    }

    fn create(&self, name: &str, host: &str) -> Result<ServiceDefinition, RegistryError> {
        let mut state = self.state.lock();
        if state.services.iter().any(|s| s.name == name) {
            return Err(RegistryError::AlreadyExists(format!("service name '{}'", name)));
        }
        if state.services.iter().any(|s| s.host == host) {
            return Err(RegistryError::AlreadyExists(format!("host '{}'", host)));
        }

        let service = ServiceDefinition {
            id: state.next_id(),
            name: name.to_string(),
            host: host.to_string(),
            versions: Vec::new(),
            traffic_weights: Vec::new(),
            active_weight_id: None,
            created_at: now_rfc3339(),
        };
        state.services.push(service.clone());
        debug!(name, host, "Stored service in memory");
        Ok(service)
    }

    fn add_version(
        &self,
        service_id: u64,
        version: &NewVersion,
    ) -> Result<ServiceVersion, RegistryError> {
        let mut state = self.state.lock();
        let id = state.next_id();
        let service = state.service_mut(service_id)?;
        let stored = ServiceVersion {
            id,
            service_id,
            image_name: version.image_name.clone(),
            image_tag: version.image_tag.clone(),
            port: version.port,
            env_vars: version.env_vars.clone(),
            created_at: now_rfc3339(),
        };
        service.versions.push(stored.clone());
        Ok(stored)
    }

    fn add_traffic_weight(
        &self,
        service_id: u64,
        weights: &[Weight],
    ) -> Result<TrafficWeight, RegistryError> {
        let mut state = self.state.lock();
        let id = state.next_id();
        let service = state.service_mut(service_id)?;
        let stored = TrafficWeight {
            id,
            service_id,
            weights: weights.to_vec(),
            created_at: now_rfc3339(),
        };
        service.traffic_weights.push(stored.clone());
        service.active_weight_id = Some(id);
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ServiceRegistry {
        let config = RegistryConfig {
            database: String::new(),
            host_template: "app-{}.test.local".to_string(),
            host_pool_size: 2,
        };
        ServiceRegistry::new(Arc::new(MemoryStore::new()), &config).unwrap()
    }

    fn version(tag: &str) -> NewVersion {
        NewVersion {
            image_name: "hello".to_string(),
            image_tag: tag.to_string(),
            port: 8080,
            env_vars: vec!["GREETING=hi".to_string()],
        }
    }

    #[test]
    fn test_register_with_host() {
        let registry = registry();
        let svc = registry
            .register(&NewService {
                name: "web".to_string(),
                host: Some("Web.Example.com".to_string()),
            })
            .unwrap();

        assert_eq!(svc.host, "web.example.com");
        assert_eq!(registry.definition_by_host("web.example.com").unwrap().id, svc.id);
    }

    #[test]
    fn test_register_assigns_generated_hosts_until_exhausted() {
        let registry = registry();
        let mut hosts = Vec::new();
        for i in 0..3 {
            let svc = registry
                .register(&NewService { name: format!("svc{}", i), host: None })
                .unwrap();
            assert!(svc.host.starts_with("app-") && svc.host.ends_with(".test.local"));
            hosts.push(svc.host);
        }
        hosts.sort();
        hosts.dedup();
        assert_eq!(hosts.len(), 3);

        let err = registry
            .register(&NewService { name: "svc3".to_string(), host: None })
            .unwrap_err();
        assert!(matches!(err, RegistryError::HostsExhausted));
    }

    #[test]
    fn test_generated_hosts_skip_existing_services() {
        let store = Arc::new(MemoryStore::new());
        store.create("old", "app-0.test.local").unwrap();
        let config = RegistryConfig {
            database: String::new(),
            host_template: "app-{}.test.local".to_string(),
            host_pool_size: 0,
        };
        let registry = ServiceRegistry::new(store, &config).unwrap();

        let err = registry
            .register(&NewService { name: "new".to_string(), host: None })
            .unwrap_err();
        assert!(matches!(err, RegistryError::HostsExhausted));
    }

    #[test]
    fn test_register_rejects_reserved_and_empty_names() {
        let registry = registry();
        for name in ["", "  ", "admin"] {
            let err = registry
                .register(&NewService { name: name.to_string(), host: None })
                .unwrap_err();
            assert!(matches!(err, RegistryError::Invalid { .. }), "name {:?}", name);
        }
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let registry = registry();
        registry
            .register(&NewService { name: "web".to_string(), host: Some("a.local".to_string()) })
            .unwrap();

        let dup_name = registry
            .register(&NewService { name: "web".to_string(), host: Some("b.local".to_string()) })
            .unwrap_err();
        assert!(matches!(dup_name, RegistryError::AlreadyExists(_)));

        let dup_host = registry
            .register(&NewService { name: "api".to_string(), host: Some("a.local".to_string()) })
            .unwrap_err();
        assert!(matches!(dup_host, RegistryError::AlreadyExists(_)));
    }

    #[test]
    fn test_version_validation() {
        assert!(version("v1").validate().is_ok());

        let mut v = version("v1");
        v.image_name = String::new();
        assert!(v.validate().is_err());

        let mut v = version("");
        assert!(v.validate().is_err());
        v.image_tag = "v1".to_string();
        v.port = 0;
        assert!(v.validate().is_err());

        let mut v = version("v1");
        v.env_vars = vec!["NOEQUALS".to_string()];
        assert!(v.validate().is_err());
    }

    #[test]
    fn test_latest_traffic_weight_is_active() {
        let registry = registry();
        registry
            .register(&NewService { name: "web".to_string(), host: Some("web.local".to_string()) })
            .unwrap();
        let v1 = registry.add_version("web", &version("v1")).unwrap();
        let v2 = registry.add_version("web", &version("v2")).unwrap();

        let first = registry
            .add_traffic_weight(
                "web",
                &NewTrafficWeight { weights: vec![Weight { version_id: v1.id, weight: 100 }] },
            )
            .unwrap();
        let second = registry
            .add_traffic_weight(
                "web",
                &NewTrafficWeight {
                    weights: vec![
                        Weight { version_id: v1.id, weight: 30 },
                        Weight { version_id: v2.id, weight: 70 },
                    ],
                },
            )
            .unwrap();

        let svc = registry.by_name("web").unwrap();
        assert_eq!(svc.traffic_weights.len(), 2);
        assert_ne!(first.id, second.id);
        assert_eq!(svc.active_weights().unwrap().id, second.id);
    }

    #[test]
    fn test_traffic_weight_validation() {
        let registry = registry();
        registry
            .register(&NewService { name: "web".to_string(), host: Some("web.local".to_string()) })
            .unwrap();
        let v1 = registry.add_version("web", &version("v1")).unwrap();

        let bad_sum = NewTrafficWeight { weights: vec![Weight { version_id: v1.id, weight: 90 }] };
        assert!(matches!(
            registry.add_traffic_weight("web", &bad_sum).unwrap_err(),
            RegistryError::Invalid { .. }
        ));

        let unknown = NewTrafficWeight { weights: vec![Weight { version_id: 999, weight: 100 }] };
        assert!(matches!(
            registry.add_traffic_weight("web", &unknown).unwrap_err(),
            RegistryError::VersionNotFound { version_id: 999, .. }
        ));

        let empty = NewTrafficWeight { weights: vec![] };
        assert!(registry.add_traffic_weight("web", &empty).is_err());

        let dup = NewTrafficWeight {
            weights: vec![
                Weight { version_id: v1.id, weight: 50 },
                Weight { version_id: v1.id, weight: 50 },
            ],
        };
        assert!(registry.add_traffic_weight("web", &dup).is_err());

        assert!(registry.by_name("web").unwrap().active_weights().is_none());
    }

    #[test]
    fn test_versioned_definition() {
        let registry = registry();
        registry
            .register(&NewService { name: "web".to_string(), host: Some("web.local".to_string()) })
            .unwrap();
        let v1 = registry.add_version("web", &version("v1")).unwrap();

        let vd = registry.versioned_definition("web.local", v1.id).unwrap();
        assert_eq!(vd.version.image(), "hello:v1");
        assert_eq!(vd.key(), InstanceKey::new(vd.definition.id, v1.id));

        assert!(matches!(
            registry.versioned_definition("web.local", v1.id + 100).unwrap_err(),
            RegistryError::VersionNotFound { .. }
        ));
        assert!(matches!(
            registry.versioned_definition("nope.local", v1.id).unwrap_err(),
            RegistryError::NotFound(_)
        ));
    }

    #[test]
    fn test_add_version_unknown_service() {
        let registry = registry();
        assert!(matches!(
            registry.add_version("ghost", &version("v1")).unwrap_err(),
            RegistryError::NotFound(_)
        ));
    }
}
