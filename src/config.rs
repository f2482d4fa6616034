use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Proxy and admin listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Service registry storage and host assignment
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Container lifecycle settings
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port for routed traffic (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Hostname whose requests go straight to the admin API
    #[serde(default = "default_admin_host")]
    pub admin_host: String,

    /// Port for the admin API, bound on loopback only
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token required for admin writes and instance listing.
    /// If not set, the admin API is open.
    pub admin_token: Option<String>,

    /// Time allowed for open connections to finish after shutdown begins
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Max time to wait for a backend response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Local address of the admin API as seen by the forwarder
    pub fn admin_addr(&self) -> String {
        format!("127.0.0.1:{}", self.admin_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_host: default_admin_host(),
            admin_port: default_admin_port(),
            admin_token: None,
            drain_timeout_secs: default_drain_timeout(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// SQLite database file holding service definitions
    #[serde(default = "default_database_path")]
    pub database: String,

    /// Template for generated hostnames; `{}` is replaced by an index
    #[serde(default = "default_host_template")]
    pub host_template: String,

    /// Highest index used when generating hostnames (inclusive)
    #[serde(default = "default_host_pool_size")]
    pub host_pool_size: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            host_template: default_host_template(),
            host_pool_size: default_host_pool_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Instances unused for longer than this are reclaimed
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Interval between idle sweeps
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// First host port handed out to containers
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Last host port handed out to containers (inclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Random draws before falling back to a linear scan of the range
    #[serde(default = "default_port_allocation_attempts")]
    pub port_allocation_attempts: u32,

    /// Readiness probe attempts before giving up
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,

    /// Delay between readiness probe attempts in milliseconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// Timeout for a single probe request in milliseconds
    #[serde(default = "default_probe_request_timeout")]
    pub probe_request_timeout_ms: u64,

    /// Prefix for container names
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    /// Docker host URL (default: DOCKER_HOST or local socket)
    pub docker_host: Option<String>,
}

impl LifecycleConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_request_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_request_timeout_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            reap_interval_secs: default_reap_interval(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            port_allocation_attempts: default_port_allocation_attempts(),
            probe_attempts: default_probe_attempts(),
            probe_interval_ms: default_probe_interval(),
            probe_request_timeout_ms: default_probe_request_timeout(),
            container_prefix: default_container_prefix(),
            docker_host: None,
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_host() -> String {
    "admin.versiongate.local".to_string()
}

fn default_admin_port() -> u16 {
    1323
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_database_path() -> String {
    "versiongate.sqlite3".to_string()
}

fn default_host_template() -> String {
    "app-{}.versiongate.local".to_string()
}

fn default_host_pool_size() -> u32 {
    100
}

fn default_idle_timeout() -> u64 {
    120 // 2 minutes
}

fn default_reap_interval() -> u64 {
    70
}

fn default_port_range_start() -> u16 {
    8000
}

fn default_port_range_end() -> u16 {
    8999
}

fn default_port_allocation_attempts() -> u32 {
    4096
}

fn default_probe_attempts() -> u32 {
    30
}

fn default_probe_interval() -> u64 {
    1000
}

fn default_probe_request_timeout() -> u64 {
    2000
}

fn default_container_prefix() -> String {
    "versiongate".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let lifecycle = &self.lifecycle;

        if lifecycle.port_range_start == 0 {
            errors.push("lifecycle.port_range_start must be greater than 0".to_string());
        }
        if lifecycle.port_range_start > lifecycle.port_range_end {
            errors.push(format!(
                "lifecycle port range is empty ({}..={})",
                lifecycle.port_range_start, lifecycle.port_range_end
            ));
        }
        if lifecycle.port_allocation_attempts == 0 {
            errors.push("lifecycle.port_allocation_attempts must be greater than 0".to_string());
        }
        if lifecycle.probe_attempts == 0 {
            errors.push("lifecycle.probe_attempts must be greater than 0".to_string());
        }
        if lifecycle.reap_interval_secs == 0 {
            errors.push("lifecycle.reap_interval_secs must be greater than 0".to_string());
        }
        if self.server.admin_host.trim().is_empty() {
            errors.push("server.admin_host must not be empty".to_string());
        }
        if self.server.admin_port == self.server.port {
            errors.push(format!(
                "server.admin_port ({}) must differ from server.port",
                self.server.admin_port
            ));
        }
        if !self.registry.host_template.contains("{}") {
            errors.push("registry.host_template must contain '{}'".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
