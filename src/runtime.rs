//! Container runtime abstraction
//!
//! The lifecycle manager talks to containers only through
//! [`ContainerRuntime`]. Production uses the Docker implementation in
//! [`crate::docker`]; tests substitute an in-process fake.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Signal sent when an instance is reclaimed or torn down
pub const KILL_SIGNAL: &str = "SIGKILL";

/// Everything the runtime needs to create one container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    /// Image reference in `name:tag` form
    pub image: String,
    /// `KEY=value` assignments
    pub env: Vec<String>,
    /// Port the process inside the container listens on
    pub container_port: u16,
    /// Loopback port the container port is published on
    pub host_port: u16,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeOp {
    Create,
    Start,
    Kill,
    Remove,
}

impl fmt::Display for RuntimeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeOp::Create => "create",
            RuntimeOp::Start => "start",
            RuntimeOp::Kill => "kill",
            RuntimeOp::Remove => "remove",
        };
        f.write_str(s)
    }
}

/// A runtime call that failed
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{op} {target} failed: {message}")]
pub struct RuntimeError {
    pub op: RuntimeOp,
    /// Container id, or container name for `create`
    pub target: String,
    pub message: String,
}

impl RuntimeError {
    pub fn new(op: RuntimeOp, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            op,
            target: target.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its id. Does not start it.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Send `signal` to the container. A container that is gone or
    /// already stopped is not an error.
    async fn kill(&self, container_id: &str, signal: &str) -> Result<(), RuntimeError>;

    /// Remove the container. A container that is already gone is not an error.
    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_display() {
        let err = RuntimeError::new(RuntimeOp::Kill, "abc123", "daemon unavailable");
        assert_eq!(err.to_string(), "kill abc123 failed: daemon unavailable");
    }
}
