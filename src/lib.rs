//! Versiongate - a reverse proxy that runs versioned containers on demand
//!
//! This library provides a single-node gateway that:
//! - Routes HTTP traffic by Host header to registered services
//! - Picks a version per request from a weighted traffic split
//! - Creates a Docker container for a (service, version) on first use
//!   and waits until it answers its readiness probe
//! - Reclaims containers that have been idle for too long
//! - Tears every container down on shutdown
//! - Exposes an admin API for registering services, versions and splits

pub mod admin;
pub mod config;
pub mod db;
pub mod docker;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod ports;
pub mod probe;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod selector;
