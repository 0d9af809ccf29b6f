//! Launchpad - runs submitted programs and proxies traffic to them
//!
//! This library provides a small application host that:
//! - Accepts program source over HTTP and launches it as a backend process
//! - Gives each backend its own ephemeral loopback port
//! - Routes `/apps/{id}/...` to that backend through a pooled reverse proxy
//! - Tracks every backend through Starting, Running, Crashed and Stopped
//! - Dispatches model inference requests to a hosted provider

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod submit;
pub mod supervisor;
