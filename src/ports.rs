//! Ephemeral port allocation for backend processes

use crate::error::{Error, Result};
use dashmap::DashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use tracing::debug;

/// Bind attempts before giving up on finding an unleased port
const MAX_ALLOCATION_ATTEMPTS: usize = 16;

/// Hands out OS-assigned loopback ports and tracks which ones are leased
///
/// The kernel guarantees a port is free at the instant `allocate` binds it,
/// not that it stays free. The lease set keeps two live applications from
/// being handed the same port if the kernel recycles it before the first
/// backend has bound.
#[derive(Debug, Default)]
pub struct PortAllocator {
    leased: DashSet<u16>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtain a port that was free at the time of the call and lease it
    pub fn allocate(&self) -> Result<u16> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let port = probe_free_port()
                .map_err(|e| Error::LaunchFailure(format!("no ephemeral port available: {}", e)))?;
            if self.leased.insert(port) {
                debug!(port, "Allocated port");
                return Ok(port);
            }
            debug!(port, "Kernel returned a leased port, retrying");
        }
        Err(Error::LaunchFailure(
            "could not find an unleased ephemeral port".to_string(),
        ))
    }

    /// Allocate a port held by a guard that releases it unless kept
    pub fn lease(self: &Arc<Self>) -> Result<PortLease> {
        let port = self.allocate()?;
        Ok(PortLease {
            allocator: Arc::clone(self),
            port,
            kept: false,
        })
    }

    /// Return a port to the pool once its process has exited
    pub fn release(&self, port: u16) {
        if self.leased.remove(&port).is_some() {
            debug!(port, "Released port");
        }
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leased.contains(&port)
    }

    pub fn leased_count(&self) -> usize {
        self.leased.len()
    }
}

/// A leased port that goes back to the allocator when dropped.
///
/// Covers the window between allocation and a process taking ownership of
/// the port, including a cancelled submission.
#[derive(Debug)]
pub struct PortLease {
    allocator: Arc<PortAllocator>,
    port: u16,
    kept: bool,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Hand the port to its new owner, who must release it later
    pub fn keep(mut self) -> u16 {
        self.kept = true;
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if !self.kept {
            self.allocator.release(self.port);
        }
    }
}

/// Check that nothing is listening on the port right now
pub fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

fn probe_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}
