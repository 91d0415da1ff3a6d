//! Port and subdomain leases
//!
//! A lease is held by exactly one control session and released when the
//! lease value is dropped, so every exit path of a session gives its port
//! and subdomain back.

use dashmap::DashSet;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Ports and subdomains currently leased by control sessions
#[derive(Debug, Default)]
pub struct Registry {
    ports: DashSet<u16>,
    subdomains: DashSet<String>,
    reserved: HashSet<u16>,
}

impl Registry {
    /// Create a registry where `reserved` ports can never be leased
    pub fn new(reserved: impl IntoIterator<Item = u16>) -> Arc<Self> {
        Arc::new(Self {
            ports: DashSet::new(),
            subdomains: DashSet::new(),
            reserved: reserved.into_iter().collect(),
        })
    }

    /// Take `port` if nobody holds it
    pub fn lease_port(self: &Arc<Self>, port: u16) -> Option<PortLease> {
        if self.reserved.contains(&port) || !self.ports.insert(port) {
            return None;
        }
        debug!("Leased port {}", port);
        Some(PortLease {
            registry: Arc::clone(self),
            port,
        })
    }

    /// Take `name` if nobody holds it
    pub fn lease_subdomain(self: &Arc<Self>, name: &str) -> Option<SubdomainLease> {
        if !self.subdomains.insert(name.to_string()) {
            return None;
        }
        debug!("Leased subdomain {}", name);
        Some(SubdomainLease {
            registry: Arc::clone(self),
            name: name.to_string(),
        })
    }

    pub fn is_port_leased(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    pub fn is_port_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }

    pub fn is_subdomain_leased(&self, name: &str) -> bool {
        self.subdomains.contains(name)
    }

    /// Number of leased ports
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Number of leased subdomains
    pub fn subdomain_count(&self) -> usize {
        self.subdomains.len()
    }
}

/// Exclusive hold on a tunnel port
#[derive(Debug)]
pub struct PortLease {
    registry: Arc<Registry>,
    port: u16,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.registry.ports.remove(&self.port);
        debug!("Released port {}", self.port);
    }
}

/// Exclusive hold on a subdomain label
#[derive(Debug)]
pub struct SubdomainLease {
    registry: Arc<Registry>,
    name: String,
}

impl SubdomainLease {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SubdomainLease {
    fn drop(&mut self) {
        self.registry.subdomains.remove(&self.name);
        debug!("Released subdomain {}", self.name);
    }
}
