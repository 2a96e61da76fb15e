//! Route registry: job id → loopback port of its live workload
//!
//! Read on every proxied request, written only when a job becomes active or
//! is purged. The lock is held for single map operations only.

use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct RouteRegistry {
    routes: RwLock<HashMap<String, u16>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a route, replacing any previous port for the job
    pub fn put(&self, job_id: impl Into<String>, port: u16) {
        self.routes.write().insert(job_id.into(), port);
    }

    pub fn get(&self, job_id: &str) -> Option<u16> {
        self.routes.read().get(job_id).copied()
    }

    /// Withdraw a route, returning the port it pointed to
    pub fn remove(&self, job_id: &str) -> Option<u16> {
        self.routes.write().remove(job_id)
    }

    /// Point-in-time copy of every registered job id
    pub fn keys(&self) -> Vec<String> {
        self.routes.read().keys().cloned().collect()
    }

    /// Point-in-time copy of every route, sorted by job id
    pub fn snapshot(&self) -> Vec<(String, u16)> {
        let mut routes: Vec<(String, u16)> = self
            .routes
            .read()
            .iter()
            .map(|(job_id, port)| (job_id.clone(), *port))
            .collect();
        routes.sort();
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}
