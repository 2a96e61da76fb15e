//! Contract between the orchestrator and the cluster scheduler
//!
//! The orchestrator only ever needs three operations from the scheduler:
//! submit a workload, list its allocations, and deregister it. Production
//! talks to Nomad (see [`crate::nomad`]); tests use in-memory fakes.

use crate::error::SchedulerError;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Environment variable carrying the URL the workload must serve
pub const ENV_URL: &str = "URL";
/// Environment variable telling the workload to execute the URL as a script
pub const ENV_IS_SCRIPT: &str = "IS_SCRIPT";

/// Everything the scheduler needs to run one job
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    pub job_id: String,
    pub image: String,
    pub driver: String,
    pub group: String,
    pub task: String,
    pub datacenters: Vec<String>,
    pub cpu_mhz: u32,
    pub memory_mb: u32,
    pub network_mbits: u32,
    /// Label of the single dynamically assigned port
    pub port_label: String,
    /// Port the workload listens on inside its container
    pub container_port: u16,
    pub env: BTreeMap<String, String>,
}

/// Client-side status of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStatus {
    Pending,
    Running,
    Complete,
    Failed,
    Lost,
    Unknown,
}

impl AllocationStatus {
    /// Parse the scheduler's status string
    pub fn from_client_status(status: &str) -> Self {
        match status {
            "pending" => AllocationStatus::Pending,
            "running" => AllocationStatus::Running,
            "complete" => AllocationStatus::Complete,
            "failed" => AllocationStatus::Failed,
            "lost" => AllocationStatus::Lost,
            _ => AllocationStatus::Unknown,
        }
    }
}

/// One placed instance of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: String,
    pub status: AllocationStatus,
    /// Host port assigned to the workload's HTTP port, once known
    pub port: Option<u16>,
}

impl Allocation {
    /// Port to route to, if this allocation is running and has one
    pub fn ready_port(&self) -> Option<u16> {
        match self.status {
            AllocationStatus::Running => self.port,
            _ => None,
        }
    }
}

/// First routable port among a job's allocations
pub fn first_ready_port(allocations: &[Allocation]) -> Option<u16> {
    allocations.iter().find_map(Allocation::ready_port)
}

/// Capability the orchestrator needs from the cluster scheduler.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Register a new job. Any error means nothing was registered.
    async fn submit(&self, spec: &WorkloadSpec) -> Result<(), SchedulerError>;

    /// List the job's allocations with their status and assigned port.
    /// May be empty while placement is still in flight.
    async fn list_running_allocations(
        &self,
        job_id: &str,
    ) -> Result<Vec<Allocation>, SchedulerError>;

    /// Stop the job; with `purge` every trace of it is removed. Must succeed
    /// for jobs that never reached the running state.
    async fn deregister(&self, job_id: &str, purge: bool) -> Result<(), SchedulerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(status: AllocationStatus, port: Option<u16>) -> Allocation {
        Allocation {
            id: "a1".to_string(),
            status,
            port,
        }
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(
            AllocationStatus::from_client_status("running"),
            AllocationStatus::Running
        );
        assert_eq!(
            AllocationStatus::from_client_status("pending"),
            AllocationStatus::Pending
        );
        assert_eq!(
            AllocationStatus::from_client_status("weird"),
            AllocationStatus::Unknown
        );
    }

    #[test]
    fn test_ready_port_requires_running_and_port() {
        assert_eq!(alloc(AllocationStatus::Running, Some(31050)).ready_port(), Some(31050));
        assert_eq!(alloc(AllocationStatus::Running, None).ready_port(), None);
        assert_eq!(alloc(AllocationStatus::Pending, Some(31050)).ready_port(), None);
        assert_eq!(alloc(AllocationStatus::Failed, Some(31050)).ready_port(), None);
    }

    #[test]
    fn test_first_ready_port_skips_unready() {
        let allocs = vec![
            alloc(AllocationStatus::Complete, Some(1)),
            alloc(AllocationStatus::Running, None),
            alloc(AllocationStatus::Running, Some(31051)),
        ];
        assert_eq!(first_ready_port(&allocs), Some(31051));
        assert_eq!(first_ready_port(&[]), None);
    }
}
