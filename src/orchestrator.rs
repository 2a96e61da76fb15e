//! Job lifecycle: submit, poll until ready, publish the route, purge.
//!
//! The orchestrator is the only component that talks to the scheduler and the
//! only writer of the [`RouteRegistry`]. Scheduler calls never happen while
//! the registry lock is held.

use crate::config::{ReadinessConfig, WorkloadConfig};
use crate::error::OrchestratorError;
use crate::naming::derive_job_id;
use crate::registry::RouteRegistry;
use crate::scheduler::{first_ready_port, SchedulerClient, WorkloadSpec, ENV_IS_SCRIPT, ENV_URL};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Id derived, nothing sent to the scheduler yet
    Pending,
    /// Accepted by the scheduler
    Submitted,
    /// Waiting for a running allocation
    Polling,
    /// Allocation running with an assigned port
    Running,
    /// Route published, traffic is served
    Active,
    /// Deregistration in progress
    Purging,
    /// Gone from the scheduler and the registry
    Purged,
    /// Creation failed; absorbing
    Failed,
}

impl JobState {
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Failed)
                | (Submitted, Polling)
                | (Submitted, Failed)
                | (Polling, Running)
                | (Polling, Failed)
                | (Running, Active)
                | (Active, Purging)
                | (Purging, Purged)
                | (Purging, Active)
        )
    }
}

/// A job being created
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub target_url: String,
    pub is_script: bool,
    state: JobState,
}

impl Job {
    pub fn new(id: String, target_url: impl Into<String>, is_script: bool) -> Self {
        Self {
            id,
            target_url: target_url.into(),
            is_script,
            state: JobState::Pending,
        }
    }

    fn advance(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid job transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(job_id = %self.id, from = ?self.state, to = ?next, "Job state change");
        self.state = next;
    }

    fn mark_running(&mut self, port: u16) {
        debug!(job_id = %self.id, port, "Port assigned");
        self.advance(JobState::Running);
    }
}

/// Result of a successful creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedJob {
    pub job_id: String,
    pub port: u16,
    /// Public URL, `http://<job_id>.<domain>`
    pub url: String,
}

pub struct JobOrchestrator {
    scheduler: Arc<dyn SchedulerClient>,
    registry: Arc<RouteRegistry>,
    domain: String,
    workload: WorkloadConfig,
    datacenters: Vec<String>,
    readiness: ReadinessConfig,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl JobOrchestrator {
    pub fn new(
        scheduler: Arc<dyn SchedulerClient>,
        registry: Arc<RouteRegistry>,
        domain: impl Into<String>,
        workload: WorkloadConfig,
        readiness: ReadinessConfig,
    ) -> Self {
        Self {
            scheduler,
            registry,
            domain: domain.into(),
            workload,
            datacenters: vec!["dc1".to_string()],
            readiness,
            shutdown_rx: None,
        }
    }

    pub fn with_datacenters(mut self, datacenters: Vec<String>) -> Self {
        self.datacenters = datacenters;
        self
    }

    /// Abort in-flight creations (with rollback) once shutdown is signalled
    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    pub fn public_url(&self, job_id: &str) -> String {
        format!("http://{}.{}", job_id, self.domain)
    }

    /// Port of an active job. Never touches the scheduler.
    pub fn get_port(&self, job_id: &str) -> Option<u16> {
        self.registry.get(job_id)
    }

    pub fn build_spec(&self, job: &Job) -> WorkloadSpec {
        let mut env = BTreeMap::new();
        env.insert(ENV_URL.to_string(), job.target_url.clone());
        env.insert(ENV_IS_SCRIPT.to_string(), job.is_script.to_string());

        WorkloadSpec {
            job_id: job.id.clone(),
            image: self.workload.image.clone(),
            driver: self.workload.driver.clone(),
            group: self.workload.group.clone(),
            task: self.workload.task.clone(),
            datacenters: self.datacenters.clone(),
            cpu_mhz: self.workload.cpu_mhz,
            memory_mb: self.workload.memory_mb,
            network_mbits: self.workload.network_mbits,
            port_label: self.workload.port_label.clone(),
            container_port: self.workload.container_port,
            env,
        }
    }

    /// Provision a job serving `target_url` and publish its route.
    ///
    /// On error no route is published, and a job that was submitted but never
    /// became ready has been deregistered (best effort).
    pub async fn create(
        &self,
        name: &str,
        target_url: &str,
        is_script: bool,
    ) -> Result<CreatedJob, OrchestratorError> {
        let mut job = Job::new(derive_job_id(name), target_url, is_script);
        let spec = self.build_spec(&job);

        info!(job_id = %job.id, target_url, is_script, "Submitting job");

        if let Err(source) = self.scheduler.submit(&spec).await {
            job.advance(JobState::Failed);
            error!(job_id = %job.id, error = %source, "Job submission failed");
            return Err(OrchestratorError::Submit {
                job_id: job.id,
                source,
            });
        }
        job.advance(JobState::Submitted);

        job.advance(JobState::Polling);
        let port = match self.wait_until_ready(&job.id).await {
            Ok(port) => port,
            Err(e) => {
                job.advance(JobState::Failed);
                warn!(job_id = %job.id, error = %e, "Job never became ready, rolling back");
                self.rollback(&job.id).await;
                return Err(e);
            }
        };
        job.mark_running(port);

        self.registry.put(job.id.clone(), port);
        job.advance(JobState::Active);

        info!(job_id = %job.id, port, "Job created");

        Ok(CreatedJob {
            url: self.public_url(&job.id),
            job_id: job.id,
            port,
        })
    }

    /// Poll the scheduler until an allocation runs with an assigned port.
    async fn wait_until_ready(&self, job_id: &str) -> Result<u16, OrchestratorError> {
        let attempts = self.readiness.max_attempts;
        let interval = self.readiness.poll_interval();

        for attempt in 1..=attempts {
            let polled = self
                .until_shutdown(job_id, self.scheduler.list_running_allocations(job_id))
                .await?;

            match polled {
                Ok(allocations) => {
                    if let Some(port) = first_ready_port(&allocations) {
                        debug!(job_id, attempt, port, "Allocation running");
                        return Ok(port);
                    }
                    debug!(job_id, attempt, allocations = allocations.len(), "No running allocation yet");
                }
                Err(e) => {
                    warn!(job_id, attempt, error = %e, "Allocation lookup failed");
                }
            }

            if attempt < attempts {
                self.until_shutdown(job_id, tokio::time::sleep(interval))
                    .await?;
            }
        }

        Err(OrchestratorError::ReadinessTimeout {
            job_id: job_id.to_string(),
            attempts,
        })
    }

    /// Run `fut`, giving up if shutdown is signalled first
    async fn until_shutdown<F: Future>(
        &self,
        job_id: &str,
        fut: F,
    ) -> Result<F::Output, OrchestratorError> {
        let Some(mut shutdown_rx) = self.shutdown_rx.clone() else {
            return Ok(fut.await);
        };

        tokio::select! {
            output = fut => Ok(output),
            _ = wait_for_shutdown(&mut shutdown_rx) => Err(OrchestratorError::Cancelled {
                job_id: job_id.to_string(),
            }),
        }
    }

    async fn rollback(&self, job_id: &str) {
        match self.scheduler.deregister(job_id, true).await {
            Ok(()) => info!(job_id, "Rolled back job that never became ready"),
            Err(e) => error!(job_id, error = %e, "Rollback deregistration failed"),
        }
    }

    /// Deregister a job and withdraw its route.
    ///
    /// Works for jobs that never finished provisioning. On failure the route,
    /// if any, stays in place.
    pub async fn purge(&self, job_id: &str) -> Result<(), OrchestratorError> {
        debug!(job_id, state = ?JobState::Purging, "Purging job");

        self.scheduler
            .deregister(job_id, true)
            .await
            .map_err(|source| {
                warn!(job_id, error = %source, "Job deregistration failed");
                OrchestratorError::Purge {
                    job_id: job_id.to_string(),
                    source,
                }
            })?;

        let port = self.registry.remove(job_id);
        info!(job_id, port, state = ?JobState::Purged, "Job purged");
        Ok(())
    }

    /// Purge every tracked job, attempting all of them even if some fail.
    pub async fn shutdown_all(&self) -> Result<(), OrchestratorError> {
        let job_ids = self.registry.keys();
        info!(count = job_ids.len(), "Purging all jobs");

        let mut failures = Vec::new();
        for job_id in job_ids {
            if let Err(e) = self.purge(&job_id).await {
                failures.push(e);
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Shutdown(failures))
        }
    }
}

/// Resolve once the shutdown flag is set. Never resolves if the sender is gone.
async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    let sender_gone = shutdown_rx.wait_for(|&stop| stop).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}
