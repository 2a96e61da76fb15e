//! Jobgate - deploy a URL as a scheduler job and serve it on its own subdomain
//!
//! This library provides a single-listener gateway that:
//! - Accepts `PUT /services/{name}` on the control-plane host
//! - Submits a Nomad job that fetches and serves the given URL
//! - Polls until the job has a running allocation and publishes its route
//! - Proxies `<job_id>.<domain>` to the job's port on loopback
//! - Purges every job it created on shutdown

pub mod api;
pub mod config;
pub mod error;
pub mod naming;
pub mod nomad;
pub mod orchestrator;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod validation;
