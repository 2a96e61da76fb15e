//! Nomad implementation of [`SchedulerClient`] over the HTTP API

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::scheduler::{Allocation, AllocationStatus, SchedulerClient, WorkloadSpec};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

const TOKEN_HEADER: &str = "X-Nomad-Token";

/// Client for the subset of the Nomad API the orchestrator needs
pub struct NomadClient {
    http_client: reqwest::Client,
    address: String,
    token: Option<String>,
    region: Option<String>,
    namespace: Option<String>,
    /// Label of the dynamic port to report for running allocations
    port_label: String,
}

impl NomadClient {
    pub fn new(config: &SchedulerConfig, port_label: impl Into<String>) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create scheduler HTTP client: {}", e))?;

        Ok(Self {
            http_client,
            address: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            region: config.region.clone(),
            namespace: config.namespace.clone(),
            port_label: port_label.into(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .http_client
            .request(method, format!("{}{}", self.address, path));

        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        if let Some(region) = &self.region {
            builder = builder.query(&[("region", region)]);
        }
        if let Some(namespace) = &self.namespace {
            builder = builder.query(&[("namespace", namespace)]);
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, SchedulerError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SchedulerError::Api {
                status: status.as_u16(),
                message: message.trim().to_string(),
            });
        }
        Ok(response)
    }

    /// Probe the local agent; used at startup to report connectivity
    pub async fn agent_self(&self) -> Result<(), SchedulerError> {
        self.send(self.request(Method::GET, "/v1/agent/self")).await?;
        Ok(())
    }

    async fn allocation_port(&self, alloc_id: &str) -> Result<Option<u16>, SchedulerError> {
        let path = format!("/v1/allocation/{}", urlencoding::encode(alloc_id));
        let detail: AllocationDetail = self
            .send(self.request(Method::GET, &path))
            .await?
            .json()
            .await?;
        Ok(detail.port_for_label(&self.port_label))
    }
}

#[async_trait]
impl SchedulerClient for NomadClient {
    async fn submit(&self, spec: &WorkloadSpec) -> Result<(), SchedulerError> {
        let body = RegisterRequest {
            job: NomadJob::from_spec(spec),
        };
        self.send(self.request(Method::PUT, "/v1/jobs").json(&body))
            .await?;
        debug!(job_id = %spec.job_id, "Job registered with Nomad");
        Ok(())
    }

    async fn list_running_allocations(
        &self,
        job_id: &str,
    ) -> Result<Vec<Allocation>, SchedulerError> {
        let path = format!("/v1/job/{}/allocations", urlencoding::encode(job_id));
        let stubs: Vec<AllocationStub> = self
            .send(self.request(Method::GET, &path))
            .await?
            .json()
            .await?;

        let mut allocations = Vec::with_capacity(stubs.len());
        for stub in stubs {
            let status = AllocationStatus::from_client_status(&stub.client_status);
            let port = if status == AllocationStatus::Running {
                match self.allocation_port(&stub.id).await {
                    Ok(port) => port,
                    Err(e) => {
                        debug!(job_id, alloc_id = %stub.id, error = %e, "Allocation lookup failed, skipping");
                        continue;
                    }
                }
            } else {
                None
            };
            allocations.push(Allocation {
                id: stub.id,
                status,
                port,
            });
        }

        Ok(allocations)
    }

    async fn deregister(&self, job_id: &str, purge: bool) -> Result<(), SchedulerError> {
        let path = format!("/v1/job/{}", urlencoding::encode(job_id));
        let builder = self
            .request(Method::DELETE, &path)
            .query(&[("purge", purge)]);
        self.send(builder).await?;
        debug!(job_id, purge, "Job deregistered from Nomad");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterRequest {
    job: NomadJob,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct NomadJob {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    #[serde(rename = "Type")]
    job_type: &'static str,
    datacenters: Vec<String>,
    task_groups: Vec<TaskGroup>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TaskGroup {
    name: String,
    count: u32,
    networks: Vec<NetworkResource>,
    tasks: Vec<Task>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct NetworkResource {
    #[serde(rename = "MBits", default, skip_serializing_if = "Option::is_none")]
    mbits: Option<u32>,
    #[serde(default)]
    dynamic_ports: Option<Vec<Port>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Port {
    label: String,
    #[serde(default)]
    value: u16,
    #[serde(default)]
    to: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Task {
    name: String,
    driver: String,
    config: serde_json::Value,
    env: BTreeMap<String, String>,
    resources: Resources,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Resources {
    #[serde(rename = "CPU")]
    cpu: u32,
    #[serde(rename = "MemoryMB")]
    memory_mb: u32,
}

impl NomadJob {
    fn from_spec(spec: &WorkloadSpec) -> Self {
        let network = NetworkResource {
            mbits: Some(spec.network_mbits),
            dynamic_ports: Some(vec![Port {
                label: spec.port_label.clone(),
                value: 0,
                to: spec.container_port,
            }]),
        };

        let task = Task {
            name: spec.task.clone(),
            driver: spec.driver.clone(),
            config: serde_json::json!({
                "image": spec.image,
                "ports": [spec.port_label],
            }),
            env: spec.env.clone(),
            resources: Resources {
                cpu: spec.cpu_mhz,
                memory_mb: spec.memory_mb,
            },
        };

        Self {
            id: spec.job_id.clone(),
            name: spec.job_id.clone(),
            job_type: "service",
            datacenters: spec.datacenters.clone(),
            task_groups: vec![TaskGroup {
                name: spec.group.clone(),
                count: 1,
                networks: vec![network],
                tasks: vec![task],
            }],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AllocationStub {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    client_status: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct AllocationDetail {
    #[serde(default)]
    allocated_resources: Option<AllocatedResources>,
    /// Pre-1.0 layout
    #[serde(default)]
    resources: Option<LegacyResources>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct AllocatedResources {
    #[serde(default)]
    shared: Option<SharedResources>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct SharedResources {
    #[serde(default)]
    ports: Option<Vec<PortMapping>>,
    #[serde(default)]
    networks: Option<Vec<NetworkResource>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortMapping {
    label: String,
    value: u16,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct LegacyResources {
    #[serde(default)]
    networks: Option<Vec<NetworkResource>>,
}

fn dynamic_port(networks: Option<&Vec<NetworkResource>>, label: &str) -> Option<u16> {
    networks?
        .iter()
        .filter_map(|n| n.dynamic_ports.as_ref())
        .flatten()
        .find(|p| p.label == label && p.value != 0)
        .map(|p| p.value)
}

impl AllocationDetail {
    fn port_for_label(&self, label: &str) -> Option<u16> {
        let shared = self
            .allocated_resources
            .as_ref()
            .and_then(|r| r.shared.as_ref());

        shared
            .and_then(|s| s.ports.as_ref())
            .and_then(|ports| ports.iter().find(|p| p.label == label))
            .map(|p| p.value)
            .or_else(|| dynamic_port(shared.and_then(|s| s.networks.as_ref()), label))
            .or_else(|| {
                dynamic_port(
                    self.resources.as_ref().and_then(|r| r.networks.as_ref()),
                    label,
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> WorkloadSpec {
        let mut env = BTreeMap::new();
        env.insert("URL".to_string(), "https://example.com".to_string());
        env.insert("IS_SCRIPT".to_string(), "false".to_string());
        WorkloadSpec {
            job_id: "my-app-1234".to_string(),
            image: "jobgate/url-server:latest".to_string(),
            driver: "docker".to_string(),
            group: "web".to_string(),
            task: "web-server".to_string(),
            datacenters: vec!["dc1".to_string()],
            cpu_mhz: 100,
            memory_mb: 128,
            network_mbits: 10,
            port_label: "http".to_string(),
            container_port: 80,
            env,
        }
    }

    #[test]
    fn test_register_request_shape() {
        let body = serde_json::to_value(RegisterRequest {
            job: NomadJob::from_spec(&spec()),
        })
        .unwrap();
        let job = &body["Job"];

        assert_eq!(job["ID"], "my-app-1234");
        assert_eq!(job["Name"], "my-app-1234");
        assert_eq!(job["Type"], "service");
        assert_eq!(job["Datacenters"][0], "dc1");

        let group = &job["TaskGroups"][0];
        assert_eq!(group["Count"], 1);
        assert_eq!(group["Networks"][0]["MBits"], 10);
        assert_eq!(group["Networks"][0]["DynamicPorts"][0]["Label"], "http");
        assert_eq!(group["Networks"][0]["DynamicPorts"][0]["To"], 80);

        let task = &group["Tasks"][0];
        assert_eq!(task["Driver"], "docker");
        assert_eq!(task["Config"]["image"], "jobgate/url-server:latest");
        assert_eq!(task["Config"]["ports"][0], "http");
        assert_eq!(task["Env"]["URL"], "https://example.com");
        assert_eq!(task["Env"]["IS_SCRIPT"], "false");
        assert_eq!(task["Resources"]["CPU"], 100);
        assert_eq!(task["Resources"]["MemoryMB"], 128);
    }

    #[test]
    fn test_port_from_shared_ports() {
        let detail: AllocationDetail = serde_json::from_str(
            r#"{
                "ID": "a1",
                "AllocatedResources": {
                    "Shared": {
                        "Ports": [
                            {"Label": "metrics", "Value": 25000, "To": 9090, "HostIP": "10.0.0.2"},
                            {"Label": "http", "Value": 31050, "To": 80, "HostIP": "10.0.0.2"}
                        ],
                        "Networks": null
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(detail.port_for_label("http"), Some(31050));
        assert_eq!(detail.port_for_label("missing"), None);
    }

    #[test]
    fn test_port_from_shared_networks() {
        let detail: AllocationDetail = serde_json::from_str(
            r#"{
                "AllocatedResources": {
                    "Shared": {
                        "Networks": [{"MBits": 10, "DynamicPorts": [{"Label": "http", "Value": 28001}]}]
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(detail.port_for_label("http"), Some(28001));
    }

    #[test]
    fn test_port_from_legacy_resources() {
        let detail: AllocationDetail = serde_json::from_str(
            r#"{
                "Resources": {
                    "Networks": [{"IP": "10.0.0.3", "DynamicPorts": [{"Label": "http", "Value": 27017}]}]
                }
            }"#,
        )
        .unwrap();

        assert_eq!(detail.port_for_label("http"), Some(27017));
    }

    #[test]
    fn test_no_port_when_unassigned() {
        let detail: AllocationDetail = serde_json::from_str(r#"{"AllocatedResources": null}"#).unwrap();
        assert_eq!(detail.port_for_label("http"), None);
    }

    #[test]
    fn test_allocation_stub_parsing() {
        let stubs: Vec<AllocationStub> = serde_json::from_str(
            r#"[
                {"ID": "a1", "ClientStatus": "running", "DesiredStatus": "run"},
                {"ID": "a2", "ClientStatus": "pending"}
            ]"#,
        )
        .unwrap();

        assert_eq!(stubs.len(), 2);
        assert_eq!(stubs[0].id, "a1");
        assert_eq!(
            AllocationStatus::from_client_status(&stubs[1].client_status),
            AllocationStatus::Pending
        );
    }

    #[test]
    fn test_client_trims_address() {
        let config = SchedulerConfig {
            address: "http://nomad:4646/".to_string(),
            ..SchedulerConfig::default()
        };
        let client = NomadClient::new(&config, "http").unwrap();
        assert_eq!(client.address(), "http://nomad:4646");
    }
}
