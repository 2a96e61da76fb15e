use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default configuration file, read when no path is given
pub const DEFAULT_CONFIG_PATH: &str = "jobgate.toml";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener, domain and control-plane settings
    #[serde(default)]
    pub server: ServerConfig,

    /// How to reach the cluster scheduler
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Shape of every submitted workload
    #[serde(default)]
    pub workload: WorkloadConfig,

    /// Readiness polling budget
    #[serde(default)]
    pub readiness: ReadinessConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// HTTP port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Platform domain; jobs are served at `<job_id>.<domain>`
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Control-plane host (default: `api.<domain>`)
    pub api_host: Option<String>,

    /// Bearer token required for mutating control-plane calls.
    /// If not set, the control plane is open.
    pub api_token: Option<String>,

    /// Upper bound for connecting to a workload and receiving its response headers
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long in-flight connections may drain on shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Largest accepted control-plane request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl ServerConfig {
    pub fn api_host(&self) -> String {
        self.api_host
            .clone()
            .unwrap_or_else(|| format!("api.{}", self.domain))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            domain: default_domain(),
            api_host: None,
            api_token: None,
            request_timeout_secs: default_request_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Nomad HTTP API address
    #[serde(default = "default_scheduler_address")]
    pub address: String,

    /// ACL token sent as X-Nomad-Token
    pub token: Option<String>,

    pub region: Option<String>,

    pub namespace: Option<String>,

    /// Datacenters jobs may be placed in
    #[serde(default = "default_datacenters")]
    pub datacenters: Vec<String>,

    /// Timeout for each scheduler API call
    #[serde(default = "default_scheduler_timeout")]
    pub timeout_secs: u64,
}

impl SchedulerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            address: default_scheduler_address(),
            token: None,
            region: None,
            namespace: None,
            datacenters: default_datacenters(),
            timeout_secs: default_scheduler_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WorkloadConfig {
    /// Image that fetches URL and serves it over HTTP
    #[serde(default = "default_image")]
    pub image: String,

    #[serde(default = "default_driver")]
    pub driver: String,

    #[serde(default = "default_group")]
    pub group: String,

    #[serde(default = "default_task")]
    pub task: String,

    /// CPU reservation in MHz
    #[serde(default = "default_cpu_mhz")]
    pub cpu_mhz: u32,

    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,

    #[serde(default = "default_network_mbits")]
    pub network_mbits: u32,

    /// Label of the dynamic port the gateway routes to
    #[serde(default = "default_port_label")]
    pub port_label: String,

    /// Port the workload listens on inside the container
    #[serde(default = "default_container_port")]
    pub container_port: u16,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            driver: default_driver(),
            group: default_group(),
            task: default_task(),
            cpu_mhz: default_cpu_mhz(),
            memory_mb: default_memory_mb(),
            network_mbits: default_network_mbits(),
            port_label: default_port_label(),
            container_port: default_container_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReadinessConfig {
    /// Delay between two allocation polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Polls before a job is declared failed and rolled back
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl ReadinessConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    80
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_scheduler_address() -> String {
    "http://127.0.0.1:4646".to_string()
}

fn default_datacenters() -> Vec<String> {
    vec!["dc1".to_string()]
}

fn default_scheduler_timeout() -> u64 {
    10
}

fn default_image() -> String {
    "jobgate/url-server:latest".to_string()
}

fn default_driver() -> String {
    "docker".to_string()
}

fn default_group() -> String {
    "web".to_string()
}

fn default_task() -> String {
    "web-server".to_string()
}

fn default_cpu_mhz() -> u32 {
    100
}

fn default_memory_mb() -> u32 {
    128
}

fn default_network_mbits() -> u32 {
    10
}

fn default_port_label() -> String {
    "http".to_string()
}

fn default_container_port() -> u16 {
    80
}

fn default_poll_interval() -> u64 {
    250
}

fn default_max_attempts() -> u32 {
    30 // ~7.5s with the default interval
}

impl Config {
    /// Parse a config file. Call [`Config::validate`] once env overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to built-in defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply HOST, API_HOST and NOMAD_* overrides
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(domain) = get("HOST") {
            self.server.domain = domain;
        }
        if let Some(api_host) = get("API_HOST") {
            self.server.api_host = Some(api_host);
        }
        if let Some(address) = get("NOMAD_ADDR") {
            self.scheduler.address = address;
        }
        if let Some(token) = get("NOMAD_TOKEN") {
            self.scheduler.token = Some(token);
        }
        if let Some(region) = get("NOMAD_REGION") {
            self.scheduler.region = Some(region);
        }
        if let Some(namespace) = get("NOMAD_NAMESPACE") {
            self.scheduler.namespace = Some(namespace);
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.domain.trim().is_empty() {
            errors.push("server.domain must not be empty".to_string());
        }
        if self.server.api_host().eq_ignore_ascii_case(&self.server.domain) {
            errors.push("server.api_host must differ from server.domain".to_string());
        }
        if self.readiness.max_attempts == 0 {
            errors.push("readiness.max_attempts must be at least 1".to_string());
        }
        if self.readiness.poll_interval_ms == 0 {
            errors.push("readiness.poll_interval_ms must be greater than 0".to_string());
        }
        if self.workload.image.trim().is_empty() {
            errors.push("workload.image must not be empty".to_string());
        }
        if self.workload.port_label.trim().is_empty() {
            errors.push("workload.port_label must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
