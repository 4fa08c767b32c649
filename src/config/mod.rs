/// Configuration management for Kubelift
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::retry::RetryPolicy;

/// Main cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name (used for VM and resource naming)
    pub cluster_name: String,

    /// Kubernetes configuration rendered into the kubelet unit
    pub kubernetes: KubernetesConfig,

    /// VM lifecycle configuration
    #[serde(default)]
    pub machine: MachineConfig,

    /// Remote shell credentials for provisioning
    #[serde(default)]
    pub ssh: SshConfig,

    /// Cluster readiness polling
    #[serde(default)]
    pub health: HealthConfig,

    /// Remote connection retry policy
    #[serde(default)]
    pub connect_retry: RetryConfig,
}

/// Kubernetes-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// Kubernetes version to run (hyperkube image tag, e.g. "v1.3.0")
    pub version: String,

    /// Cluster DNS domain (e.g. "cluster.local")
    #[serde(default = "default_dns_domain")]
    pub dns_domain: String,

    /// Network plugin passed to the kubelet
    #[serde(default = "default_network_plugin")]
    pub network_plugin: String,

    /// Certificate paths on the VM filesystem
    #[serde(default)]
    pub certs: CertPaths,
}

/// Certificate locations inside the VM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertPaths {
    #[serde(default = "default_server_cert")]
    pub server_cert: String,

    #[serde(default = "default_server_key")]
    pub server_key: String,

    #[serde(default = "default_ca_cert")]
    pub ca_cert: String,
}

impl Default for CertPaths {
    fn default() -> Self {
        Self {
            server_cert: default_server_cert(),
            server_key: default_server_key(),
            ca_cert: default_ca_cert(),
        }
    }
}

/// VM lifecycle configuration
///
/// The actual lifecycle work is delegated to an external docker-machine
/// compatible command; `provider` selects its hypervisor backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Lifecycle command to invoke
    #[serde(default = "default_machine_command")]
    pub command: String,

    /// Hypervisor backend passed as `--driver`
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Extra arguments appended to the create call (sizing, ISO URL, ...)
    #[serde(default)]
    pub create_args: Vec<String>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            command: default_machine_command(),
            provider: default_provider(),
            create_args: Vec::new(),
        }
    }
}

/// Remote shell credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Private key path; omitted means the ssh agent/default keys are used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
            identity_file: None,
        }
    }
}

/// Cluster readiness polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_health_timeout(),
            interval_secs: default_health_interval(),
        }
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Remote connection retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub base_delay_secs: u64,

    #[serde(default = "default_retry_factor")]
    pub factor: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            base_delay_secs: default_retry_base_delay(),
            factor: default_retry_factor(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.attempts,
            Duration::from_secs(self.base_delay_secs),
            self.factor,
        )
    }
}

fn default_dns_domain() -> String {
    "cluster.local".to_string()
}

fn default_network_plugin() -> String {
    "cni".to_string()
}

fn default_server_cert() -> String {
    "/var/lib/localkube/certs/apiserver.crt".to_string()
}

fn default_server_key() -> String {
    "/var/lib/localkube/certs/apiserver.key".to_string()
}

fn default_ca_cert() -> String {
    "/var/lib/localkube/certs/ca.crt".to_string()
}

fn default_machine_command() -> String {
    "docker-machine".to_string()
}

fn default_provider() -> String {
    "virtualbox".to_string()
}

fn default_ssh_user() -> String {
    "docker".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_health_timeout() -> u64 {
    180
}

fn default_health_interval() -> u64 {
    2
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    1
}

fn default_retry_factor() -> u32 {
    2
}

impl ClusterConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClusterConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cluster_name.is_empty() {
            anyhow::bail!("cluster_name cannot be empty");
        }

        if self.kubernetes.version.is_empty() {
            anyhow::bail!("kubernetes.version cannot be empty");
        }

        if !self.kubernetes.dns_domain.contains('.') {
            anyhow::bail!(
                "kubernetes.dns_domain must be a domain name, got: {}",
                self.kubernetes.dns_domain
            );
        }

        if self.machine.command.is_empty() {
            anyhow::bail!("machine.command cannot be empty");
        }

        if self.ssh.user.is_empty() {
            anyhow::bail!("ssh.user cannot be empty");
        }

        if self.health.interval_secs == 0 {
            anyhow::bail!("health.interval_secs must be greater than zero");
        }

        if self.connect_retry.attempts == 0 {
            anyhow::bail!("connect_retry.attempts must be at least 1");
        }

        Ok(())
    }

    /// Generate an example configuration file
    pub fn example() -> Self {
        Self {
            cluster_name: "kubelift".to_string(),
            kubernetes: KubernetesConfig {
                version: "v1.3.0".to_string(),
                dns_domain: default_dns_domain(),
                network_plugin: default_network_plugin(),
                certs: CertPaths::default(),
            },
            machine: MachineConfig::default(),
            ssh: SshConfig::default(),
            health: HealthConfig::default(),
            connect_retry: RetryConfig::default(),
        }
    }
}
