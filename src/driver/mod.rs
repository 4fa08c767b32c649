/// VM lifecycle driver abstraction
pub mod machine;

use async_trait::async_trait;
use thiserror::Error;

pub use machine::MachineDriver;

/// Lifecycle state of a virtual machine.
///
/// Legal transitions are Absent→Created→Running→Stopped→Absent; drivers must
/// not skip a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Absent,
    Created,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Absent => write!(f, "absent"),
            VmState::Created => write!(f, "created"),
            VmState::Running => write!(f, "running"),
            VmState::Stopped => write!(f, "stopped"),
            VmState::Error => write!(f, "error"),
        }
    }
}

/// Opaque handle to a driver-managed VM. The driver owns the machine state;
/// holders only pass the handle back into driver calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    id: String,
}

impl VmHandle {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Network endpoint reported by the driver (docker-machine convention:
/// `tcp://<ip>:2376`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `tcp://host:port` URL as reported by the lifecycle command
    pub fn parse(raw: &str) -> Result<Self, DriverError> {
        let parsed = url::Url::parse(raw.trim())
            .map_err(|e| DriverError::Permanent(format!("malformed endpoint {:?}: {}", raw, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| DriverError::Permanent(format!("endpoint {:?} has no host", raw)))?
            .to_string();
        let port = parsed
            .port()
            .ok_or_else(|| DriverError::Permanent(format!("endpoint {:?} has no port", raw)))?;
        Ok(Self::new(host, port))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

/// What the driver needs to create a VM
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub name: String,
    pub provider: String,
    pub create_args: Vec<String>,
}

/// Driver failure, classified for retry purposes.
///
/// Transient failures (resource busy, timeout) may be retried by the driver
/// itself; permanent failures (invalid spec, unsupported backend) never are.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("transient driver failure: {0}")]
    Transient(String),

    #[error("driver failure: {0}")]
    Permanent(String),
}

impl DriverError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transient(_))
    }
}

/// Capability interface for VM lifecycle backends.
///
/// Every operation is idempotent where the underlying state already satisfies
/// the request: `create` on an existing VM returns its handle, `start` on a
/// running VM and `stop` on a stopped or absent VM succeed without side
/// effect.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Create the VM (or return the handle of an already-existing one)
    async fn create(&self, spec: &VmSpec) -> Result<VmHandle, DriverError>;

    /// Look up an existing VM without creating it
    async fn find(&self, name: &str) -> Result<Option<VmHandle>, DriverError>;

    async fn start(&self, handle: &VmHandle) -> Result<(), DriverError>;

    async fn stop(&self, handle: &VmHandle) -> Result<(), DriverError>;

    async fn delete(&self, handle: &VmHandle) -> Result<(), DriverError>;

    /// The VM's remote API endpoint; only meaningful while Running
    async fn address(&self, handle: &VmHandle) -> Result<Endpoint, DriverError>;

    async fn state(&self, handle: &VmHandle) -> Result<VmState, DriverError>;
}
