/// Cluster lifecycle orchestration
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

use crate::config::ClusterConfig;
use crate::driver::{Driver, DriverError, Endpoint, VmHandle, VmSpec, VmState};
use crate::health::{HealthCheckError, HealthChecker};
use crate::provision::{ProvisionError, ProvisioningEngine};
use crate::remote::{ConnectionError, Session, Transport};
use crate::utils::cancel::CancelSignal;
use crate::utils::retry::RetryPolicy;

/// Port the driver reports for the VM's own API (docker-machine convention)
pub const VM_API_PORT: u16 = 2376;
/// Port the cluster API server listens on inside the VM
pub const CLUSTER_API_PORT: u16 = 8080;

/// Cluster lifecycle phase. Monotonic through
/// Created → Provisioning → Starting → Ready; Failed is reachable from any
/// non-terminal phase and left only through an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Provisioning,
    Starting,
    Ready,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Created => write!(f, "created"),
            Phase::Provisioning => write!(f, "provisioning"),
            Phase::Starting => write!(f, "starting"),
            Phase::Ready => write!(f, "ready"),
            Phase::Failed => write!(f, "failed"),
        }
    }
}

/// Error recorded on a Failed transition
#[derive(Debug, Clone, Error)]
pub enum ErrorKind {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Health(#[from] HealthCheckError),

    #[error("operation cancelled by caller")]
    Cancelled,
}

/// Mutable cluster state, owned by the orchestrator
#[derive(Debug, Clone)]
pub struct ClusterState {
    pub phase: Phase,
    pub last_error: Option<ErrorKind>,
    pub endpoint: Option<Url>,
    pub last_transition: DateTime<Utc>,
}

impl ClusterState {
    fn new() -> Self {
        Self {
            phase: Phase::Created,
            last_error: None,
            endpoint: None,
            last_transition: Utc::now(),
        }
    }

    fn transition(&mut self, phase: Phase) {
        if phase != self.phase {
            info!("Cluster phase: {} -> {}", self.phase, phase);
            self.phase = phase;
            self.last_transition = Utc::now();
        }
    }

    fn fail(&mut self, kind: ErrorKind) {
        self.last_error = Some(kind);
        self.transition(Phase::Failed);
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("another cluster operation is already in progress")]
    Busy,

    #[error("cluster previously failed ({reason}); run reset first")]
    RequiresReset { reason: String },

    #[error("cannot {action} while cluster is {phase}")]
    WrongPhase { action: &'static str, phase: Phase },

    #[error("cluster operation failed: {0}")]
    Operation(#[from] ErrorKind),
}

/// Point-in-time classification of the cluster, combining the orchestrator's
/// own state with what the driver and endpoint actually report
#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub phase: Phase,
    pub vm_state: Option<VmState>,
    pub endpoint: Option<Url>,
    pub last_error: Option<ErrorKind>,
    pub last_transition: DateTime<Utc>,
}

struct Inner {
    state: ClusterState,
    handle: Option<VmHandle>,
}

/// Drives a single cluster instance through its lifecycle. One orchestrator
/// owns one VM handle and one session at a time; concurrent operations are
/// rejected with `Busy` instead of queueing.
pub struct ClusterOrchestrator {
    config: ClusterConfig,
    driver: Arc<dyn Driver>,
    transport: Arc<dyn Transport>,
    engine: ProvisioningEngine,
    health: HealthChecker,
    connect_retry: RetryPolicy,
    inner: Mutex<Inner>,
}

impl ClusterOrchestrator {
    pub fn new(
        config: ClusterConfig,
        driver: Arc<dyn Driver>,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        let connect_retry = config.connect_retry.policy();
        Ok(Self {
            config,
            driver,
            transport,
            engine: ProvisioningEngine::new()?,
            health: HealthChecker::new()?,
            connect_retry,
            inner: Mutex::new(Inner {
                state: ClusterState::new(),
                handle: None,
            }),
        })
    }

    /// Swap the health checker, e.g. for a custom probe
    #[allow(dead_code)]
    pub fn with_health_checker(mut self, health: HealthChecker) -> Self {
        self.health = health;
        self
    }

    /// Bring the cluster up: acquire the VM, provision the kubelet, wait for
    /// the API endpoint. Idempotent: a Ready cluster returns its endpoint
    /// without touching the driver or the provisioning engine again.
    pub async fn start(&self, cancel: &CancelSignal) -> Result<Url, OrchestratorError> {
        let mut inner = self.inner.try_lock().map_err(|_| OrchestratorError::Busy)?;

        match inner.state.phase {
            Phase::Ready => {
                if let Some(endpoint) = inner.state.endpoint.clone() {
                    info!("Cluster is already running at {}", endpoint);
                    return Ok(endpoint);
                }
            }
            Phase::Failed => {
                return Err(OrchestratorError::RequiresReset {
                    reason: last_error_reason(&inner.state),
                });
            }
            _ => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ErrorKind::Cancelled),
            result = self.bring_up(&mut inner) => result,
        };

        match result {
            Ok(endpoint) => {
                inner.state.endpoint = Some(endpoint.clone());
                inner.state.last_error = None;
                inner.state.transition(Phase::Ready);
                Ok(endpoint)
            }
            Err(kind) => {
                inner.state.fail(kind.clone());
                Err(OrchestratorError::Operation(kind))
            }
        }
    }

    async fn bring_up(&self, inner: &mut Inner) -> Result<Url, ErrorKind> {
        inner.state.transition(Phase::Provisioning);

        let handle = self.acquire_vm(inner).await?;
        let address = self.driver.address(&handle).await.map_err(ErrorKind::from)?;
        info!("VM {} reachable at {}", handle.id(), address);

        let mut session = Session::open(
            self.transport.as_ref(),
            &address,
            &self.config.ssh,
            &self.connect_retry,
        )
        .await?;

        let provisioned = match self.engine.render_unit(&self.config.kubernetes) {
            Ok(script) => self.engine.apply(&mut session, &script).await,
            Err(e) => Err(e),
        };

        // The session is scoped to this provisioning run on every path
        let closed = session.close().await;
        provisioned?;
        if let Err(e) = closed {
            warn!("Remote session did not close cleanly: {}", e);
        }

        inner.state.transition(Phase::Starting);

        let endpoint = api_url(&address)?;
        self.health
            .poll(
                &endpoint,
                self.config.health.timeout(),
                self.config.health.interval(),
            )
            .await?;

        Ok(endpoint)
    }

    /// Acquire the cluster VM, creating and booting it as needed. The driver
    /// owns all machine state; this only walks it towards Running.
    async fn acquire_vm(&self, inner: &mut Inner) -> Result<VmHandle, ErrorKind> {
        let handle = match inner.handle.clone() {
            Some(handle) => handle,
            None => {
                let handle = self.driver.create(&self.vm_spec()).await?;
                inner.handle = Some(handle.clone());
                handle
            }
        };

        match self.driver.state(&handle).await? {
            VmState::Running => {}
            VmState::Created | VmState::Stopped => self.driver.start(&handle).await?,
            VmState::Absent => {
                // The VM vanished underneath a cached handle; recreate it
                self.driver.create(&self.vm_spec()).await?;
                self.driver.start(&handle).await?;
            }
            VmState::Error => {
                return Err(ErrorKind::Driver(DriverError::Permanent(format!(
                    "VM {} is in an error state",
                    handle.id()
                ))));
            }
        }

        Ok(handle)
    }

    fn vm_spec(&self) -> VmSpec {
        VmSpec {
            name: self.config.cluster_name.clone(),
            provider: self.config.machine.provider.clone(),
            create_args: self.config.machine.create_args.clone(),
        }
    }

    /// Shut the VM down and return the cluster to Created
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.try_lock().map_err(|_| OrchestratorError::Busy)?;

        if inner.state.phase == Phase::Failed {
            return Err(OrchestratorError::RequiresReset {
                reason: last_error_reason(&inner.state),
            });
        }

        if let Some(handle) = self.current_handle(&inner).await? {
            info!("Stopping VM {}", handle.id());
            if let Err(e) = self.driver.stop(&handle).await {
                let kind = ErrorKind::from(e);
                inner.state.fail(kind.clone());
                return Err(OrchestratorError::Operation(kind));
            }
            inner.handle = Some(handle);
        } else {
            info!("No VM found for cluster {}", self.config.cluster_name);
        }

        inner.state.endpoint = None;
        inner.state.last_error = None;
        inner.state.transition(Phase::Created);
        Ok(())
    }

    /// Leave Failed explicitly. The VM and any partially-applied
    /// provisioning are left as-is; the next start re-provisions.
    #[allow(dead_code)]
    pub async fn reset(&self) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.try_lock().map_err(|_| OrchestratorError::Busy)?;

        match inner.state.phase {
            Phase::Failed | Phase::Created => {
                inner.state.last_error = None;
                inner.state.endpoint = None;
                inner.state.transition(Phase::Created);
                Ok(())
            }
            phase => Err(OrchestratorError::WrongPhase {
                action: "reset",
                phase,
            }),
        }
    }

    /// Stop and remove the VM entirely
    pub async fn delete(&self) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.try_lock().map_err(|_| OrchestratorError::Busy)?;

        if let Some(handle) = self.current_handle(&inner).await? {
            self.driver
                .stop(&handle)
                .await
                .map_err(|e| OrchestratorError::Operation(e.into()))?;
            self.driver
                .delete(&handle)
                .await
                .map_err(|e| OrchestratorError::Operation(e.into()))?;
            info!("VM {} removed", handle.id());
        } else {
            info!("No VM found for cluster {}", self.config.cluster_name);
        }

        inner.handle = None;
        inner.state = ClusterState::new();
        Ok(())
    }

    /// Classify the current lifecycle state from the orchestrator's own
    /// record plus what the driver and endpoint report right now
    pub async fn status(&self) -> Result<ClusterStatus, OrchestratorError> {
        let inner = self.inner.try_lock().map_err(|_| OrchestratorError::Busy)?;

        let handle = self.current_handle(&inner).await?;
        let vm_state = match &handle {
            Some(handle) => Some(
                self.driver
                    .state(handle)
                    .await
                    .map_err(|e| OrchestratorError::Operation(e.into()))?,
            ),
            None => None,
        };

        if inner.state.phase == Phase::Failed {
            return Ok(self.status_from(&inner.state, vm_state));
        }

        if let (Some(handle), Some(VmState::Running)) = (&handle, vm_state) {
            let address = self
                .driver
                .address(handle)
                .await
                .map_err(|e| OrchestratorError::Operation(e.into()))?;
            let endpoint = api_url(&address).map_err(OrchestratorError::Operation)?;

            let phase = if inner.state.phase == Phase::Ready
                || self.health.probe_once(&endpoint).await
            {
                Phase::Ready
            } else {
                Phase::Starting
            };

            let mut status = self.status_from(&inner.state, vm_state);
            status.phase = phase;
            status.endpoint = Some(endpoint);
            return Ok(status);
        }

        Ok(self.status_from(&inner.state, vm_state))
    }

    fn status_from(&self, state: &ClusterState, vm_state: Option<VmState>) -> ClusterStatus {
        ClusterStatus {
            phase: state.phase,
            vm_state,
            endpoint: state.endpoint.clone(),
            last_error: state.last_error.clone(),
            last_transition: state.last_transition,
        }
    }

    /// Snapshot of the in-memory cluster state
    #[allow(dead_code)]
    pub async fn cluster_state(&self) -> Result<ClusterState, OrchestratorError> {
        let inner = self.inner.try_lock().map_err(|_| OrchestratorError::Busy)?;
        Ok(inner.state.clone())
    }

    async fn current_handle(&self, inner: &Inner) -> Result<Option<VmHandle>, OrchestratorError> {
        match &inner.handle {
            Some(handle) => Ok(Some(handle.clone())),
            None => self
                .driver
                .find(&self.config.cluster_name)
                .await
                .map_err(|e| OrchestratorError::Operation(e.into())),
        }
    }
}

fn last_error_reason(state: &ClusterState) -> String {
    state
        .last_error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown error".to_string())
}

/// Map the VM's reported endpoint onto the user-facing cluster API URL:
/// the scheme becomes http and the conventional internal port 2376 becomes
/// the API server port 8080.
pub fn api_url(address: &Endpoint) -> Result<Url, ErrorKind> {
    let port = if address.port == VM_API_PORT {
        CLUSTER_API_PORT
    } else {
        address.port
    };
    Url::parse(&format!("http://{}:{}", address.host, port)).map_err(|e| {
        ErrorKind::Driver(DriverError::Permanent(format!(
            "VM endpoint {} does not form a valid URL: {}",
            address, e
        )))
    })
}
