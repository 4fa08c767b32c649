/// Driver backed by an external docker-machine compatible lifecycle command
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Driver, DriverError, Endpoint, VmHandle, VmSpec, VmState};
use crate::config::MachineConfig;
use crate::utils::command::{CommandBuilder, CommandOutput};
use crate::utils::polling::PollingConfig;
use crate::utils::retry::RetryPolicy;

const START_TIMEOUT: Duration = Duration::from_secs(120);
const START_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// VM lifecycle driver that shells out to a docker-machine compatible CLI.
///
/// The heavy lifting (hypervisor API calls, boot media, guest networking)
/// stays in the external tool; this type only maps its subcommands and
/// output onto the `Driver` contract.
pub struct MachineDriver {
    config: MachineConfig,
    retry: RetryPolicy,
}

impl MachineDriver {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config,
            retry: RetryPolicy::default(),
        }
    }

    async fn machine_cmd<I, S>(&self, args: I) -> Result<CommandOutput, DriverError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        CommandBuilder::new(&self.config.command)
            .args(args)
            .context(format!("Failed to invoke {}", self.config.command))
            .output()
            .await
            .map_err(|e| DriverError::Permanent(e.to_string()))
    }

    /// Classify a failed lifecycle command by its stderr
    fn classify(stderr: &str) -> DriverError {
        let lowered = stderr.to_lowercase();
        let transient = ["timeout", "timed out", "busy", "lock", "temporar", "connection refused"]
            .iter()
            .any(|needle| lowered.contains(needle));
        if transient {
            DriverError::Transient(stderr.trim().to_string())
        } else {
            DriverError::Permanent(stderr.trim().to_string())
        }
    }

    /// Does this stderr mean the machine does not exist?
    fn is_missing(stderr: &str) -> bool {
        let lowered = stderr.to_lowercase();
        lowered.contains("does not exist")
            || lowered.contains("not found")
            || lowered.contains("no machine")
    }

    /// Map a status line from the lifecycle command onto a VmState
    fn parse_status(raw: &str) -> Result<VmState, DriverError> {
        match raw.trim() {
            "Running" => Ok(VmState::Running),
            "Starting" => Ok(VmState::Created),
            "Stopped" | "Stopping" | "Saved" | "Paused" => Ok(VmState::Stopped),
            "Error" => Ok(VmState::Error),
            other => Err(DriverError::Permanent(format!(
                "unrecognized machine status: {:?}",
                other
            ))),
        }
    }

    async fn wait_until_running(&self, handle: &VmHandle) -> Result<(), DriverError> {
        let polling = PollingConfig::new(
            START_TIMEOUT,
            START_POLL_INTERVAL,
            format!("Waiting for machine {} to report running", handle.id()),
        );

        let status = polling
            .poll_until(|| async {
                matches!(self.state(handle).await, Ok(VmState::Running))
            })
            .await;

        if status.is_ready() {
            Ok(())
        } else {
            Err(DriverError::Transient(format!(
                "machine {} did not reach running state within {}s",
                handle.id(),
                START_TIMEOUT.as_secs()
            )))
        }
    }
}

#[async_trait]
impl Driver for MachineDriver {
    async fn create(&self, spec: &VmSpec) -> Result<VmHandle, DriverError> {
        let handle = VmHandle::new(spec.name.clone());

        if self.state(&handle).await? != VmState::Absent {
            info!("Machine {} already exists, reusing it", spec.name);
            return Ok(handle);
        }

        info!(
            "Creating machine {} (provider: {})",
            spec.name, spec.provider
        );

        self.retry
            .run("machine create", DriverError::is_transient, || async {
                let mut args = vec![
                    "create".to_string(),
                    "--driver".to_string(),
                    spec.provider.clone(),
                ];
                args.extend(spec.create_args.iter().cloned());
                args.push(spec.name.clone());

                let output = self.machine_cmd(&args).await?;
                if output.success || output.stderr.to_lowercase().contains("already exists") {
                    Ok(())
                } else {
                    Err(Self::classify(&output.stderr))
                }
            })
            .await?;

        info!("Machine {} created", spec.name);
        Ok(handle)
    }

    async fn find(&self, name: &str) -> Result<Option<VmHandle>, DriverError> {
        let handle = VmHandle::new(name);
        match self.state(&handle).await? {
            VmState::Absent => Ok(None),
            _ => Ok(Some(handle)),
        }
    }

    async fn start(&self, handle: &VmHandle) -> Result<(), DriverError> {
        match self.state(handle).await? {
            VmState::Running => {
                debug!("Machine {} is already running", handle.id());
                return Ok(());
            }
            VmState::Absent => {
                return Err(DriverError::Permanent(format!(
                    "machine {} does not exist",
                    handle.id()
                )));
            }
            _ => {}
        }

        info!("Starting machine {}", handle.id());

        self.retry
            .run("machine start", DriverError::is_transient, || async {
                let output = self.machine_cmd(["start", handle.id()]).await?;
                if output.success || output.stderr.to_lowercase().contains("already running") {
                    Ok(())
                } else {
                    Err(Self::classify(&output.stderr))
                }
            })
            .await?;

        self.wait_until_running(handle).await
    }

    async fn stop(&self, handle: &VmHandle) -> Result<(), DriverError> {
        match self.state(handle).await? {
            VmState::Absent | VmState::Stopped | VmState::Created => {
                debug!("Machine {} is not running, nothing to stop", handle.id());
                return Ok(());
            }
            _ => {}
        }

        info!("Stopping machine {}", handle.id());

        self.retry
            .run("machine stop", DriverError::is_transient, || async {
                let output = self.machine_cmd(["stop", handle.id()]).await?;
                let stderr = output.stderr.to_lowercase();
                if output.success
                    || stderr.contains("already stopped")
                    || stderr.contains("not running")
                {
                    Ok(())
                } else {
                    Err(Self::classify(&output.stderr))
                }
            })
            .await
    }

    async fn delete(&self, handle: &VmHandle) -> Result<(), DriverError> {
        info!("Removing machine {}", handle.id());

        let output = self.machine_cmd(["rm", "-y", handle.id()]).await?;
        if output.success || Self::is_missing(&output.stderr) {
            Ok(())
        } else {
            Err(Self::classify(&output.stderr))
        }
    }

    async fn address(&self, handle: &VmHandle) -> Result<Endpoint, DriverError> {
        let output = self.machine_cmd(["url", handle.id()]).await?;
        if !output.success {
            return Err(Self::classify(&output.stderr));
        }
        Endpoint::parse(&output.stdout)
    }

    async fn state(&self, handle: &VmHandle) -> Result<VmState, DriverError> {
        let output = self.machine_cmd(["status", handle.id()]).await?;
        if !output.success {
            if Self::is_missing(&output.stderr) {
                return Ok(VmState::Absent);
            }
            return Err(Self::classify(&output.stderr));
        }
        Self::parse_status(&output.stdout)
    }
}
