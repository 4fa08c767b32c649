/// Transport over the OpenSSH client binary with a shared control socket
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{shell_quote, Connection, ConnectionError, RemoteCommand, RemoteOutput, Transport};
use crate::config::SshConfig;
use crate::driver::Endpoint;
use crate::utils::command::CommandBuilder;

/// ssh exits with 255 for its own failures; anything else is the remote
/// command's status.
const SSH_FAILURE_EXIT: i32 = 255;

/// Transport that drives the system `ssh` binary. A control-master process is
/// established per session and every command is multiplexed over its socket,
/// so the authenticated channel is set up once and torn down once.
pub struct SshTransport;

impl SshTransport {
    pub fn new() -> Self {
        Self
    }

    fn control_path(endpoint: &Endpoint, credentials: &SshConfig) -> PathBuf {
        std::env::temp_dir().join(format!(
            "kubelift-{}-{}-{}.ctl",
            credentials.user,
            endpoint.host,
            std::process::id()
        ))
    }

    /// Arguments that establish the backgrounded control master
    fn master_args(credentials: &SshConfig, control_path: &Path) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-p".to_string(),
            credentials.port.to_string(),
        ];
        if let Some(identity) = &credentials.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push("-M".to_string());
        args.push("-N".to_string());
        args.push("-f".to_string());
        args.push("-S".to_string());
        args.push(control_path.display().to_string());
        args
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &SshConfig,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        let target = format!("{}@{}", credentials.user, endpoint.host);
        let control_path = Self::control_path(endpoint, credentials);

        debug!("Opening ssh control connection to {}", target);

        let output = CommandBuilder::new("ssh")
            .args(Self::master_args(credentials, &control_path))
            .arg(&target)
            .context(format!("Failed to spawn ssh for {}", target))
            .output()
            .await
            .map_err(|e| ConnectionError::Connect {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        if !output.success {
            return Err(ConnectionError::Connect {
                endpoint: endpoint.to_string(),
                reason: output.stderr.trim().to_string(),
            });
        }

        Ok(Box::new(SshConnection {
            target,
            control_path,
            closed: false,
        }))
    }
}

/// One authenticated ssh channel, valid until closed or dropped
struct SshConnection {
    target: String,
    control_path: PathBuf,
    closed: bool,
}

impl SshConnection {
    async fn run_over_master(
        &self,
        remote_line: String,
        stdin: Option<&str>,
    ) -> Result<RemoteOutput, ConnectionError> {
        let mut builder = CommandBuilder::new("ssh")
            .arg("-S")
            .arg(self.control_path.display().to_string())
            .arg(&self.target)
            .arg("--")
            .arg(&remote_line)
            .context(format!("Failed to spawn ssh for {}", self.target));

        if let Some(data) = stdin {
            builder = builder.stdin_bytes(data.as_bytes().to_vec());
        }

        let output = builder.output().await.map_err(|e| ConnectionError::Transport {
            reason: e.to_string(),
        })?;

        if output.exit_code == SSH_FAILURE_EXIT {
            return Err(ConnectionError::Transport {
                reason: format!("ssh to {} failed: {}", self.target, output.stderr.trim()),
            });
        }

        Ok(RemoteOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        })
    }
}

#[async_trait]
impl Connection for SshConnection {
    async fn exec(&mut self, command: &RemoteCommand) -> Result<RemoteOutput, ConnectionError> {
        debug!("Remote exec on {}: {}", self.target, command);
        self.run_over_master(command.to_shell(), None).await
    }

    async fn write_file(
        &mut self,
        content: &str,
        remote_path: &str,
        mode: u32,
    ) -> Result<(), ConnectionError> {
        debug!("Uploading {} bytes to {}", content.len(), remote_path);

        let quoted = shell_quote(remote_path);
        let line = format!(
            "sudo tee {} >/dev/null && sudo chmod {:o} {}",
            quoted, mode, quoted
        );

        let output = self.run_over_master(line, Some(content)).await?;
        if !output.success() {
            return Err(ConnectionError::Transport {
                reason: format!(
                    "writing {} failed with status {}: {}",
                    remote_path,
                    output.exit_code,
                    output.stderr.trim()
                ),
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        debug!("Closing ssh control connection to {}", self.target);

        let output = CommandBuilder::new("ssh")
            .arg("-S")
            .arg(self.control_path.display().to_string())
            .arg("-O")
            .arg("exit")
            .arg(&self.target)
            .output()
            .await
            .map_err(|e| ConnectionError::Transport {
                reason: e.to_string(),
            })?;

        if !output.success {
            warn!(
                "ssh control connection to {} did not exit cleanly: {}",
                self.target,
                output.stderr.trim()
            );
        }
        Ok(())
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Synchronous teardown for sessions abandoned on an error path
        let _ = std::process::Command::new("ssh")
            .arg("-S")
            .arg(&self.control_path)
            .arg("-O")
            .arg("exit")
            .arg(&self.target)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
    }
}
