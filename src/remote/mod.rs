/// Remote command channel: scoped sessions over a pluggable transport
pub mod ssh;

use async_trait::async_trait;
use thiserror::Error;

pub use ssh::SshTransport;

use crate::config::SshConfig;
use crate::driver::Endpoint;
use crate::utils::retry::RetryPolicy;

/// Connection-level failure. `Connect` is transient and retried with backoff
/// when opening a session; everything else propagates unchanged.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("remote execution failed: {reason}")]
    Transport { reason: String },

    #[error("session to {endpoint} is already closed")]
    SessionClosed { endpoint: String },
}

impl ConnectionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectionError::Connect { .. })
    }
}

/// A remote command, assembled from structured parts so quoting and argument
/// ordering are enforced by the type rather than by string concatenation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    program: String,
    args: Vec<String>,
    sudo: bool,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            sudo: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Render the command as a single shell line with each word quoted as
    /// needed
    pub fn to_shell(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 2);
        if self.sudo {
            words.push("sudo".to_string());
        }
        words.push(shell_quote(&self.program));
        words.extend(self.args.iter().map(|a| shell_quote(a)));
        words.join(" ")
    }
}

impl std::fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_shell())
    }
}

/// Quote a word for POSIX sh unless it is already safe
pub(crate) fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '=' | ':'));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r#"'\''"#))
    }
}

/// Captured result of one remote command
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Something that can establish connections to a VM's shell
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &SshConfig,
    ) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// An established remote shell connection.
///
/// Implementations must tear themselves down on drop if `close` was never
/// called, so a session abandoned on an error path still releases its
/// resources.
#[async_trait]
pub trait Connection: Send {
    async fn exec(&mut self, command: &RemoteCommand) -> Result<RemoteOutput, ConnectionError>;

    async fn write_file(
        &mut self,
        content: &str,
        remote_path: &str,
        mode: u32,
    ) -> Result<(), ConnectionError>;

    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Scoped remote session. Opening retries transient connection failures with
/// bounded exponential backoff; once open, commands run without implicit
/// retry.
pub struct Session {
    connection: Box<dyn Connection>,
    endpoint: Endpoint,
    closed: bool,
}

impl Session {
    pub async fn open(
        transport: &dyn Transport,
        endpoint: &Endpoint,
        credentials: &SshConfig,
        retry: &RetryPolicy,
    ) -> Result<Self, ConnectionError> {
        let connection = retry
            .run(
                "remote connection",
                ConnectionError::is_transient,
                || transport.connect(endpoint, credentials),
            )
            .await?;

        Ok(Self {
            connection,
            endpoint: endpoint.clone(),
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::SessionClosed {
                endpoint: self.endpoint.to_string(),
            });
        }
        Ok(())
    }

    /// Run a command and capture its output. A non-zero exit status is not an
    /// error at this layer; callers decide what a failing command means.
    pub async fn run(&mut self, command: &RemoteCommand) -> Result<RemoteOutput, ConnectionError> {
        self.ensure_open()?;
        self.connection.exec(command).await
    }

    /// Write content to a file on the VM with the given octal mode
    pub async fn upload(
        &mut self,
        content: &str,
        remote_path: &str,
        mode: u32,
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.connection.write_file(content, remote_path, mode).await
    }

    /// Close the session explicitly. Dropping an unclosed session tears the
    /// connection down best-effort instead.
    pub async fn close(mut self) -> Result<(), ConnectionError> {
        self.closed = true;
        self.connection.close().await
    }
}
