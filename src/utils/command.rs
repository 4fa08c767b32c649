/// Command execution utilities to reduce code duplication
use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Result from command execution with captured output
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
}

impl CommandOutput {
    /// Create from tokio Command output
    fn from_output(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            success: output.status.success(),
        }
    }

    /// Return Ok if successful, otherwise error with stderr
    pub fn into_result(self) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            anyhow::bail!("{}", self.stderr)
        }
    }
}

/// Builder for executing external commands with common patterns
pub struct CommandBuilder {
    command: Command,
    stdin_data: Option<Vec<u8>>,
    context_msg: Option<String>,
}

impl CommandBuilder {
    /// Create a new command builder
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        let mut command = Command::new(program);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        Self {
            command,
            stdin_data: None,
            context_msg: None,
        }
    }

    /// Add a single argument
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.command.arg(arg);
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    /// Pipe the given bytes into the child's stdin
    pub fn stdin_bytes(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin_data = Some(data.into());
        self
    }

    /// Set context message for error reporting
    pub fn context<S: Into<String>>(mut self, msg: S) -> Self {
        self.context_msg = Some(msg.into());
        self
    }

    /// Execute and return raw output
    pub async fn output(mut self) -> Result<CommandOutput> {
        let ctx = self
            .context_msg
            .clone()
            .unwrap_or_else(|| "Failed to execute command".to_string());

        let output = match self.stdin_data.take() {
            Some(data) => {
                self.command.stdin(Stdio::piped());
                let mut child = self.command.spawn().context(ctx.clone())?;
                let mut stdin = child
                    .stdin
                    .take()
                    .context("Child process has no stdin handle")?;
                stdin.write_all(&data).await.context(ctx.clone())?;
                drop(stdin);
                child.wait_with_output().await.context(ctx)?
            }
            None => self.command.output().await.context(ctx)?,
        };

        Ok(CommandOutput::from_output(output))
    }

    /// Execute and return stdout on success, error on failure
    #[allow(dead_code)]
    pub async fn run(self) -> Result<String> {
        self.output().await?.into_result()
    }

    /// Execute and ignore output (just check success)
    #[allow(dead_code)]
    pub async fn run_silent(self) -> Result<()> {
        self.output().await?.into_result().map(|_| ())
    }
}

/// Check if a command-line tool is installed
pub async fn check_tool_installed(
    tool_name: &str,
    version_args: &[&str],
    install_hint: &str,
) -> Result<()> {
    let output = CommandBuilder::new(tool_name)
        .args(version_args)
        .output()
        .await;

    match output {
        Ok(out) if out.success => Ok(()),
        _ => anyhow::bail!(
            "{} is not installed or not in PATH. {}",
            tool_name,
            install_hint
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_builder_basic() {
        // Test with a simple command that should exist on all systems
        let result = CommandBuilder::new("echo")
            .arg("test")
            .context("Testing echo command")
            .output()
            .await;

        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(output.success);
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("test"));
    }

    #[tokio::test]
    async fn test_command_builder_stdin() {
        let result = CommandBuilder::new("cat")
            .stdin_bytes("piped content")
            .output()
            .await;

        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(output.success);
        assert!(output.stdout.contains("piped content"));
    }

    #[tokio::test]
    async fn test_command_builder_failure_exit_code() {
        let result = CommandBuilder::new("sh")
            .arg("-c")
            .arg("exit 3")
            .output()
            .await;

        assert!(result.is_ok());
        let output = result.unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, 3);
    }
}
