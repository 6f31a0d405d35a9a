// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote command execution against cluster nodes.
//!
//! [`RemoteExecutor`] runs shell commands and transfers files on one
//! [`Instance`] at a time through a pluggable [`RemoteTransport`]. Every call
//! holds a slot of a process-wide semaphore for as long as its session is
//! open, which bounds the number of simultaneous connections the control
//! plane keeps. Slots are released by dropping the [`RemoteSessionGuard`], so
//! early returns and errors give them back too.
//!
//! Two transports ship with the crate:
//! - [`SshTransport`] shells out to the system `ssh` client.
//! - [`MockTransport`] records calls in memory for tests.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::model::Instance;

/// Default cap on concurrently open remote sessions.
pub const DEFAULT_SESSION_LIMIT: usize = 100;

/// Errors from remote operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RemoteError {
    /// Instance has no address the control plane can reach.
    #[error("Instance '{0}' has no reachable address")]
    NoAddress(String),

    /// Session could not be established.
    #[error("Failed to connect to '{instance}': {reason}")]
    ConnectFailed {
        /// Instance name.
        instance: String,
        /// Underlying reason.
        reason: String,
    },

    /// Command exited non-zero and the caller asked for that to be an error.
    #[error("Command '{command}' on '{instance}' failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        instance: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Operation did not finish in time.
    #[error("Operation on '{instance}' timed out after {timeout:?}")]
    Timeout {
        instance: String,
        timeout: Duration,
    },

    /// File could not be found on the node.
    #[error("File '{path}' not found on '{instance}'")]
    FileNotFound { instance: String, path: String },

    /// Session semaphore closed; the executor is shutting down.
    #[error("Remote executor is shut down")]
    ShutDown,

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Per-command options.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    /// Run through `sudo`.
    pub run_as_root: bool,
    /// Give up after this long. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Turn a non-zero exit code into [`RemoteError::CommandFailed`].
    pub raise_when_error: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            run_as_root: false,
            timeout: None,
            raise_when_error: true,
        }
    }
}

impl CommandOptions {
    pub fn as_root() -> Self {
        Self {
            run_as_root: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Keep non-zero exit codes in the output instead of failing.
    pub fn tolerate_failure(mut self) -> Self {
        self.raise_when_error = false;
        self
    }
}

/// Result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An open connection to one node.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run a command to completion. Exit codes are returned, not raised.
    async fn execute(&mut self, command: &str, run_as_root: bool) -> Result<CommandOutput>;

    /// Write `content` to `path`, replacing the file.
    async fn write_file(&mut self, path: &str, content: &[u8], run_as_root: bool) -> Result<()>;

    /// Read the whole file at `path`.
    async fn read_file(&mut self, path: &str) -> Result<Vec<u8>>;

    /// Tear down the connection.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Factory for sessions.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Short transport identifier, e.g. "ssh".
    fn transport_type(&self) -> &'static str;

    /// Transport identifier plus version, recorded on clusters.
    fn type_and_version(&self) -> String {
        format!("{}.1.0", self.transport_type())
    }

    /// Open a session to `instance`.
    async fn connect(&self, instance: &Instance) -> Result<Box<dyn RemoteSession>>;
}

/// Session-bounded front end over a [`RemoteTransport`].
#[derive(Clone)]
pub struct RemoteExecutor {
    transport: Arc<dyn RemoteTransport>,
    sessions: Arc<Semaphore>,
    limit: usize,
}

impl RemoteExecutor {
    /// Executor allowing [`DEFAULT_SESSION_LIMIT`] open sessions.
    pub fn new(transport: Arc<dyn RemoteTransport>) -> Self {
        Self::with_session_limit(transport, DEFAULT_SESSION_LIMIT)
    }

    /// Executor with an explicit session cap.
    pub fn with_session_limit(transport: Arc<dyn RemoteTransport>, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            transport,
            sessions: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn type_and_version(&self) -> String {
        self.transport.type_and_version()
    }

    /// Sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.limit - self.sessions.available_permits()
    }

    /// Open a session for a batch of operations. The slot is held until the
    /// guard is dropped or closed.
    pub async fn session(&self, instance: &Instance) -> Result<RemoteSessionGuard> {
        let permit = Arc::clone(&self.sessions)
            .acquire_owned()
            .await
            .map_err(|_| RemoteError::ShutDown)?;
        debug!(instance = %instance.instance_name, "Opening remote session");
        let session = self.transport.connect(instance).await?;
        Ok(RemoteSessionGuard {
            instance_name: instance.instance_name.clone(),
            session,
            _permit: permit,
        })
    }

    /// Run one command in its own session.
    pub async fn execute_command(
        &self,
        instance: &Instance,
        command: &str,
        options: CommandOptions,
    ) -> Result<CommandOutput> {
        let mut guard = self.session(instance).await?;
        let result = guard.execute_command(command, &options).await;
        guard.close().await;
        result
    }

    /// Write one file in its own session.
    pub async fn write_file(&self, instance: &Instance, path: &str, content: &[u8]) -> Result<()> {
        let mut guard = self.session(instance).await?;
        let result = guard.write_file(path, content).await;
        guard.close().await;
        result
    }

    /// Read one file in its own session.
    pub async fn read_file(&self, instance: &Instance, path: &str) -> Result<Vec<u8>> {
        let mut guard = self.session(instance).await?;
        let result = guard.read_file(path).await;
        guard.close().await;
        result
    }
}

/// Open session plus the semaphore slot it occupies.
pub struct RemoteSessionGuard {
    instance_name: String,
    session: Box<dyn RemoteSession>,
    _permit: OwnedSemaphorePermit,
}

impl RemoteSessionGuard {
    pub async fn execute_command(
        &mut self,
        command: &str,
        options: &CommandOptions,
    ) -> Result<CommandOutput> {
        let run = self.session.execute(command, options.run_as_root);
        let output = match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, run)
                .await
                .map_err(|_| RemoteError::Timeout {
                    instance: self.instance_name.clone(),
                    timeout,
                })??,
            None => run.await?,
        };

        debug!(
            instance = %self.instance_name,
            command = %command,
            exit_code = output.exit_code,
            "Remote command finished"
        );

        if options.raise_when_error && !output.success() {
            return Err(RemoteError::CommandFailed {
                instance: self.instance_name.clone(),
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    pub async fn write_file(&mut self, path: &str, content: &[u8]) -> Result<()> {
        self.session.write_file(path, content, false).await
    }

    pub async fn write_file_as_root(&mut self, path: &str, content: &[u8]) -> Result<()> {
        self.session.write_file(path, content, true).await
    }

    pub async fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        self.session.read_file(path).await
    }

    /// Close the session. Close errors are logged; the slot is freed either way.
    pub async fn close(mut self) {
        if let Err(e) = self.session.close().await {
            warn!(instance = %self.instance_name, error = %e, "Failed to close remote session");
        }
    }
}

/// Transport that runs the system `ssh` client, one process per operation.
#[derive(Debug, Clone)]
pub struct SshTransport {
    user: String,
    private_key: Option<std::path::PathBuf>,
    connect_timeout: Duration,
}

impl SshTransport {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            private_key: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_private_key(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    fn transport_type(&self) -> &'static str {
        "ssh"
    }

    async fn connect(&self, instance: &Instance) -> Result<Box<dyn RemoteSession>> {
        let address = instance
            .access_address()
            .ok_or_else(|| RemoteError::NoAddress(instance.instance_name.clone()))?;
        Ok(Box::new(SshSession {
            instance_name: instance.instance_name.clone(),
            destination: format!("{}@{}", self.user, address),
            private_key: self.private_key.clone(),
            connect_timeout: self.connect_timeout,
        }))
    }
}

struct SshSession {
    instance_name: String,
    destination: String,
    private_key: Option<std::path::PathBuf>,
    connect_timeout: Duration,
}

impl SshSession {
    fn command(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()));
        if let Some(key) = &self.private_key {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(&self.destination)
            .arg(remote_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, remote_command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let mut child = self.command(remote_command).spawn()?;
        if let Some(mut pipe) = child.stdin.take() {
            if let Some(data) = stdin {
                pipe.write_all(data).await?;
            }
            drop(pipe);
        }
        let output = child.wait_with_output().await?;
        let exit_code = output.status.code().unwrap_or(-1);

        // ssh reserves 255 for its own failures.
        if exit_code == 255 {
            return Err(RemoteError::ConnectFailed {
                instance: self.instance_name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn execute(&mut self, command: &str, run_as_root: bool) -> Result<CommandOutput> {
        let command = if run_as_root {
            format!("sudo bash -c {}", shell_quote(command))
        } else {
            command.to_string()
        };
        self.run(&command, None).await
    }

    async fn write_file(&mut self, path: &str, content: &[u8], run_as_root: bool) -> Result<()> {
        let sink = format!("cat > {}", shell_quote(path));
        let command = if run_as_root {
            format!("sudo bash -c {}", shell_quote(&sink))
        } else {
            sink
        };
        let output = self.run(&command, Some(content)).await?;
        if !output.success() {
            return Err(RemoteError::CommandFailed {
                instance: self.instance_name.clone(),
                command,
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    async fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let output = self.run(&format!("cat {}", shell_quote(path)), None).await?;
        if !output.success() {
            return Err(RemoteError::FileNotFound {
                instance: self.instance_name.clone(),
                path: path.to_string(),
            });
        }
        Ok(output.stdout.into_bytes())
    }
}

/// One call observed by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Execute {
        instance: String,
        command: String,
        run_as_root: bool,
    },
    WriteFile {
        instance: String,
        path: String,
    },
    ReadFile {
        instance: String,
        path: String,
    },
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    files: HashMap<(String, String), Vec<u8>>,
    responses: HashMap<String, CommandOutput>,
    unreachable: Vec<String>,
}

/// In-memory transport for tests.
///
/// Commands succeed with empty output unless a response was registered with
/// [`MockTransport::respond`]. Files written are readable back per instance.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add artificial latency to every operation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Canned output for commands containing `pattern`.
    pub async fn respond(&self, pattern: &str, output: CommandOutput) {
        self.state
            .lock()
            .await
            .responses
            .insert(pattern.to_string(), output);
    }

    /// Make connections to this instance fail.
    pub async fn set_unreachable(&self, instance_name: &str) {
        self.state
            .lock()
            .await
            .unreachable
            .push(instance_name.to_string());
    }

    pub async fn set_reachable(&self, instance_name: &str) {
        self.state
            .lock()
            .await
            .unreachable
            .retain(|name| name != instance_name);
    }

    pub async fn calls(&self) -> Vec<MockCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn file(&self, instance_name: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .files
            .get(&(instance_name.to_string(), path.to_string()))
            .cloned()
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    fn transport_type(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self, instance: &Instance) -> Result<Box<dyn RemoteSession>> {
        let state = self.state.lock().await;
        if state.unreachable.contains(&instance.instance_name) {
            return Err(RemoteError::ConnectFailed {
                instance: instance.instance_name.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(MockSession {
            instance_name: instance.instance_name.clone(),
            state: Arc::clone(&self.state),
            delay: self.delay,
        }))
    }
}

struct MockSession {
    instance_name: String,
    state: Arc<Mutex<MockState>>,
    delay: Option<Duration>,
}

impl MockSession {
    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn execute(&mut self, command: &str, run_as_root: bool) -> Result<CommandOutput> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::Execute {
            instance: self.instance_name.clone(),
            command: command.to_string(),
            run_as_root,
        });
        let output = state
            .responses
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        Ok(output)
    }

    async fn write_file(&mut self, path: &str, content: &[u8], _run_as_root: bool) -> Result<()> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::WriteFile {
            instance: self.instance_name.clone(),
            path: path.to_string(),
        });
        state
            .files
            .insert((self.instance_name.clone(), path.to_string()), content.to_vec());
        Ok(())
    }

    async fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::ReadFile {
            instance: self.instance_name.clone(),
            path: path.to_string(),
        });
        state
            .files
            .get(&(self.instance_name.clone(), path.to_string()))
            .cloned()
            .ok_or_else(|| RemoteError::FileNotFound {
                instance: self.instance_name.clone(),
                path: path.to_string(),
            })
    }
}
