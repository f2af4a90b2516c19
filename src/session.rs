//! SSH session wrapper.
//!
//! `Transport` is the opaque secure-shell capability: run a command, move bytes
//! in and out, close. `RemoteSession` is what the rest of the crate holds: a
//! transport plus who it is connected to and whether it still looks alive.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use openssh::{Session as SshSession, Stdio};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SimrunError;
use crate::host::Host;

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code. `None` if the remote process was killed by a signal.
    pub status: Option<i32>,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            status: Some(0),
        }
    }

    pub fn failed(stderr: impl Into<String>, status: i32) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            status: Some(status),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout followed by stderr, the way a terminal would have shown them.
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end(), self.stderr.trim_end()) {
            (out, "") => out.to_string(),
            ("", err) => err.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs `command` through the remote login shell and waits for it to exit.
    async fn exec(&self, command: &str) -> Result<CommandOutput, SimrunError>;

    /// Writes `contents` to `remote_path`, replacing whatever was there.
    async fn upload(&self, contents: &[u8], remote_path: &str) -> Result<(), SimrunError>;

    async fn download(&self, remote_path: &str) -> Result<Vec<u8>, SimrunError>;

    async fn close(&self) -> Result<(), SimrunError>;
}

/// How a session authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Key,
    Password,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthMethod::Key => write!(f, "key"),
            AuthMethod::Password => write!(f, "password"),
        }
    }
}

pub struct RemoteSession {
    host: Host,
    method: AuthMethod,
    transport: Box<dyn Transport>,
    alive: AtomicBool,
}

impl RemoteSession {
    pub fn new(host: Host, method: AuthMethod, transport: Box<dyn Transport>) -> Self {
        Self {
            host,
            method,
            transport,
            alive: AtomicBool::new(true),
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// Liveness as of the last probe or command.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub async fn run(&self, command: &str) -> Result<CommandOutput, SimrunError> {
        debug!(host = %self.host, command, "running remote command");
        let result = self.transport.exec(command).await;
        if result.is_err() {
            self.alive.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Runs a no-op command. A session that fails this is stale.
    pub async fn probe(&self) -> bool {
        let alive = matches!(self.transport.exec("true").await, Ok(out) if out.success());
        self.alive.store(alive, Ordering::SeqCst);
        alive
    }

    pub async fn upload(&self, contents: &[u8], remote_path: &str) -> Result<(), SimrunError> {
        self.transport.upload(contents, remote_path).await
    }

    pub async fn download(&self, remote_path: &str) -> Result<Vec<u8>, SimrunError> {
        self.transport.download(remote_path).await
    }

    pub async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Err(e) = self.transport.close().await {
            debug!(host = %self.host, error = %e, "error while terminating session");
        }
    }
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("host", &self.host)
            .field("method", &self.method)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// `Transport` over an OpenSSH multiplexed master connection.
pub struct OpensshTransport {
    host: String,
    session: Mutex<Option<SshSession>>,
    /// Holds the control socket and askpass helper of a master we launched
    /// ourselves. Removed when the transport is dropped.
    _master_dir: Option<TempDir>,
}

impl OpensshTransport {
    pub fn new(host: &Host, session: SshSession) -> Self {
        Self {
            host: host.to_string(),
            session: Mutex::new(Some(session)),
            _master_dir: None,
        }
    }

    pub fn with_master_dir(host: &Host, session: SshSession, master_dir: TempDir) -> Self {
        Self {
            host: host.to_string(),
            session: Mutex::new(Some(session)),
            _master_dir: Some(master_dir),
        }
    }

    fn closed(&self, command: &str) -> SimrunError {
        SimrunError::RemoteCommand {
            host: self.host.clone(),
            command: command.to_string(),
            reason: "session already closed".to_string(),
        }
    }
}

#[async_trait]
impl Transport for OpensshTransport {
    async fn exec(&self, command: &str) -> Result<CommandOutput, SimrunError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or_else(|| self.closed(command))?;
        let output = session
            .raw_command(command)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(output.into())
    }

    async fn upload(&self, contents: &[u8], remote_path: &str) -> Result<(), SimrunError> {
        let command = format!("cat > {}", quote(remote_path));
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or_else(|| self.closed(&command))?;
        let mut child = session
            .raw_command(&command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .await?;
        if let Some(mut stdin) = child.stdin().take() {
            stdin.write_all(contents).await?;
            stdin.shutdown().await?;
        }
        let output: CommandOutput = child.wait_with_output().await?.into();
        if !output.success() {
            return Err(SimrunError::Transfer {
                host: self.host.clone(),
                path: remote_path.to_string(),
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn download(&self, remote_path: &str) -> Result<Vec<u8>, SimrunError> {
        let command = format!("cat {}", quote(remote_path));
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or_else(|| self.closed(&command))?;
        let output = session
            .raw_command(&command)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(SimrunError::Transfer {
                host: self.host.clone(),
                path: remote_path.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    async fn close(&self) -> Result<(), SimrunError> {
        if let Some(session) = self.session.lock().await.take() {
            session.close().await?;
        }
        Ok(())
    }
}

/// Quotes a remote path for a POSIX shell. A leading `~/` stays unquoted so
/// it still expands to the remote home directory.
pub fn quote(s: &str) -> String {
    if let Some(rest) = s.strip_prefix("~/") {
        return format!("~/{}", quote(rest));
    }
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '+' | ':' | '=' | ','));
    if safe {
        s.to_string()
    } else {
        quote_literal(s)
    }
}

/// Single-quotes `s` so the shell passes it through byte for byte, with no
/// tilde, variable or glob expansion. For secrets.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
