//! Authenticated session pool.
//!
//! `ConnectionManager` hands out one `RemoteSession` per (host, user). The
//! first `connect` for a key does the handshake; later calls probe the cached
//! session and return it, reconnecting only when the probe fails.
//!
//! Authentication walks an ordered list of credentials (key, then password).
//! A rejected credential moves on to the next one; any other failure backs off
//! and retries the whole attempt.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use openssh::{KnownHosts, Session as SshSession, SessionBuilder};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, ConnectPolicy};
use crate::error::SimrunError;
use crate::host::{Host, HostKey};
use crate::session::{quote_literal, AuthMethod, OpensshTransport, RemoteSession, Transport};

/// One way of proving who we are.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Key(PathBuf),
    Password(String),
}

impl Credential {
    pub fn method(&self) -> AuthMethod {
        match self {
            Credential::Key(_) => AuthMethod::Key,
            Credential::Password(_) => AuthMethod::Password,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Key(path) => f.debug_tuple("Key").field(path).finish(),
            Credential::Password(_) => f.debug_tuple("Password").field(&"<redacted>").finish(),
        }
    }
}

impl AuthConfig {
    /// Credentials in the order they should be tried.
    pub fn attempts(&self) -> Vec<Credential> {
        let mut attempts = Vec::with_capacity(2);
        if let Some(key) = &self.key {
            attempts.push(Credential::Key(expand_home(key)));
        }
        if let Some(password) = &self.password {
            attempts.push(Credential::Password(password.clone()));
        }
        attempts
    }
}

/// Expands a leading `~` to the local home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Why a single authentication attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// The server refused the credential, or the credential itself is unusable.
    Rejected(String),
    /// Anything else (network, protocol setup, local I/O).
    Other(String),
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Checks that something is listening on the host's SSH port.
    async fn reachable(&self, host: &Host, timeout: Duration) -> Result<(), String>;

    /// Performs one handshake with one credential.
    async fn authenticate(
        &self,
        host: &Host,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, AuthFailure>;
}

pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    sessions: HashMap<HostKey, Arc<RemoteSession>>,
}

impl ConnectionManager {
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self::with_sessions(connector, HashMap::new())
    }

    /// Starts from an existing pool, e.g. one shared with another manager.
    pub fn with_sessions(
        connector: impl Connector + 'static,
        sessions: HashMap<HostKey, Arc<RemoteSession>>,
    ) -> Self {
        Self {
            connector: Box::new(connector),
            sessions,
        }
    }

    /// A manager that connects through the system OpenSSH client.
    pub fn openssh() -> Self {
        Self::new(OpensshConnector)
    }

    pub fn get(&self, key: &HostKey) -> Option<Arc<RemoteSession>> {
        self.sessions.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub async fn connect(
        &mut self,
        host: &Host,
        auth: &AuthConfig,
        policy: &ConnectPolicy,
    ) -> Result<Arc<RemoteSession>, SimrunError> {
        let credentials = auth.attempts();
        if credentials.is_empty() {
            return Err(SimrunError::NoCredentials {
                host: host.hostname.clone(),
                user: host.username.clone(),
            });
        }

        let key = host.key();
        if let Some(cached) = self.sessions.get(&key).cloned() {
            if cached.probe().await {
                debug!(session = %key, "reusing pooled session");
                return Ok(cached);
            }
            warn!(session = %key, "pooled session failed liveness probe, reconnecting");
            self.sessions.remove(&key);
            cached.close().await;
        }

        let session = Arc::new(self.establish(host, &credentials, policy).await?);
        self.sessions.insert(key, Arc::clone(&session));
        Ok(session)
    }

    async fn establish(
        &self,
        host: &Host,
        credentials: &[Credential],
        policy: &ConnectPolicy,
    ) -> Result<RemoteSession, SimrunError> {
        let retries = policy.retries.max(1);
        let mut last_reason = String::new();
        for attempt in 1..=retries {
            info!(
                host = %host.hostname,
                user = %host.username,
                port = host.port,
                attempt,
                "connecting"
            );
            match self.attempt(host, credentials, policy.timeout()).await {
                Ok(session) => {
                    info!(
                        host = %host.hostname,
                        user = %host.username,
                        method = %session.method(),
                        "connected"
                    );
                    return Ok(session);
                }
                Err(reason) => {
                    warn!(host = %host.hostname, attempt, %reason, "connection attempt failed");
                    last_reason = reason;
                }
            }
            if attempt < retries {
                tokio::time::sleep(policy.delay()).await;
            }
        }
        Err(SimrunError::Connectivity {
            host: host.hostname.clone(),
            user: host.username.clone(),
            port: host.port,
            attempts: retries,
            reason: last_reason,
        })
    }

    async fn attempt(
        &self,
        host: &Host,
        credentials: &[Credential],
        timeout: Duration,
    ) -> Result<RemoteSession, String> {
        self.connector
            .reachable(host, timeout)
            .await
            .map_err(|e| format!("{}:{} unreachable: {}", host.hostname, host.port, e))?;

        let mut rejections = Vec::with_capacity(credentials.len());
        for credential in credentials {
            let method = credential.method();
            match self.connector.authenticate(host, credential, timeout).await {
                Ok(transport) => return Ok(RemoteSession::new(host.clone(), method, transport)),
                Err(AuthFailure::Rejected(reason)) => {
                    warn!(host = %host.hostname, %method, %reason, "authentication rejected");
                    rejections.push(format!("{} authentication failed: {}", method, reason));
                }
                Err(AuthFailure::Other(reason)) => return Err(reason),
            }
        }
        Err(rejections.join("; "))
    }

    /// Closes every pooled session and empties the pool.
    pub async fn close_all(&mut self) {
        let sessions: Vec<_> = self.sessions.drain().map(|(_, session)| session).collect();
        for session in &sessions {
            info!(host = %session.host(), "terminating connection");
        }
        join_all(sessions.iter().map(|session| session.close())).await;
    }
}

/// Connects through the local `ssh` binary.
pub struct OpensshConnector;

#[async_trait]
impl Connector for OpensshConnector {
    async fn reachable(&self, host: &Host, timeout: Duration) -> Result<(), String> {
        let address = (host.hostname.as_str(), host.port);
        match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
        }
    }

    async fn authenticate(
        &self,
        host: &Host,
        credential: &Credential,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, AuthFailure> {
        match credential {
            Credential::Key(path) => {
                if tokio::fs::metadata(path).await.is_err() {
                    return Err(AuthFailure::Rejected(format!(
                        "key file {} not found",
                        path.display()
                    )));
                }
                let mut builder = SessionBuilder::default();
                builder
                    .user(host.username.clone())
                    .port(host.port)
                    .keyfile(path)
                    .connect_timeout(timeout)
                    .known_hosts_check(KnownHosts::Add);
                let session = builder
                    .connect_mux(&host.hostname)
                    .await
                    .map_err(|e| classify(&e))?;
                Ok(Box::new(OpensshTransport::new(host, session)))
            }
            Credential::Password(password) => {
                let transport = launch_password_master(host, password, timeout).await?;
                Ok(Box::new(transport))
            }
        }
    }
}

/// Markers in ssh's diagnostics that mean the credential was the problem.
const REJECTION_MARKERS: &[&str] = &[
    "Permission denied",
    "Authentication failed",
    "Too many authentication failures",
    "no such identity",
    "invalid format",
    "bad permissions",
    "Host key verification failed",
];

fn classify(error: &(dyn StdError + 'static)) -> AuthFailure {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    classify_message(message)
}

fn classify_message(message: String) -> AuthFailure {
    if REJECTION_MARKERS.iter().any(|m| message.contains(m)) {
        AuthFailure::Rejected(message)
    } else {
        AuthFailure::Other(message)
    }
}

/// Helper script that prints the password when ssh asks for it.
fn askpass_script(password: &str) -> String {
    format!("#!/bin/sh\nprintf '%s\\n' {}\n", quote_literal(password))
}

/// OpenSSH's mux client always runs in batch mode, which rules out passwords.
/// So we start the control master ourselves with an askpass helper that
/// answers the prompt, then attach to its socket.
async fn launch_password_master(
    host: &Host,
    password: &str,
    timeout: Duration,
) -> Result<OpensshTransport, AuthFailure> {
    let local = |e: std::io::Error| AuthFailure::Other(format!("local setup failed: {}", e));

    let dir = tokio::task::spawn_blocking(|| tempfile::Builder::new().prefix(".simrun-").tempdir())
        .await
        .map_err(|e| AuthFailure::Other(format!("local setup failed: {}", e)))?
        .map_err(local)?;
    let askpass = dir.path().join("askpass");
    tokio::fs::write(&askpass, askpass_script(password))
        .await
        .map_err(local)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&askpass, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(local)?;
    }
    let control = dir.path().join("master");
    let log = dir.path().join("master.log");

    let status = tokio::process::Command::new("ssh")
        .arg("-E")
        .arg(&log)
        .arg("-S")
        .arg(&control)
        .args(["-M", "-f", "-N"])
        .args(["-o", "ControlPersist=yes"])
        .args(["-o", "BatchMode=no"])
        .args(["-o", "PreferredAuthentications=password,keyboard-interactive"])
        .args(["-o", "PubkeyAuthentication=no"])
        .args(["-o", "NumberOfPasswordPrompts=1"])
        .args(["-o", "StrictHostKeyChecking=accept-new"])
        .arg("-o")
        .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)))
        .arg("-p")
        .arg(host.port.to_string())
        .arg("-l")
        .arg(&host.username)
        .arg(&host.hostname)
        .env("SSH_ASKPASS", &askpass)
        .env("SSH_ASKPASS_REQUIRE", "force")
        .env(
            "DISPLAY",
            std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string()),
        )
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map_err(local)?;

    if !status.success() {
        let diagnostics = tokio::fs::read_to_string(&log).await.unwrap_or_default();
        return Err(classify_message(format!(
            "ssh exited with {}: {}",
            status,
            diagnostics.trim()
        )));
    }

    let session = SshSession::resume_mux(control.into_boxed_path(), Some(log.into_boxed_path()));
    Ok(OpensshTransport::with_master_dir(host, session, dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, FakeRemote};

    fn policy() -> ConnectPolicy {
        ConnectPolicy {
            retries: 3,
            delay_secs: 5,
            timeout_secs: 10,
        }
    }

    fn key_auth() -> AuthConfig {
        AuthConfig {
            key: Some(PathBuf::from("/keys/id_ed25519")),
            password: None,
        }
    }

    fn both_auth() -> AuthConfig {
        AuthConfig {
            key: Some(PathBuf::from("/keys/id_ed25519")),
            password: Some("hunter2".to_string()),
        }
    }

    #[test]
    fn test_attempts_try_key_before_password() {
        let attempts = both_auth().attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].method(), AuthMethod::Key);
        assert_eq!(attempts[1].method(), AuthMethod::Password);
        assert!(!format!("{:?}", attempts).contains("hunter2"));
    }

    #[test]
    fn test_expand_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_home(Path::new("~/.ssh/id_rsa")), home.join(".ssh/id_rsa"));
        assert_eq!(expand_home(Path::new("/abs/key")), PathBuf::from("/abs/key"));
    }

    #[test]
    fn test_classify_rejections() {
        assert!(matches!(
            classify_message("user@host: Permission denied (publickey).".to_string()),
            AuthFailure::Rejected(_)
        ));
        assert!(matches!(
            classify_message("Connection reset by peer".to_string()),
            AuthFailure::Other(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_key_handshakes_once() {
        let connector = FakeConnector::new(FakeRemote::new());
        let mut manager = ConnectionManager::new(connector.clone());
        let host = Host::new("cluster.edu", "alice");

        let first = manager.connect(&host, &key_auth(), &policy()).await.unwrap();
        for _ in 0..4 {
            let again = manager.connect(&host, &key_auth(), &policy()).await.unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }
        assert_eq!(connector.handshakes().len(), 1);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_are_independent_per_host_and_user() {
        let connector = FakeConnector::new(FakeRemote::new());
        let mut manager = ConnectionManager::new(connector.clone());

        let a_x = manager
            .connect(&Host::new("a.edu", "x"), &key_auth(), &policy())
            .await
            .unwrap();
        let b_x = manager
            .connect(&Host::new("b.edu", "x"), &key_auth(), &policy())
            .await
            .unwrap();
        let a_y = manager
            .connect(&Host::new("a.edu", "y"), &key_auth(), &policy())
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&a_x, &b_x));
        assert!(!Arc::ptr_eq(&a_x, &a_y));
        assert_eq!(a_x.host().hostname, "a.edu");
        assert_eq!(b_x.host().hostname, "b.edu");
        assert_eq!(a_y.host().username, "y");
        assert_eq!(connector.handshakes().len(), 3);
        assert_eq!(manager.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_key_falls_back_to_password() {
        let connector = FakeConnector::new(FakeRemote::new()).rejecting_keys();
        let mut manager = ConnectionManager::new(connector.clone());

        let session = manager
            .connect(&Host::new("cluster.edu", "alice"), &both_auth(), &policy())
            .await
            .unwrap();

        assert_eq!(session.method(), AuthMethod::Password);
        assert_eq!(
            connector.handshakes(),
            vec![AuthMethod::Key, AuthMethod::Password]
        );
        // Fallback happens within the first attempt: only one reachability check.
        assert_eq!(connector.reach_checks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_key_without_password_exhausts_retries() {
        let connector = FakeConnector::new(FakeRemote::new()).rejecting_keys();
        let mut manager = ConnectionManager::new(connector.clone());

        let err = manager
            .connect(&Host::new("cluster.edu", "alice"), &key_auth(), &policy())
            .await
            .unwrap_err();

        match err {
            SimrunError::Connectivity { host, attempts, reason, .. } => {
                assert_eq!(host, "cluster.edu");
                assert_eq!(attempts, 3);
                assert!(reason.contains("key authentication failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_handshake_skips_password_and_retries() {
        let connector = FakeConnector::new(FakeRemote::new()).breaking_handshakes();
        let mut manager = ConnectionManager::new(connector.clone());

        let err = manager
            .connect(&Host::new("cluster.edu", "alice"), &both_auth(), &policy())
            .await
            .unwrap_err();

        match err {
            SimrunError::Connectivity { attempts, reason, .. } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("Connection reset by peer"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The key is tried once per attempt; the password never is.
        assert_eq!(connector.handshakes(), vec![AuthMethod::Key; 3]);
        assert_eq!(connector.reach_checks(), 3);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_askpass_prints_password_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("askpass");
        for password in ["~/hunter2", "it's $HOME", "*;`id`", "plain"] {
            std::fs::write(&script, askpass_script(password)).unwrap();
            let output = std::process::Command::new("sh")
                .arg(&script)
                .env("HOME", "/nonexistent-home")
                .output()
                .unwrap();
            assert!(output.status.success());
            assert_eq!(String::from_utf8(output.stdout).unwrap(), format!("{}\n", password));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_host_retries_then_fails() {
        let connector = FakeConnector::new(FakeRemote::new()).unreachable_for(u32::MAX);
        let mut manager = ConnectionManager::new(connector.clone());
        let start = tokio::time::Instant::now();

        let err = manager
            .connect(&Host::new("down.edu", "alice"), &key_auth(), &policy())
            .await
            .unwrap_err();

        assert!(matches!(err, SimrunError::Connectivity { attempts: 3, .. }));
        assert!(err.to_string().contains("down.edu"));
        assert_eq!(connector.reach_checks(), 3);
        assert!(connector.handshakes().is_empty());
        // Two waits between three attempts.
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_unreachability_recovers() {
        let connector = FakeConnector::new(FakeRemote::new()).unreachable_for(2);
        let mut manager = ConnectionManager::new(connector.clone());

        manager
            .connect(&Host::new("flaky.edu", "alice"), &key_auth(), &policy())
            .await
            .unwrap();
        assert_eq!(connector.reach_checks(), 3);
        assert_eq!(connector.handshakes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_session_is_replaced() {
        let remote = FakeRemote::new();
        let connector = FakeConnector::new(remote.clone());
        let mut manager = ConnectionManager::new(connector.clone());
        let host = Host::new("cluster.edu", "alice");

        let first = manager.connect(&host, &key_auth(), &policy()).await.unwrap();
        remote.set_dead(true);
        // The replacement handshake gets a live transport.
        connector.revive_on_handshake();
        let second = manager.connect(&host, &key_auth(), &policy()).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!first.is_alive());
        assert!(second.is_alive());
        assert_eq!(connector.handshakes().len(), 2);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_credentials_is_an_error() {
        let mut manager = ConnectionManager::new(FakeConnector::new(FakeRemote::new()));
        let err = manager
            .connect(
                &Host::new("cluster.edu", "alice"),
                &AuthConfig::default(),
                &policy(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SimrunError::NoCredentials { .. }));
    }

    #[tokio::test]
    async fn test_close_all_empties_the_pool() {
        let remote = FakeRemote::new();
        let mut manager = ConnectionManager::new(FakeConnector::new(remote.clone()));
        let session = manager
            .connect(&Host::new("cluster.edu", "alice"), &key_auth(), &policy())
            .await
            .unwrap();
        manager.close_all().await;
        assert!(manager.is_empty());
        assert!(!session.is_alive());
        assert_eq!(remote.closes(), 1);
    }

    #[tokio::test]
    async fn test_injected_pool_is_used() {
        let remote = FakeRemote::new();
        let connector = FakeConnector::new(remote.clone());
        let host = Host::new("cluster.edu", "alice");
        let existing = Arc::new(RemoteSession::new(
            host.clone(),
            AuthMethod::Key,
            Box::new(remote.transport()),
        ));
        let mut pool = HashMap::new();
        pool.insert(host.key(), Arc::clone(&existing));

        let mut manager = ConnectionManager::with_sessions(connector.clone(), pool);
        let session = manager.connect(&host, &key_auth(), &policy()).await.unwrap();
        assert!(Arc::ptr_eq(&existing, &session));
        assert!(connector.handshakes().is_empty());
    }
}
