//! Scripted stand-ins for the SSH transport, shared by the unit tests.
//!
//! `FakeRemote` is an in-memory remote machine: uploads land in a file map,
//! `mkdir -p`, `sha256sum` and `test -f` are answered from it, and anything
//! else can be scripted by substring. `FakeConnector` hands out transports to
//! one `FakeRemote` and records every handshake.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing_subscriber::fmt::MakeWriter;

use crate::connection::{AuthFailure, Connector, Credential};
use crate::error::SimrunError;
use crate::host::Host;
use crate::session::{AuthMethod, CommandOutput, RemoteSession, Transport};
use crate::transfer::sha256_hex;

#[derive(Default)]
struct RemoteState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    commands: Vec<String>,
    uploads: Vec<String>,
    scripts: Vec<(String, VecDeque<CommandOutput>)>,
    corrupt: BTreeSet<String>,
    failing_downloads: u32,
    dead: bool,
    closes: u32,
}

#[derive(Clone, Default)]
pub(crate) struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> FakeTransport {
        FakeTransport {
            remote: self.clone(),
        }
    }

    pub fn session(&self, host: &Host) -> Arc<RemoteSession> {
        Arc::new(RemoteSession::new(
            host.clone(),
            AuthMethod::Key,
            Box::new(self.transport()),
        ))
    }

    pub fn set_dead(&self, dead: bool) {
        self.state.lock().unwrap().dead = dead;
    }

    pub fn closes(&self) -> u32 {
        self.state.lock().unwrap().closes
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Commands containing `pattern`, in order.
    pub fn commands_matching(&self, pattern: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains(pattern))
            .collect()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn dirs(&self) -> Vec<String> {
        self.state.lock().unwrap().dirs.iter().cloned().collect()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn put_file(&self, path: &str, contents: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), contents.to_vec());
    }

    /// Answers commands containing `pattern` with `responses` in order.
    /// The last response repeats once the others are used up. Replaces any
    /// earlier answers for the same pattern.
    pub fn script(&self, pattern: &str, responses: Vec<CommandOutput>) {
        let mut state = self.state.lock().unwrap();
        state.scripts.retain(|(existing, _)| existing != pattern);
        state.scripts.push((pattern.to_string(), responses.into()));
    }

    /// Uploads to `path` land with one extra byte appended.
    pub fn corrupt_uploads_to(&self, path: &str) {
        self.state.lock().unwrap().corrupt.insert(path.to_string());
    }

    pub fn fail_downloads(&self, count: u32) {
        self.state.lock().unwrap().failing_downloads = count;
    }
}

pub(crate) struct FakeTransport {
    remote: FakeRemote,
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    match s.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        Some(inner) => inner.replace(r"'\''", "'"),
        None => s.to_string(),
    }
}

fn answer(state: &mut RemoteState, command: &str) -> CommandOutput {
    for (pattern, responses) in state.scripts.iter_mut() {
        if command.contains(pattern.as_str()) {
            if responses.len() > 1 {
                return responses.pop_front().unwrap_or_default();
            }
            return responses.front().cloned().unwrap_or_default();
        }
    }
    if let Some(rest) = command.strip_prefix("mkdir -p ") {
        state.dirs.insert(unquote(rest));
        return CommandOutput::ok("");
    }
    if let Some(rest) = command.strip_prefix("sha256sum ") {
        let path = unquote(rest);
        return match state.files.get(&path) {
            Some(contents) => CommandOutput::ok(format!("{}  {}\n", sha256_hex(contents), path)),
            None => CommandOutput::failed(
                format!("sha256sum: {}: No such file or directory", path),
                1,
            ),
        };
    }
    if let Some(rest) = command.strip_prefix("test -f ") {
        let path = unquote(rest.split(" && ").next().unwrap_or_default());
        return if state.files.contains_key(&path) {
            CommandOutput::ok("exists\n")
        } else {
            CommandOutput::ok("missing\n")
        };
    }
    CommandOutput::ok("")
}

#[async_trait]
impl Transport for FakeTransport {
    async fn exec(&self, command: &str) -> Result<CommandOutput, SimrunError> {
        let mut state = self.remote.state.lock().unwrap();
        state.commands.push(command.to_string());
        if state.dead {
            return Err(SimrunError::RemoteCommand {
                host: "fake".to_string(),
                command: command.to_string(),
                reason: "broken pipe".to_string(),
            });
        }
        Ok(answer(&mut state, command))
    }

    async fn upload(&self, contents: &[u8], remote_path: &str) -> Result<(), SimrunError> {
        let mut state = self.remote.state.lock().unwrap();
        if state.dead {
            return Err(SimrunError::Transfer {
                host: "fake".to_string(),
                path: remote_path.to_string(),
                reason: "broken pipe".to_string(),
            });
        }
        let mut stored = contents.to_vec();
        if state.corrupt.contains(remote_path) {
            stored.push(b'!');
        }
        state.uploads.push(remote_path.to_string());
        state.files.insert(remote_path.to_string(), stored);
        Ok(())
    }

    async fn download(&self, remote_path: &str) -> Result<Vec<u8>, SimrunError> {
        let mut state = self.remote.state.lock().unwrap();
        let failure = |reason: &str| SimrunError::Transfer {
            host: "fake".to_string(),
            path: remote_path.to_string(),
            reason: reason.to_string(),
        };
        if state.dead {
            return Err(failure("broken pipe"));
        }
        if state.failing_downloads > 0 {
            state.failing_downloads -= 1;
            return Err(failure("connection reset by peer"));
        }
        state
            .files
            .get(remote_path)
            .cloned()
            .ok_or_else(|| failure("No such file or directory"))
    }

    async fn close(&self) -> Result<(), SimrunError> {
        self.remote.state.lock().unwrap().closes += 1;
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorState {
    handshakes: Vec<AuthMethod>,
    reach_checks: u32,
    unreachable_for: u32,
    reject_keys: bool,
    broken_handshakes: bool,
    revive: bool,
}

/// Hands out transports to one `FakeRemote`. Clones share their counters.
#[derive(Clone)]
pub(crate) struct FakeConnector {
    remote: FakeRemote,
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    pub fn new(remote: FakeRemote) -> Self {
        Self {
            remote,
            state: Arc::default(),
        }
    }

    pub fn rejecting_keys(self) -> Self {
        self.state.lock().unwrap().reject_keys = true;
        self
    }

    /// Every handshake fails for a reason other than the credential.
    pub fn breaking_handshakes(self) -> Self {
        self.state.lock().unwrap().broken_handshakes = true;
        self
    }

    /// The first `count` reachability checks fail.
    pub fn unreachable_for(self, count: u32) -> Self {
        self.state.lock().unwrap().unreachable_for = count;
        self
    }

    /// Every later handshake brings the remote back to life.
    pub fn revive_on_handshake(&self) {
        self.state.lock().unwrap().revive = true;
    }

    pub fn handshakes(&self) -> Vec<AuthMethod> {
        self.state.lock().unwrap().handshakes.clone()
    }

    pub fn reach_checks(&self) -> u32 {
        self.state.lock().unwrap().reach_checks
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn reachable(&self, _host: &Host, _timeout: Duration) -> Result<(), String> {
        let mut state = self.state.lock().unwrap();
        state.reach_checks += 1;
        if state.reach_checks <= state.unreachable_for {
            return Err("connection refused".to_string());
        }
        Ok(())
    }

    async fn authenticate(
        &self,
        _host: &Host,
        credential: &Credential,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>, AuthFailure> {
        let mut state = self.state.lock().unwrap();
        state.handshakes.push(credential.method());
        if state.broken_handshakes {
            return Err(AuthFailure::Other(
                "kex_exchange_identification: Connection reset by peer".to_string(),
            ));
        }
        if state.reject_keys && credential.method() == AuthMethod::Key {
            return Err(AuthFailure::Rejected("Permission denied (publickey)".to_string()));
        }
        if state.revive {
            self.remote.set_dead(false);
        }
        Ok(Box::new(self.remote.transport()))
    }
}

/// A writer that captures log output.
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs {
    logs: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.logs.lock().unwrap()).to_string()
    }

    /// Number of captured lines at the given level, e.g. `"WARN"`.
    pub fn count(&self, level: &str) -> usize {
        self.contents()
            .lines()
            .filter(|line| line.trim_start().starts_with(level))
            .count()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.logs.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Runs an async test body on its own runtime with tracing output captured.
pub(crate) fn with_tracing<F, Fut>(f: F) -> (CapturedLogs, Fut::Output)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future,
{
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(logs.clone())
        .with_ansi(false)
        .without_time()
        .finish();

    let result = tracing::subscriber::with_default(subscriber, || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
            .block_on(f())
    });
    (logs, result)
}
