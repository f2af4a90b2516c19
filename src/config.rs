//! Configuration for Simrun.
//!
//! Holds the clap structs for command line arguments, and the machine file
//! format: one YAML mapping from machine name to `MachineConfig`.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use regex::Regex;
use serde::Deserialize;
use void::Void;

use crate::error::SimrunError;
use crate::host::Host;
use crate::script::{Resources, SchedulerKind};
use crate::serde::string_or_mapping;

#[derive(Parser)]
#[command(version, author, about)]
pub struct Config {
    /// Machine file to use. Defaults to `machines.yaml`
    #[arg(long, default_value = "machines.yaml")]
    pub machines_file: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run every job in a jobs file, in order, on one machine
    Run {
        /// Jobs file to use
        #[arg(default_value = "jobs.yaml")]
        jobs_file: String,
        /// Machine name from the machine file
        #[arg(long, short)]
        machine: String,
    },
    /// Connect to a machine and probe the session
    Check {
        #[arg(long, short)]
        machine: String,
    },
    /// Copy a directory's top-level files (and its asset subfolder) to a machine
    Push {
        directory: PathBuf,
        #[arg(long, short)]
        machine: String,
        /// Remote destination. Defaults to the directory's path under `remote_dir`
        #[arg(long)]
        remote: Option<String>,
    },
    /// Wait for jobs submitted earlier (e.g. after a timeout) and fetch their output
    Resume {
        /// Job directories holding a submission record
        #[arg(required = true)]
        directories: Vec<PathBuf>,
        #[arg(long, short)]
        machine: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Remote,
    Local,
}

/// Credentials for one machine. At least one of the two must be set to connect.
#[derive(Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub key: Option<PathBuf>,
    pub password: Option<String>,
}

impl FromStr for AuthConfig {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            key: Some(PathBuf::from(s)),
            password: None,
        })
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("key", &self.key)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectPolicy {
    pub retries: u32,
    pub delay_secs: u64,
    pub timeout_secs: u64,
}

impl ConnectPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay_secs: 5,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    pub timeout_secs: u64,
    pub interval_secs: u64,
    /// Whether a job the accounting query knows nothing about counts as done.
    pub accept_unknown: bool,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            interval_secs: 10,
            accept_unknown: true,
        }
    }
}

/// What to do when the remote checksum of a transferred file differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumPolicy {
    /// Don't verify.
    Off,
    /// Log a warning and keep going.
    #[default]
    Warn,
    /// Treat a mismatch as an error.
    Fail,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransferPolicy {
    pub checksum: ChecksumPolicy,
    /// How many times to re-send a file whose checksum doesn't match.
    pub retransfers: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievePolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl RetrievePolicy {
    /// Delay after the given failed attempt (1-based): `backoff_ms * 2^(attempt - 1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

impl Default for RetrievePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SubmissionPolicy {
    /// Regexes for stderr lines that don't indicate a failed submission.
    pub benign_stderr: Vec<String>,
    /// Overrides the scheduler's own job id pattern. Must have one capture group.
    pub job_id_pattern: Option<String>,
}

impl SubmissionPolicy {
    pub fn benign_patterns(&self) -> Result<Vec<Regex>, SimrunError> {
        self.benign_stderr.iter().map(|p| compile(p)).collect()
    }

    pub fn job_id_regex(&self) -> Result<Option<Regex>, SimrunError> {
        self.job_id_pattern.as_deref().map(compile).transpose()
    }
}

impl Default for SubmissionPolicy {
    fn default() -> Self {
        Self {
            benign_stderr: vec!["^Loading".to_string()],
            job_id_pattern: None,
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, SimrunError> {
    Regex::new(pattern)
        .map_err(|e| SimrunError::Config(format!("invalid pattern '{}': {}", pattern, e)))
}

/// Where auxiliary assets (pseudopotentials) come from and where they go.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssetPolicy {
    /// Subfolder, both in the local job directory and the remote one.
    pub subdir: String,
    /// Environment variable naming a base directory to search.
    pub env_var: Option<String>,
    /// Fallback directory, relative to the home directory.
    pub default_dir: Option<String>,
    /// Input-file key whose value is rewritten to point at `./<subdir>`.
    pub input_key: Option<String>,
}

impl Default for AssetPolicy {
    fn default() -> Self {
        Self {
            subdir: "pseudo".to_string(),
            env_var: Some("ESPRESSO_PSEUDO".to_string()),
            default_dir: Some("espresso/pseudo".to_string()),
            input_key: Some("pseudo_dir".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, deserialize_with = "string_or_mapping")]
    pub auth: AuthConfig,
    #[serde(default)]
    pub execution: ExecutionMode,
    #[serde(default)]
    pub scheduler: SchedulerKind,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub remote_dir: String,
    /// Prepended to remote submission commands, e.g. `source /etc/profile`,
    /// so non-interactive shells see the login environment.
    #[serde(default)]
    pub env_setup: Option<String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub use_modules: bool,
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub prepend: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub postpend: Option<String>,
    #[serde(default)]
    pub connect: ConnectPolicy,
    #[serde(default)]
    pub poll: PollPolicy,
    #[serde(default)]
    pub transfer: TransferPolicy,
    #[serde(default)]
    pub retrieve: RetrievePolicy,
    #[serde(default)]
    pub submission: SubmissionPolicy,
    #[serde(default)]
    pub assets: AssetPolicy,
}

fn default_port() -> u16 {
    22
}

fn default_shell() -> String {
    "bash".to_string()
}

impl MachineConfig {
    /// A remote machine with every optional section at its default.
    pub fn remote(host: &str, username: &str, remote_dir: &str, auth: AuthConfig) -> Self {
        Self {
            host: host.to_string(),
            username: username.to_string(),
            port: default_port(),
            auth,
            execution: ExecutionMode::Remote,
            scheduler: SchedulerKind::default(),
            shell: default_shell(),
            remote_dir: remote_dir.to_string(),
            env_setup: None,
            resources: Resources::default(),
            use_modules: false,
            modules: vec![],
            prepend: None,
            profile: None,
            postpend: None,
            connect: ConnectPolicy::default(),
            poll: PollPolicy::default(),
            transfer: TransferPolicy::default(),
            retrieve: RetrievePolicy::default(),
            submission: SubmissionPolicy::default(),
            assets: AssetPolicy::default(),
        }
    }

    pub fn target(&self) -> Host {
        Host::new(&self.host, &self.username).with_port(self.port)
    }

    /// Checks the fields that serde can't: remote machines need somewhere to go.
    pub fn validate(&self, name: &str) -> Result<(), SimrunError> {
        if self.execution == ExecutionMode::Local {
            return Ok(());
        }
        for (field, value) in [
            ("host", &self.host),
            ("username", &self.username),
            ("remote_dir", &self.remote_dir),
        ] {
            if value.trim().is_empty() {
                return Err(SimrunError::Config(format!(
                    "machine '{}' runs remotely but has no '{}'",
                    name, field
                )));
            }
        }
        for (field, value) in [
            ("poll.interval_secs", self.poll.interval_secs),
            ("connect.timeout_secs", self.connect.timeout_secs),
        ] {
            if value == 0 {
                return Err(SimrunError::Config(format!(
                    "machine '{}': '{}' must be at least 1",
                    name, field
                )));
            }
        }
        self.submission.benign_patterns()?;
        self.submission.job_id_regex()?;
        Ok(())
    }
}

/// Reads and validates the machine file.
pub fn load_machines(path: &str) -> Result<BTreeMap<String, MachineConfig>, SimrunError> {
    let file = File::open(path)?;
    let machines: BTreeMap<String, MachineConfig> = serde_yaml::from_reader(file)?;
    for (name, machine) in &machines {
        machine.validate(name)?;
    }
    Ok(machines)
}
