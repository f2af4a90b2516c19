//! Simrun: Remote Job Submission for Simulation Codes over SSH.

// Serde helper module.
mod serde;
// Command line arguments and configuration.
pub mod config;
// Error handling.
pub mod error;
// SSH targets and session pool keys.
pub mod host;
// SSH session wrapper.
pub mod session;
// Authenticated session pool.
pub mod connection;
// File transfer with checksum verification.
pub mod transfer;
// Job scripts and scheduler backends.
pub mod script;
// Waiting for queued jobs.
pub mod poller;
// How to parse and represent jobs.
pub mod job;
// Submitted jobs, for resuming later.
pub mod record;
// One job, end to end.
pub mod coordinator;

#[cfg(test)]
mod testing;

pub use config::{AuthConfig, Config, ExecutionMode, MachineConfig, load_machines};
pub use connection::{AuthFailure, ConnectionManager, Connector, Credential, OpensshConnector};
pub use coordinator::{Coordinator, RemoteRun, RunOutcome, remote_dir_for};
pub use error::SimrunError;
pub use host::{Host, HostKey};
pub use job::{JobDescriptor, JobSpec, load_jobs, template_registry};
pub use poller::{FinalStatus, JobState, wait_for_completion};
pub use record::RemoteJobRecord;
pub use script::{JobScriptGenerator, Resources, Scheduler, SchedulerKind, ScriptSpec, scheduler_for};
pub use session::{AuthMethod, CommandOutput, RemoteSession, Transport};
pub use transfer::{TransferRecord, TransferService};
