//! Running one job end to end.
//!
//! For a remote machine: connect (or reuse the pooled session), create the
//! remote job directory, upload the input, the job script and any assets,
//! submit, wait for a queued job to finish, then check for the output file
//! and bring it back. Every step is awaited before the next one starts.
//! The scheduler's own log files come back too, whatever the job's fate.
//!
//! A submitted job is recorded in its local directory, so `resume` can pick
//! it up again after a timeout or an interrupted run.
//!
//! For a local machine the script is written next to the input and the
//! caller runs the submission command itself.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{ExecutionMode, MachineConfig, RetrievePolicy};
use crate::connection::ConnectionManager;
use crate::error::SimrunError;
use crate::host::Host;
use crate::job::JobDescriptor;
use crate::poller::{wait_for_completion, FinalStatus};
use crate::record::RemoteJobRecord;
use crate::script::{
    check_local_availability, extract_job_id, force_scheduler_from_env, scheduler_for,
    JobScriptGenerator, LocalCommands, Scheduler, SystemCommands,
};
use crate::session::{quote, RemoteSession};
use crate::transfer::{locate_asset, remote_join, rewrite_asset_dir, TransferRecord, TransferService};

#[derive(Debug)]
pub enum RunOutcome {
    /// Local execution: the script is written, running it is up to the caller.
    Delegated {
        script: PathBuf,
        submit_command: String,
    },
    Remote(RemoteRun),
}

#[derive(Debug)]
pub struct RemoteRun {
    pub host: Host,
    pub remote_dir: String,
    /// Combined stdout and stderr of the submission command.
    pub submission_output: String,
    pub job_id: Option<String>,
    pub status: Option<FinalStatus>,
    pub transfers: Vec<TransferRecord>,
    pub retrieval_attempts: u32,
    pub local_output: PathBuf,
    /// Scheduler log files brought back next to the output.
    pub logs: Vec<PathBuf>,
}

/// What happens after submission, shared by `run` and `resume`.
struct Collected {
    status: Option<FinalStatus>,
    logs: Vec<PathBuf>,
    retrieval_attempts: u32,
    local_output: PathBuf,
}

/// Deterministic remote directory for a local job directory: the local path,
/// relative to home if it is under it, appended to `base`. `.`, `..` and the
/// root are dropped.
pub fn remote_dir_for(base: &str, local_dir: &Path) -> String {
    let relative = dirs::home_dir()
        .and_then(|home| local_dir.strip_prefix(home).ok())
        .unwrap_or(local_dir);
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        base.to_string()
    } else {
        remote_join(base, &parts.join("/"))
    }
}

/// The last (base, local dir) pair seen and the remote directory computed for it.
struct LastRemoteDir {
    base: String,
    local_dir: PathBuf,
    remote_dir: String,
}

pub struct Coordinator {
    connections: ConnectionManager,
    transfers: TransferService,
    commands: Box<dyn LocalCommands>,
    force_scheduler: bool,
    last_remote_dir: Option<LastRemoteDir>,
}

impl Coordinator {
    pub fn new(connections: ConnectionManager) -> Self {
        Self {
            connections,
            transfers: TransferService::default(),
            commands: Box::new(SystemCommands),
            force_scheduler: force_scheduler_from_env(),
            last_remote_dir: None,
        }
    }

    /// Replaces how local scheduler availability is checked.
    pub fn with_local_commands(mut self, commands: impl LocalCommands + 'static, force: bool) -> Self {
        self.commands = Box::new(commands);
        self.force_scheduler = force;
        self
    }

    pub fn connections(&mut self) -> &mut ConnectionManager {
        &mut self.connections
    }

    pub fn transfers(&mut self) -> &mut TransferService {
        &mut self.transfers
    }

    /// Closes every pooled session.
    pub async fn shutdown(&mut self) {
        self.connections.close_all().await;
    }

    pub async fn run(
        &mut self,
        job: &mut JobDescriptor,
        machine: &MachineConfig,
    ) -> Result<RunOutcome, SimrunError> {
        let generator = JobScriptGenerator::for_machine(machine);
        let submit = generator.submit_command(&job.script_name);
        job.scheduler = machine.scheduler;
        job.submit_command = Some(submit.clone());

        if machine.execution == ExecutionMode::Local {
            return self.delegate(job, machine, &generator, submit).await;
        }

        let host = machine.target();
        let session = self
            .connections
            .connect(&host, &machine.auth, &machine.connect)
            .await?;

        let remote_dir = self.remote_dir(&machine.remote_dir, &job.local_dir);
        job.remote_dir = Some(remote_dir.clone());
        self.transfers.set_policy(machine.transfer.clone());
        self.transfers.ensure_remote_dir(&session, &remote_dir).await?;

        let script = generator.generate(&job.name, &job.command, machine);
        let transfers = self
            .stage(&session, job, machine, &remote_dir, &script)
            .await?;

        let submission_output = submit_job(&session, job, machine, &remote_dir, &submit).await?;

        if machine.scheduler.is_queue() {
            let custom = machine.submission.job_id_regex()?;
            let pattern = custom.as_ref().or(generator.scheduler().job_id_regex());
            job.job_id = pattern.and_then(|re| extract_job_id(re, &submission_output));
            match &job.job_id {
                Some(job_id) => info!(host = %host, job_id = %job_id, "job submitted"),
                None => warn!(
                    host = %host,
                    output = %submission_output,
                    "no job id in submission output, skipping status polling"
                ),
            }
        }

        match RemoteJobRecord::new(&host, &remote_dir, job).save(&job.local_dir).await {
            Ok(path) => debug!(record = %path.display(), "recorded submitted job"),
            Err(e) => warn!(host = %host, error = %e, "could not record submitted job, it cannot be resumed"),
        }

        let collected = self
            .collect(&session, generator.scheduler(), job, &remote_dir, machine)
            .await?;

        Ok(RunOutcome::Remote(RemoteRun {
            host,
            remote_dir,
            submission_output,
            job_id: job.job_id.clone(),
            status: collected.status,
            transfers,
            retrieval_attempts: collected.retrieval_attempts,
            local_output: collected.local_output,
            logs: collected.logs,
        }))
    }

    /// Picks up the job recorded in `local_dir`: waits for it if it is still
    /// queued, then fetches its logs and output. Nothing is submitted.
    pub async fn resume(
        &mut self,
        local_dir: &Path,
        machine: &MachineConfig,
    ) -> Result<RemoteRun, SimrunError> {
        let record = RemoteJobRecord::load(local_dir).await?;
        let host = record.host();
        let target = machine.target();
        if host.key() != target.key() {
            return Err(SimrunError::Config(format!(
                "job in {} was submitted to {}, not {}",
                local_dir.display(),
                host,
                target
            )));
        }

        let session = self
            .connections
            .connect(&host, &machine.auth, &machine.connect)
            .await?;
        let job = record.descriptor(local_dir);
        info!(
            host = %host,
            job_id = job.job_id.as_deref().unwrap_or("-"),
            remote_dir = %record.remote_dir,
            "resuming job"
        );
        let scheduler = scheduler_for(record.scheduler);
        let collected = self
            .collect(&session, scheduler.as_ref(), &job, &record.remote_dir, machine)
            .await?;

        Ok(RemoteRun {
            host,
            remote_dir: record.remote_dir,
            submission_output: String::new(),
            job_id: record.job_id,
            status: collected.status,
            transfers: vec![],
            retrieval_attempts: collected.retrieval_attempts,
            local_output: collected.local_output,
            logs: collected.logs,
        })
    }

    /// Waits for the job if it has an id, fetches the scheduler logs even if
    /// waiting failed, then checks for the output and retrieves it.
    async fn collect(
        &self,
        session: &RemoteSession,
        scheduler: &dyn Scheduler,
        job: &JobDescriptor,
        remote_dir: &str,
        machine: &MachineConfig,
    ) -> Result<Collected, SimrunError> {
        let (status, logs) = match &job.job_id {
            Some(job_id) => {
                let polled = wait_for_completion(session, scheduler, job_id, &machine.poll).await;
                let logs = self.fetch_logs(session, scheduler, job, remote_dir).await;
                (Some(polled?), logs)
            }
            None => (None, vec![]),
        };

        let remote_output = remote_join(remote_dir, &job.output_file);
        verify_output(session, &remote_output).await?;
        let local_output = job.output_path();
        let retrieval_attempts = self
            .retrieve(session, &remote_output, &local_output, &machine.retrieve)
            .await?;

        Ok(Collected {
            status,
            logs,
            retrieval_attempts,
            local_output,
        })
    }

    /// Best effort: a missing or unreadable log is logged and skipped.
    async fn fetch_logs(
        &self,
        session: &RemoteSession,
        scheduler: &dyn Scheduler,
        job: &JobDescriptor,
        remote_dir: &str,
    ) -> Vec<PathBuf> {
        let mut fetched = Vec::new();
        for name in scheduler.log_files(&job.name) {
            let remote = remote_join(remote_dir, &name);
            match remote_file_exists(session, &remote).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(host = %session.host(), path = %remote, "scheduler log not found");
                    continue;
                }
                Err(e) => {
                    warn!(host = %session.host(), path = %remote, error = %e, "could not look for scheduler log");
                    continue;
                }
            }
            let local = job.local_dir.join(&name);
            match self.transfers.get_file(session, &remote, &local).await {
                Ok(()) => {
                    debug!(host = %session.host(), path = %remote, "retrieved scheduler log");
                    fetched.push(local);
                }
                Err(e) => {
                    warn!(host = %session.host(), path = %remote, error = %e, "could not retrieve scheduler log")
                }
            }
        }
        fetched
    }

    async fn delegate(
        &self,
        job: &JobDescriptor,
        machine: &MachineConfig,
        generator: &JobScriptGenerator,
        submit_command: String,
    ) -> Result<RunOutcome, SimrunError> {
        check_local_availability(generator.scheduler(), self.commands.as_ref(), self.force_scheduler)
            .await?;
        let script = generator.generate(&job.name, &job.command, machine);
        let path = job.script_path();
        tokio::fs::create_dir_all(&job.local_dir).await?;
        tokio::fs::write(&path, script).await?;
        info!(
            script = %path.display(),
            submit = %submit_command,
            "wrote job script for local execution"
        );
        Ok(RunOutcome::Delegated {
            script: path,
            submit_command,
        })
    }

    fn remote_dir(&mut self, base: &str, local_dir: &Path) -> String {
        if let Some(last) = &self.last_remote_dir {
            if last.base == base && last.local_dir == local_dir {
                debug!(remote_dir = %last.remote_dir, "remote directory unchanged");
                return last.remote_dir.clone();
            }
        }
        let remote_dir = remote_dir_for(base, local_dir);
        self.last_remote_dir = Some(LastRemoteDir {
            base: base.to_string(),
            local_dir: local_dir.to_path_buf(),
            remote_dir: remote_dir.clone(),
        });
        remote_dir
    }

    /// Uploads the input file, the job script and the job's assets.
    async fn stage(
        &mut self,
        session: &RemoteSession,
        job: &JobDescriptor,
        machine: &MachineConfig,
        remote_dir: &str,
        script: &str,
    ) -> Result<Vec<TransferRecord>, SimrunError> {
        let mut records = Vec::new();
        let assets = &machine.assets;

        let input_path = job.input_path();
        let input = tokio::fs::read(&input_path)
            .await
            .map_err(|e| SimrunError::Transfer {
                host: session.host().hostname.clone(),
                path: input_path.display().to_string(),
                reason: format!("cannot read input file: {}", e),
            })?;
        let input = match (&assets.input_key, job.assets.is_empty()) {
            (Some(key), false) => {
                rewrite_asset_dir(&String::from_utf8_lossy(&input), key, &assets.subdir)?.into_bytes()
            }
            _ => input,
        };
        let input_remote = remote_join(remote_dir, &job.input_file);
        records.push(
            self.transfers
                .verified_put_bytes(session, &input, &input_path, &input_remote)
                .await?,
        );

        let script_path = job.script_path();
        tokio::fs::write(&script_path, script).await?;
        let script_remote = remote_join(remote_dir, &job.script_name);
        records.push(
            self.transfers
                .verified_transfer(session, &script_path, &script_remote)
                .await?,
        );

        if !job.assets.is_empty() {
            let explicit = job
                .asset_dir
                .clone()
                .unwrap_or_else(|| job.local_dir.join(&assets.subdir));
            // Resolve everything first: a missing asset fails before any asset upload.
            let mut located = Vec::with_capacity(job.assets.len());
            for name in &job.assets {
                located.push((name, locate_asset(name, Some(&explicit), assets).await?));
            }

            let remote_assets = remote_join(remote_dir, &assets.subdir);
            self.transfers.ensure_remote_dir(session, &remote_assets).await?;
            for (name, local) in located {
                let remote = remote_join(&remote_assets, name);
                records.push(self.transfers.verified_transfer(session, &local, &remote).await?);
            }
        }

        for record in &records {
            info!(
                host = %session.host(),
                path = %record.remote,
                verified = record.verified(),
                "staged"
            );
        }
        Ok(records)
    }

    async fn retrieve(
        &self,
        session: &RemoteSession,
        remote: &str,
        local: &Path,
        policy: &RetrievePolicy,
    ) -> Result<u32, SimrunError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut last_reason = String::new();
        for attempt in 1..=max_attempts {
            match self.transfers.get_file(session, remote, local).await {
                Ok(()) => {
                    info!(host = %session.host(), path = remote, attempt, "retrieved output");
                    return Ok(attempt);
                }
                Err(e) => {
                    warn!(host = %session.host(), path = remote, attempt, error = %e, "retrieval attempt failed");
                    last_reason = e.to_string();
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(policy.backoff(attempt)).await;
            }
        }
        Err(SimrunError::Retrieval {
            host: session.host().hostname.clone(),
            path: remote.to_string(),
            attempts: max_attempts,
            reason: last_reason,
        })
    }
}

/// Runs `cd <dir> && <env_setup> && <submit>` and returns the combined output.
async fn submit_job(
    session: &RemoteSession,
    job: &JobDescriptor,
    machine: &MachineConfig,
    remote_dir: &str,
    submit: &str,
) -> Result<String, SimrunError> {
    let mut command = format!("cd {}", quote(remote_dir));
    if let Some(env_setup) = machine.env_setup.as_deref().filter(|s| !s.trim().is_empty()) {
        command.push_str(" && ");
        command.push_str(env_setup.trim());
    }
    command.push_str(" && ");
    command.push_str(submit);

    info!(host = %session.host(), command = %command, "submitting job");
    let output = session.run(&command).await?;

    let benign = machine.submission.benign_patterns()?;
    let unexpected: Vec<&str> = output
        .stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !benign.iter().any(|re| re.is_match(line)))
        .collect();
    if !unexpected.is_empty() || !output.success() {
        let stderr = if unexpected.is_empty() {
            let code = output
                .status
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            format!("exited with status {}: {}", code, output.combined())
        } else {
            unexpected.join("\n")
        };
        return Err(SimrunError::Submission {
            host: session.host().hostname.clone(),
            script: job.script_name.clone(),
            stderr,
        });
    }
    Ok(output.combined())
}

async fn remote_file_exists(session: &RemoteSession, remote: &str) -> Result<bool, SimrunError> {
    let check = format!("test -f {} && echo exists || echo missing", quote(remote));
    let output = session.run(&check).await?;
    Ok(output.stdout.trim() == "exists")
}

async fn verify_output(session: &RemoteSession, remote: &str) -> Result<(), SimrunError> {
    if remote_file_exists(session, remote).await? {
        debug!(host = %session.host(), path = remote, "output present");
        return Ok(());
    }
    Err(SimrunError::OutputMissing {
        host: session.host().hostname.clone(),
        path: remote.to_string(),
    })
}
