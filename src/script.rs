//! Job scripts and the schedulers that run them.
//!
//! A job script is four blocks in fixed order: scheduler directives, the
//! environment setup, the main command, and an optional post block. The
//! `Scheduler` trait owns everything that differs between batch systems:
//! directive syntax, submit command, how to read a job id back, and how to
//! ask about a job's state.

use std::fmt;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MachineConfig;
use crate::error::SimrunError;
use crate::poller::JobState;
use crate::session::CommandOutput;

/// Setting this to `1` skips the local scheduler availability check.
pub const FORCE_SCHEDULER_ENV: &str = "SIMRUN_FORCE_SCHEDULER";

static SLURM_JOB_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Submitted batch job (\d+)").expect("constant regex pattern is valid")
});
static PBS_JOB_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+)").expect("constant regex pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    Slurm,
    Pbs,
    /// No batch system: the script is run by a shell.
    #[serde(alias = "bash")]
    Direct,
}

impl SchedulerKind {
    /// Whether jobs go through a queue and get a job id back.
    pub fn is_queue(&self) -> bool {
        !matches!(self, SchedulerKind::Direct)
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SchedulerKind::Slurm => write!(f, "slurm"),
            SchedulerKind::Pbs => write!(f, "pbs"),
            SchedulerKind::Direct => write!(f, "direct"),
        }
    }
}

/// Resource requests, turned into directives by queue schedulers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Resources {
    pub nodes: Option<u32>,
    pub ntasks: Option<u32>,
    /// Wall time, e.g. `01:00:00`.
    pub time: Option<String>,
    /// Partition (Slurm) or queue (PBS).
    pub partition: Option<String>,
    pub account: Option<String>,
    pub memory: Option<String>,
    /// Free-form directive bodies, emitted after the prefix as-is.
    pub extra: Vec<String>,
}

/// The blocks of one job script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptSpec {
    pub shell: String,
    pub directives: Vec<String>,
    pub environment: Vec<String>,
    pub command: String,
    pub post: Vec<String>,
}

impl ScriptSpec {
    /// Serializes the blocks in order, separated by blank lines. The shebang
    /// heads the directive block. Empty blocks are left out.
    pub fn render(&self) -> String {
        let shebang = if self.shell.starts_with('/') {
            format!("#!{}", self.shell)
        } else {
            format!("#!/bin/{}", self.shell)
        };
        let mut head = vec![shebang];
        head.extend(self.directives.iter().cloned());

        let mut blocks = vec![head.join("\n")];
        if !self.environment.is_empty() {
            blocks.push(self.environment.join("\n"));
        }
        if !self.command.trim().is_empty() {
            blocks.push(self.command.trim_end().to_string());
        }
        if !self.post.is_empty() {
            blocks.push(self.post.join("\n"));
        }
        let mut text = blocks.join("\n\n");
        text.push('\n');
        text
    }
}

pub trait Scheduler: Send + Sync {
    fn kind(&self) -> SchedulerKind;

    /// Header lines for the directive block.
    fn directives(&self, job_name: &str, resources: &Resources) -> Vec<String>;

    fn submit_command(&self, shell: &str, script: &str) -> String;

    /// Files the job's stdout and stderr go to, relative to the job directory.
    fn log_files(&self, job_name: &str) -> Vec<String>;

    /// Pattern whose first capture group is the job id in submission output.
    fn job_id_regex(&self) -> Option<&'static Regex>;

    /// Client binary that must be on `PATH` for local submission.
    fn client(&self) -> Option<&'static str>;

    /// Command that succeeds only if the scheduler's controller responds.
    fn controller_ping(&self) -> Option<(&'static str, &'static [&'static str])>;

    /// Command listing the job while it is in the live queue.
    fn live_query(&self, job_id: &str) -> Option<String>;

    /// Reads the live query's output. `None` once the job has left the queue.
    fn live_state(&self, output: &str) -> Option<JobState>;

    /// Command asking accounting for a job's final state.
    fn accounting_query(&self, job_id: &str) -> Option<String>;

    fn classify(&self, output: &str) -> JobState;
}

pub fn scheduler_for(kind: SchedulerKind) -> Box<dyn Scheduler> {
    match kind {
        SchedulerKind::Slurm => Box::new(Slurm),
        SchedulerKind::Pbs => Box::new(Pbs),
        SchedulerKind::Direct => Box::new(Direct),
    }
}

/// First capture of `re` in `output`.
pub fn extract_job_id(re: &Regex, output: &str) -> Option<String> {
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// First non-empty line, trimmed.
pub fn first_line(output: &str) -> &str {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
}

pub struct Slurm;

impl Scheduler for Slurm {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Slurm
    }

    fn directives(&self, job_name: &str, resources: &Resources) -> Vec<String> {
        let mut lines = vec![
            format!("--job-name={}", job_name),
            format!("--output={}.out", job_name),
            format!("--error={}.err", job_name),
        ];
        if let Some(nodes) = resources.nodes {
            lines.push(format!("--nodes={}", nodes));
        }
        if let Some(ntasks) = resources.ntasks {
            lines.push(format!("--ntasks={}", ntasks));
        }
        if let Some(time) = &resources.time {
            lines.push(format!("--time={}", time));
        }
        if let Some(partition) = &resources.partition {
            lines.push(format!("--partition={}", partition));
        }
        if let Some(account) = &resources.account {
            lines.push(format!("--account={}", account));
        }
        if let Some(memory) = &resources.memory {
            lines.push(format!("--mem={}", memory));
        }
        lines.extend(resources.extra.iter().cloned());
        lines.into_iter().map(|l| format!("#SBATCH {}", l)).collect()
    }

    fn submit_command(&self, _shell: &str, script: &str) -> String {
        format!("sbatch {}", script)
    }

    fn log_files(&self, job_name: &str) -> Vec<String> {
        vec![format!("{}.out", job_name), format!("{}.err", job_name)]
    }

    fn job_id_regex(&self) -> Option<&'static Regex> {
        Some(&*SLURM_JOB_ID)
    }

    fn client(&self) -> Option<&'static str> {
        Some("sbatch")
    }

    fn controller_ping(&self) -> Option<(&'static str, &'static [&'static str])> {
        Some(("scontrol", &["ping"]))
    }

    fn live_query(&self, job_id: &str) -> Option<String> {
        Some(format!("squeue -j {} -h -o %T", job_id))
    }

    fn live_state(&self, output: &str) -> Option<JobState> {
        match first_line(output) {
            "" => None,
            "PENDING" | "CONFIGURING" | "REQUEUED" | "SUSPENDED" => Some(JobState::Queued),
            _ => Some(JobState::Running),
        }
    }

    fn accounting_query(&self, job_id: &str) -> Option<String> {
        Some(format!("sacct -j {} -n -o State --parsable2", job_id))
    }

    fn classify(&self, output: &str) -> JobState {
        // `CANCELLED by 1234` carries the canceller's uid.
        let state = first_line(output).split_whitespace().next().unwrap_or_default();
        match state {
            "" => JobState::Unknown,
            "COMPLETED" | "COMPLETING" => JobState::Completed,
            "CANCELLED" => JobState::Cancelled,
            "PENDING" | "REQUEUED" | "SUSPENDED" => JobState::Queued,
            "RUNNING" | "CONFIGURING" => JobState::Running,
            _ => JobState::Failed,
        }
    }
}

pub struct Pbs;

impl Pbs {
    /// Value of a `key = value` line from `qstat -f`.
    fn attribute(output: &str) -> &str {
        let line = first_line(output);
        line.split_once('=').map(|(_, v)| v.trim()).unwrap_or(line)
    }
}

impl Scheduler for Pbs {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Pbs
    }

    fn directives(&self, job_name: &str, resources: &Resources) -> Vec<String> {
        let mut lines = vec![
            format!("-N {}", job_name),
            format!("-o {}.out", job_name),
            format!("-e {}.err", job_name),
        ];
        match (resources.nodes, resources.ntasks) {
            (None, None) => {}
            (nodes, None) => lines.push(format!("-l nodes={}", nodes.unwrap_or(1))),
            (nodes, Some(ppn)) => lines.push(format!("-l nodes={}:ppn={}", nodes.unwrap_or(1), ppn)),
        }
        if let Some(time) = &resources.time {
            lines.push(format!("-l walltime={}", time));
        }
        if let Some(queue) = &resources.partition {
            lines.push(format!("-q {}", queue));
        }
        if let Some(account) = &resources.account {
            lines.push(format!("-A {}", account));
        }
        if let Some(memory) = &resources.memory {
            lines.push(format!("-l mem={}", memory));
        }
        lines.extend(resources.extra.iter().cloned());
        lines.into_iter().map(|l| format!("#PBS {}", l)).collect()
    }

    fn submit_command(&self, _shell: &str, script: &str) -> String {
        format!("qsub {}", script)
    }

    fn log_files(&self, job_name: &str) -> Vec<String> {
        vec![format!("{}.out", job_name), format!("{}.err", job_name)]
    }

    fn job_id_regex(&self) -> Option<&'static Regex> {
        Some(&*PBS_JOB_ID)
    }

    fn client(&self) -> Option<&'static str> {
        Some("qsub")
    }

    fn controller_ping(&self) -> Option<(&'static str, &'static [&'static str])> {
        Some(("qstat", &["-B"]))
    }

    fn live_query(&self, job_id: &str) -> Option<String> {
        Some(format!("qstat -f {} | grep job_state", job_id))
    }

    fn live_state(&self, output: &str) -> Option<JobState> {
        match Self::attribute(output) {
            "" | "C" | "F" => None,
            "Q" | "H" | "W" | "T" => Some(JobState::Queued),
            _ => Some(JobState::Running),
        }
    }

    fn accounting_query(&self, job_id: &str) -> Option<String> {
        Some(format!("qstat -xf {} | grep Exit_status", job_id))
    }

    fn classify(&self, output: &str) -> JobState {
        match Self::attribute(output) {
            "" => JobState::Unknown,
            "0" => JobState::Completed,
            // Negative exit codes are PBS's own, e.g. -11 for a deleted job.
            code if code.starts_with('-') => JobState::Cancelled,
            _ => JobState::Failed,
        }
    }
}

pub struct Direct;

impl Scheduler for Direct {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Direct
    }

    fn directives(&self, _job_name: &str, _resources: &Resources) -> Vec<String> {
        vec![]
    }

    fn submit_command(&self, shell: &str, script: &str) -> String {
        format!("{} {}", shell, script)
    }

    /// Output comes back through the submission command itself.
    fn log_files(&self, _job_name: &str) -> Vec<String> {
        vec![]
    }

    fn job_id_regex(&self) -> Option<&'static Regex> {
        None
    }

    fn client(&self) -> Option<&'static str> {
        None
    }

    fn controller_ping(&self) -> Option<(&'static str, &'static [&'static str])> {
        None
    }

    fn live_query(&self, _job_id: &str) -> Option<String> {
        None
    }

    fn live_state(&self, _output: &str) -> Option<JobState> {
        None
    }

    fn accounting_query(&self, _job_id: &str) -> Option<String> {
        None
    }

    fn classify(&self, _output: &str) -> JobState {
        JobState::Unknown
    }
}

pub struct JobScriptGenerator {
    scheduler: Box<dyn Scheduler>,
    shell: String,
}

impl JobScriptGenerator {
    pub fn new(kind: SchedulerKind, shell: &str) -> Self {
        Self {
            scheduler: scheduler_for(kind),
            shell: shell.to_string(),
        }
    }

    pub fn for_machine(machine: &MachineConfig) -> Self {
        Self::new(machine.scheduler, &machine.shell)
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    pub fn spec(&self, job_name: &str, command: &str, machine: &MachineConfig) -> ScriptSpec {
        let mut environment = Vec::new();
        if let Some(prepend) = &machine.prepend {
            environment.extend(snippet_lines(prepend));
        }
        if machine.use_modules && !machine.modules.is_empty() {
            environment.push("module purge".to_string());
            environment.extend(machine.modules.iter().map(|m| format!("module load {}", m)));
        }
        if let Some(profile) = &machine.profile {
            let profile = profile.trim();
            if profile.starts_with("source ") || profile.starts_with(". ") {
                environment.push(profile.to_string());
            } else if !profile.is_empty() {
                environment.push(format!("source {}", profile));
            }
        }

        ScriptSpec {
            shell: self.shell.clone(),
            directives: self.scheduler.directives(job_name, &machine.resources),
            environment,
            command: command.to_string(),
            post: machine
                .postpend
                .as_deref()
                .map(snippet_lines)
                .unwrap_or_default(),
        }
    }

    pub fn generate(&self, job_name: &str, command: &str, machine: &MachineConfig) -> String {
        let script = self.spec(job_name, command, machine).render();
        debug!(scheduler = %self.scheduler.kind(), job = job_name, "generated job script");
        script
    }

    pub fn submit_command(&self, script: &str) -> String {
        self.scheduler.submit_command(&self.shell, script)
    }
}

fn snippet_lines(snippet: &str) -> Vec<String> {
    snippet
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// The local commands the availability check needs.
#[async_trait]
pub trait LocalCommands: Send + Sync {
    fn on_path(&self, program: &str) -> bool;

    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, SimrunError>;
}

pub struct SystemCommands;

#[async_trait]
impl LocalCommands for SystemCommands {
    fn on_path(&self, program: &str) -> bool {
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
            .unwrap_or(false)
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, SimrunError> {
        let output = tokio::process::Command::new(program).args(args).output().await?;
        Ok(output.into())
    }
}

/// Whether `FORCE_SCHEDULER_ENV` is set to `1`.
pub fn force_scheduler_from_env() -> bool {
    std::env::var(FORCE_SCHEDULER_ENV).as_deref() == Ok("1")
}

/// Confirms a queue scheduler can take local submissions: its client is on
/// `PATH` and its controller answers. Direct execution always passes.
pub async fn check_local_availability(
    scheduler: &dyn Scheduler,
    commands: &dyn LocalCommands,
    force: bool,
) -> Result<(), SimrunError> {
    let kind = scheduler.kind();
    if !kind.is_queue() {
        return Ok(());
    }
    if force {
        warn!(scheduler = %kind, "{} is set, skipping scheduler availability check", FORCE_SCHEDULER_ENV);
        return Ok(());
    }
    let unavailable = |reason: String| SimrunError::SchedulerUnavailable { kind, reason };

    if let Some(client) = scheduler.client() {
        if !commands.on_path(client) {
            return Err(unavailable(format!("'{}' not found on PATH", client)));
        }
    }
    if let Some((program, args)) = scheduler.controller_ping() {
        let shown = format!("{} {}", program, args.join(" "));
        let output = commands
            .run(program, args)
            .await
            .map_err(|e| unavailable(format!("`{}` could not run: {}", shown, e)))?;
        if !output.success() {
            return Err(unavailable(format!(
                "`{}` failed: {}",
                shown,
                output.combined()
            )));
        }
    }
    debug!(scheduler = %kind, "scheduler available");
    Ok(())
}
