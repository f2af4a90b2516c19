//! Waiting for queued jobs to finish.
//!
//! A job is polled through the scheduler's live queue until it drops out,
//! then its final state is read from accounting. The poll interval is fixed.
//! Hitting the timeout gives up locally; the remote job is left alone.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PollPolicy;
use crate::error::SimrunError;
use crate::script::{first_line, Scheduler};
use crate::session::RemoteSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Accounting had nothing to say about the job.
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Unknown
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            JobState::Submitted => "SUBMITTED",
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::Unknown => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

/// How a finished job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalStatus {
    pub job_id: String,
    pub state: JobState,
    /// What accounting actually printed, e.g. `COMPLETED` or `Exit_status = 0`.
    pub raw: String,
    /// Number of live queue queries made.
    pub polls: u32,
}

pub async fn wait_for_completion(
    session: &RemoteSession,
    scheduler: &dyn Scheduler,
    job_id: &str,
    policy: &PollPolicy,
) -> Result<FinalStatus, SimrunError> {
    let (Some(live_query), Some(accounting_query)) = (
        scheduler.live_query(job_id),
        scheduler.accounting_query(job_id),
    ) else {
        debug!(scheduler = %scheduler.kind(), job_id, "scheduler has no queue to poll");
        return Ok(FinalStatus {
            job_id: job_id.to_string(),
            state: JobState::Unknown,
            raw: String::new(),
            polls: 0,
        });
    };

    let host = session.host();
    let timeout = Duration::from_secs(policy.timeout_secs);
    let interval = Duration::from_secs(policy.interval_secs);
    let start = Instant::now();
    let mut state = JobState::Submitted;
    let mut polls = 0;
    info!(%host, job_id, timeout_secs = policy.timeout_secs, "waiting for job");

    loop {
        polls += 1;
        let live = session.run(&live_query).await?;
        let observed = match scheduler.live_state(&live.stdout) {
            Some(active) => active,
            None => {
                let accounting = session.run(&accounting_query).await?;
                let terminal = scheduler.classify(&accounting.stdout);
                if terminal.is_terminal() {
                    transition(&mut state, terminal, host, job_id);
                    let raw = first_line(&accounting.stdout).to_string();
                    return settle(host, job_id, terminal, raw, polls, policy);
                }
                // Accounting can lag behind the queue.
                terminal
            }
        };
        transition(&mut state, observed, host, job_id);

        if start.elapsed() >= timeout {
            warn!(%host, job_id, %state, "timed out waiting for job; it keeps running remotely");
            return Err(SimrunError::Timeout {
                host: host.hostname.clone(),
                job_id: job_id.to_string(),
                timeout_secs: policy.timeout_secs,
            });
        }
        tokio::time::sleep(interval).await;
    }
}

fn transition(state: &mut JobState, next: JobState, host: &crate::host::Host, job_id: &str) {
    if *state != next {
        info!(%host, job_id, from = %state, to = %next, "job state changed");
        *state = next;
    }
}

fn settle(
    host: &crate::host::Host,
    job_id: &str,
    state: JobState,
    raw: String,
    polls: u32,
    policy: &PollPolicy,
) -> Result<FinalStatus, SimrunError> {
    let accepted = match state {
        JobState::Completed => true,
        JobState::Unknown if policy.accept_unknown => {
            warn!(%host, job_id, "no accounting record for job, assuming it completed");
            true
        }
        _ => false,
    };
    if !accepted {
        return Err(SimrunError::JobFailed {
            host: host.hostname.clone(),
            job_id: job_id.to_string(),
            state: if raw.is_empty() { state.to_string() } else { raw },
        });
    }
    info!(%host, job_id, %state, polls, "job finished");
    Ok(FinalStatus {
        job_id: job_id.to_string(),
        state,
        raw,
        polls,
    })
}
