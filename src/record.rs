//! What was submitted where, kept next to the job's input.
//!
//! Written right after a successful submission so that a later invocation
//! can wait for the same job and fetch its output without submitting again.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SimrunError;
use crate::host::Host;
use crate::job::JobDescriptor;
use crate::script::SchedulerKind;

pub const RECORD_NAME: &str = ".simrun_job.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteJobRecord {
    pub hostname: String,
    pub username: String,
    pub port: u16,
    pub remote_dir: String,
    pub scheduler: SchedulerKind,
    pub job_name: String,
    /// None when the submission output carried no id.
    pub job_id: Option<String>,
    pub output_file: String,
}

impl RemoteJobRecord {
    pub fn new(host: &Host, remote_dir: &str, job: &JobDescriptor) -> Self {
        Self {
            hostname: host.hostname.clone(),
            username: host.username.clone(),
            port: host.port,
            remote_dir: remote_dir.to_string(),
            scheduler: job.scheduler,
            job_name: job.name.clone(),
            job_id: job.job_id.clone(),
            output_file: job.output_file.clone(),
        }
    }

    pub fn path(local_dir: &Path) -> PathBuf {
        local_dir.join(RECORD_NAME)
    }

    pub async fn save(&self, local_dir: &Path) -> Result<PathBuf, SimrunError> {
        let path = Self::path(local_dir);
        tokio::fs::write(&path, serde_yaml::to_string(self)?).await?;
        Ok(path)
    }

    pub async fn load(local_dir: &Path) -> Result<Self, SimrunError> {
        let path = Self::path(local_dir);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SimrunError::NoJobRecord { path })
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn host(&self) -> Host {
        Host::new(&self.hostname, &self.username).with_port(self.port)
    }

    /// The job as the coordinator sees it after submission.
    pub fn descriptor(&self, local_dir: &Path) -> JobDescriptor {
        let mut job = JobDescriptor::new(&self.job_name, local_dir, "");
        job.remote_dir = Some(self.remote_dir.clone());
        job.output_file = self.output_file.clone();
        job.scheduler = self.scheduler;
        job.job_id = self.job_id.clone();
        job
    }
}
