use std::path::PathBuf;

use itertools::Itertools;
use thiserror::Error;

use crate::script::SchedulerKind;

#[derive(Error, Debug)]
pub enum SimrunError {
    #[error("Failed to connect SSH session or execute SSH command: {0}")]
    SshError(#[from] openssh::Error),
    #[error("Failed to execute local command: {0}")]
    LocalCommandError(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No credentials for {user}@{host}: configure an SSH key, a password, or both")]
    NoCredentials { host: String, user: String },
    #[error("Failed to connect to {user}@{host}:{port} after {attempts} attempts: {reason}")]
    Connectivity {
        host: String,
        user: String,
        port: u16,
        attempts: u32,
        reason: String,
    },
    #[error("Remote command `{command}` failed on {host}: {reason}")]
    RemoteCommand {
        host: String,
        command: String,
        reason: String,
    },

    #[error("Transfer of {path} on {host} failed: {reason}")]
    Transfer {
        host: String,
        path: String,
        reason: String,
    },
    #[error("Asset '{asset}' not found. Searched: {}", display_paths(.searched))]
    AssetNotFound { asset: String, searched: Vec<PathBuf> },
    #[error("Checksum mismatch for {path} on {host}: local {local}, remote {remote}")]
    Integrity {
        host: String,
        path: String,
        local: String,
        remote: String,
    },

    #[error("{kind} scheduler unavailable: {reason}")]
    SchedulerUnavailable { kind: SchedulerKind, reason: String },
    #[error("Submission of {script} on {host} failed: {stderr}")]
    Submission {
        host: String,
        script: String,
        stderr: String,
    },
    #[error("Job {job_id} on {host} timed out after {timeout_secs} seconds")]
    Timeout {
        host: String,
        job_id: String,
        timeout_secs: u64,
    },
    #[error("Job {job_id} on {host} failed with state: {state}")]
    JobFailed {
        host: String,
        job_id: String,
        state: String,
    },
    #[error("Expected output {path} does not exist on remote system {host}")]
    OutputMissing { host: String, path: String },
    #[error("No submitted job recorded at {}", .path.display())]
    NoJobRecord { path: PathBuf },
    #[error("Failed to retrieve {path} from {host} after {attempts} attempts: {reason}")]
    Retrieval {
        host: String,
        path: String,
        attempts: u32,
        reason: String,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "(no search locations configured)".to_string();
    }
    paths.iter().map(|p| p.display()).join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_not_found_lists_every_location_in_order() {
        let err = SimrunError::AssetNotFound {
            asset: "Si.pbe.UPF".to_string(),
            searched: vec![PathBuf::from("/explicit"), PathBuf::from("/env/base")],
        };
        assert_eq!(
            err.to_string(),
            "Asset 'Si.pbe.UPF' not found. Searched: /explicit, /env/base"
        );
    }

    #[test]
    fn connectivity_error_names_host_and_attempts() {
        let err = SimrunError::Connectivity {
            host: "cluster.edu".to_string(),
            user: "alice".to_string(),
            port: 22,
            attempts: 3,
            reason: "connection refused".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("alice@cluster.edu:22"));
        assert!(msg.contains("3 attempts"));
    }
}
