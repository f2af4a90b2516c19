//! Moving files to and from a remote session.
//!
//! Every upload can be checked by hashing both ends: the local side with
//! `sha2`, the remote side with `sha256sum`. What a mismatch means is up to
//! the machine's `ChecksumPolicy`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{AssetPolicy, ChecksumPolicy, TransferPolicy};
use crate::error::SimrunError;
use crate::host::HostKey;
use crate::session::{quote, RemoteSession};

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Joins a remote directory and a relative name with exactly one slash.
pub fn remote_join(base: &str, name: &str) -> String {
    if base.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// One file that went over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub local: PathBuf,
    pub remote: String,
    /// (local, remote) SHA-256, if the transfer was verified.
    pub checksums: Option<(String, String)>,
}

impl TransferRecord {
    pub fn verified(&self) -> bool {
        matches!(&self.checksums, Some((local, remote)) if local == remote)
    }
}

#[derive(Debug, Default)]
pub struct TransferService {
    policy: TransferPolicy,
    /// Remote directories already created, per session key.
    known_dirs: HashSet<(HostKey, String)>,
}

impl TransferService {
    pub fn new(policy: TransferPolicy) -> Self {
        Self {
            policy,
            known_dirs: HashSet::new(),
        }
    }

    pub fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: TransferPolicy) {
        self.policy = policy;
    }

    /// `mkdir -p` on the remote side. Repeated calls for a directory this
    /// service already created issue no command.
    pub async fn ensure_remote_dir(
        &mut self,
        session: &RemoteSession,
        path: &str,
    ) -> Result<(), SimrunError> {
        let key = (session.host().key(), path.to_string());
        if self.known_dirs.contains(&key) {
            debug!(host = %session.host(), path, "remote directory already present");
            return Ok(());
        }
        let output = session.run(&format!("mkdir -p {}", quote(path))).await?;
        if !output.success() {
            return Err(SimrunError::Transfer {
                host: session.host().hostname.clone(),
                path: path.to_string(),
                reason: format!("mkdir failed: {}", output.stderr.trim()),
            });
        }
        info!(host = %session.host(), path, "created remote directory");
        self.known_dirs.insert(key);
        Ok(())
    }

    pub async fn put_file(
        &self,
        session: &RemoteSession,
        local: &Path,
        remote: &str,
    ) -> Result<(), SimrunError> {
        let contents = read_local(session, local).await?;
        self.put_bytes(session, &contents, remote).await
    }

    pub async fn put_bytes(
        &self,
        session: &RemoteSession,
        contents: &[u8],
        remote: &str,
    ) -> Result<(), SimrunError> {
        session.upload(contents, remote).await?;
        info!(host = %session.host(), path = remote, bytes = contents.len(), "uploaded");
        Ok(())
    }

    /// Downloads `remote` into `local`, creating parent directories as needed.
    pub async fn get_file(
        &self,
        session: &RemoteSession,
        remote: &str,
        local: &Path,
    ) -> Result<(), SimrunError> {
        let contents = session.download(remote).await?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, &contents).await?;
        info!(
            host = %session.host(),
            path = remote,
            local = %local.display(),
            bytes = contents.len(),
            "downloaded"
        );
        Ok(())
    }

    /// SHA-256 of a remote file.
    pub async fn checksum(&self, session: &RemoteSession, remote: &str) -> Result<String, SimrunError> {
        let output = session.run(&format!("sha256sum {}", quote(remote))).await?;
        let digest = output.stdout.split_whitespace().next().map(str::to_string);
        match digest {
            Some(digest) if output.success() => Ok(digest),
            _ => Err(SimrunError::Transfer {
                host: session.host().hostname.clone(),
                path: remote.to_string(),
                reason: format!("sha256sum failed: {}", output.stderr.trim()),
            }),
        }
    }

    /// Uploads a local file and checks that both ends hash the same.
    pub async fn verified_transfer(
        &self,
        session: &RemoteSession,
        local: &Path,
        remote: &str,
    ) -> Result<TransferRecord, SimrunError> {
        let contents = read_local(session, local).await?;
        self.verified_put_bytes(session, &contents, local, remote).await
    }

    /// Like `verified_transfer`, for content that only exists in memory.
    /// `origin` is recorded as the local side.
    pub async fn verified_put_bytes(
        &self,
        session: &RemoteSession,
        contents: &[u8],
        origin: &Path,
        remote: &str,
    ) -> Result<TransferRecord, SimrunError> {
        let record = |checksums| TransferRecord {
            local: origin.to_path_buf(),
            remote: remote.to_string(),
            checksums,
        };

        if self.policy.checksum == ChecksumPolicy::Off {
            self.put_bytes(session, contents, remote).await?;
            return Ok(record(None));
        }

        let local_sum = sha256_hex(contents);
        let mut resends = 0;
        loop {
            self.put_bytes(session, contents, remote).await?;
            let remote_sum = self.checksum(session, remote).await?;
            if remote_sum == local_sum {
                debug!(host = %session.host(), path = remote, checksum = %local_sum, "checksum verified");
                return Ok(record(Some((local_sum, remote_sum))));
            }
            if resends < self.policy.retransfers {
                resends += 1;
                debug!(host = %session.host(), path = remote, resends, "checksum mismatch, re-sending");
                continue;
            }
            if self.policy.checksum == ChecksumPolicy::Fail {
                return Err(SimrunError::Integrity {
                    host: session.host().hostname.clone(),
                    path: remote.to_string(),
                    local: local_sum,
                    remote: remote_sum,
                });
            }
            warn!(
                host = %session.host(),
                path = remote,
                local = %local_sum,
                remote = %remote_sum,
                "checksum mismatch after transfer"
            );
            return Ok(record(Some((local_sum, remote_sum))));
        }
    }

    /// Uploads the top-level files of `local_dir`, plus the files directly
    /// inside its `asset_subdir` if there is one. Other subdirectories are skipped.
    pub async fn put_directory(
        &mut self,
        session: &RemoteSession,
        local_dir: &Path,
        remote_dir: &str,
        asset_subdir: &str,
    ) -> Result<Vec<TransferRecord>, SimrunError> {
        self.ensure_remote_dir(session, remote_dir).await?;
        let mut records = Vec::new();
        for file in top_level_files(local_dir).await? {
            let name = file_name(&file);
            let remote = remote_join(remote_dir, &name);
            records.push(self.verified_transfer(session, &file, &remote).await?);
        }

        let assets = local_dir.join(asset_subdir);
        if !asset_subdir.is_empty() && is_dir(&assets).await {
            let remote_assets = remote_join(remote_dir, asset_subdir);
            self.ensure_remote_dir(session, &remote_assets).await?;
            for file in top_level_files(&assets).await? {
                let remote = remote_join(&remote_assets, &file_name(&file));
                records.push(self.verified_transfer(session, &file, &remote).await?);
            }
        }
        Ok(records)
    }
}

async fn read_local(session: &RemoteSession, local: &Path) -> Result<Vec<u8>, SimrunError> {
    tokio::fs::read(local)
        .await
        .map_err(|e| SimrunError::Transfer {
            host: session.host().hostname.clone(),
            path: local.display().to_string(),
            reason: format!("cannot read local file: {}", e),
        })
}

async fn top_level_files(dir: &Path) -> Result<Vec<PathBuf>, SimrunError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        // Follows symlinks, so a linked file counts as a file.
        if is_file(&entry.path()).await {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Finds a required local asset. Looks in `explicit`, then the directory
/// named by the policy's environment variable, then the default directory
/// under home. The error lists every directory searched, in that order.
pub async fn locate_asset(
    name: &str,
    explicit: Option<&Path>,
    policy: &AssetPolicy,
) -> Result<PathBuf, SimrunError> {
    let mut searched = Vec::new();
    if let Some(dir) = explicit {
        searched.push(dir.to_path_buf());
    }
    if let Some(var) = &policy.env_var {
        if let Some(base) = std::env::var_os(var).filter(|v| !v.is_empty()) {
            searched.push(PathBuf::from(base));
        }
    }
    if let Some(default) = &policy.default_dir {
        if let Some(home) = dirs::home_dir() {
            searched.push(home.join(default));
        }
    }

    for dir in &searched {
        let candidate = dir.join(name);
        if is_file(&candidate).await {
            debug!(asset = name, path = %candidate.display(), "located asset");
            return Ok(candidate);
        }
    }
    Err(SimrunError::AssetNotFound {
        asset: name.to_string(),
        searched,
    })
}

/// Points `key = ...` in an input file at `./<subdir>`, keeping any quotes.
pub fn rewrite_asset_dir(input: &str, key: &str, subdir: &str) -> Result<String, SimrunError> {
    let pattern = format!(r#"(?mi)^(\s*{}\s*=\s*)(['"]?)[^'"\n,]*(['"]?)"#, regex::escape(key));
    let re = Regex::new(&pattern)
        .map_err(|e| SimrunError::Config(format!("invalid asset key '{}': {}", key, e)))?;
    let replacement = format!("${{1}}${{2}}./{}${{3}}", subdir);
    Ok(re.replace_all(input, replacement.as_str()).into_owned())
}
