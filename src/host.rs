//! SSH targets.
//!
//! One pooled session exists per `HostKey`, i.e. per (hostname, username) pair.
//! The port is part of the `Host` but not of the key: two configurations that
//! only differ in port share a session.

use std::fmt;

use colored::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// SSH hostname to connect to.
    pub hostname: String,
    /// Login name on the remote side.
    pub username: String,
    /// SSH port. Defaults to 22.
    pub port: u16,
}

impl Host {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            port: 22,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn key(&self) -> HostKey {
        HostKey {
            hostname: self.hostname.clone(),
            username: self.username.clone(),
        }
    }

    /// For pretty-printing the host in CLI summaries.
    pub fn prettify(&self) -> ColoredString {
        format!("{}", self).bold().cyan()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.port == 22 {
            write!(f, "[{}@{}]", self.username, self.hostname)
        } else {
            write!(f, "[{}@{}:{}]", self.username, self.hostname, self.port)
        }
    }
}

/// Pool key for sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostKey {
    pub hostname: String,
    pub username: String,
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.hostname)
    }
}
