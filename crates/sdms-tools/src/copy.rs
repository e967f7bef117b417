//! Remote copy into the cache tier

use crate::exec;
use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use sdms_common::config::CopyConfig;
use sdms_common::{Error, ErrorClass, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a single copy attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    Failed { class: ErrorClass, message: String },
}

impl CopyOutcome {
    pub fn failed(class: ErrorClass, message: impl Into<String>) -> Self {
        Self::Failed {
            class,
            message: message.into(),
        }
    }
}

/// Copies a scratch file to a remote cache URI
#[async_trait]
pub trait CopyTool: Send + Sync {
    async fn copy(&self, source: &Path, destination: &str) -> CopyOutcome;

    /// Terminate lingering copy processes on this host; returns whether any
    /// were found
    async fn kill_stale(&self) -> Result<bool>;
}

/// Failure class of a failed copy from its combined output
pub fn classify_copy_output(output: &str) -> ErrorClass {
    let lower = output.to_lowercase();
    if lower.contains("file already exists") || lower.contains("file exists") {
        ErrorClass::AlreadyExists
    } else if lower.contains("no space left on device") {
        ErrorClass::NoSpace
    } else if lower.contains("no such file or directory") {
        ErrorClass::NoSuchPath
    } else {
        ErrorClass::Unknown
    }
}

/// `xrdcp <options> <source> <destination>`
#[derive(Debug, Clone)]
pub struct XrdCopy {
    program: String,
    options: Vec<String>,
    timeout: Duration,
    process_name: String,
}

impl XrdCopy {
    pub fn new(config: &CopyConfig, process_name: impl Into<String>) -> Self {
        Self {
            program: config.program.clone(),
            options: config.options.clone(),
            timeout: config.attempt_timeout(),
            process_name: process_name.into(),
        }
    }
}

#[async_trait]
impl CopyTool for XrdCopy {
    async fn copy(&self, source: &Path, destination: &str) -> CopyOutcome {
        let mut args = self.options.clone();
        args.push(source.to_string_lossy().into_owned());
        args.push(destination.to_string());

        match exec::run(&self.program, &args, None, self.timeout).await {
            Ok(output) if output.success => CopyOutcome::Copied,
            Ok(output) => {
                let combined = output.combined();
                CopyOutcome::failed(classify_copy_output(&combined), combined.trim())
            }
            Err(Error::Timeout { secs, .. }) => {
                CopyOutcome::failed(ErrorClass::Timeout, format!("timed out after {secs}s"))
            }
            Err(e) => CopyOutcome::failed(ErrorClass::Unknown, e.to_string()),
        }
    }

    async fn kill_stale(&self) -> Result<bool> {
        let args = vec!["-x".to_string(), self.process_name.clone()];
        let output = exec::run("pgrep", &args, None, Duration::from_secs(30)).await?;
        match output.code {
            Some(0) => {}
            Some(1) => return Ok(false),
            code => {
                return Err(Error::tool(
                    "pgrep",
                    format!("exited with {code:?}: {}", output.combined().trim()),
                ));
            }
        }

        let own = Pid::this();
        let mut terminated = 0;
        for pid in parse_pids(&output.stdout).into_iter().filter(|pid| *pid != own) {
            match kill(pid, Signal::SIGTERM) {
                Ok(()) => terminated += 1,
                Err(e) => warn!(%pid, "Could not terminate {}: {}", self.process_name, e),
            }
        }
        debug!("Terminated {} lingering {} processes", terminated, self.process_name);
        Ok(terminated > 0)
    }
}

/// Process ids listed one per line
fn parse_pids(listing: &str) -> Vec<Pid> {
    listing
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .map(Pid::from_raw)
        .collect()
}
