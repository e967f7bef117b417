//! Remote command execution on cache nodes

use crate::exec;
use async_trait::async_trait;
use sdms_common::{NodeName, Result};
use std::time::Duration;

/// Runs file operations on a remote node
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Force-remove `paths` on `node` in a single invocation
    async fn remove_files(&self, node: &NodeName, paths: &[String]) -> Result<()>;
}

/// `ssh <node> rm -f <paths...>`
#[derive(Debug, Clone)]
pub struct SshShell {
    program: String,
    timeout: Duration,
}

impl SshShell {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

impl Default for SshShell {
    fn default() -> Self {
        Self::new("ssh", Duration::from_secs(300))
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn remove_files(&self, node: &NodeName, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let args: Vec<String> = [node.as_str(), "rm", "-f"]
            .iter()
            .map(ToString::to_string)
            .chain(paths.iter().cloned())
            .collect();
        exec::run_checked(&self.program, &args, None, self.timeout).await?;
        Ok(())
    }
}
