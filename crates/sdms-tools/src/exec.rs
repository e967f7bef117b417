//! Bounded external process execution

use sdms_common::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout followed by stderr; several tools report on stderr only
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }

    /// Lines of the combined output with runs of whitespace collapsed
    pub fn cleaned_lines(&self) -> Vec<String> {
        self.combined().lines().map(clean_line).collect()
    }
}

/// Collapse runs of whitespace into single spaces and trim
pub fn clean_line(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Run `program args...` and wait at most `limit`.
///
/// The child is killed when the limit expires. A non-zero exit status is
/// not an error here; callers interpret the output.
pub async fn run(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    limit: Duration,
) -> Result<CommandOutput> {
    debug!("Running {} {}", program, args.join(" "));

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let child = cmd
        .spawn()
        .map_err(|e| Error::tool(program, format!("failed to spawn: {e}")))?;

    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(Error::tool(program, format!("failed to wait: {e}"))),
        Err(_) => {
            warn!("Command timed out: {} {}", program, args.join(" "));
            Err(Error::Timeout {
                tool: program.to_string(),
                secs: limit.as_secs(),
            })
        }
    }
}

/// Like [`run`], but a non-zero exit status becomes [`Error::Tool`]
pub async fn run_checked(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    limit: Duration,
) -> Result<CommandOutput> {
    let output = run(program, args, cwd, limit).await?;
    if output.success {
        Ok(output)
    } else {
        let code = output.code.unwrap_or(-1);
        Err(Error::tool(
            program,
            format!("exited with code {code}: {}", output.combined().trim()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_run_captures_both_streams() {
        let output = run(
            "sh",
            &args(&["-c", "echo out; echo err >&2"]),
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(output.success);
        assert_eq!(output.combined(), "out\nerr\n");
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let err = run("sleep", &args(&["5"]), None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_run_checked_reports_exit_code() {
        let err = run_checked("sh", &args(&["-c", "exit 3"]), None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("code 3"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = run("/nonexistent/tool", &[], None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tool { .. }));
    }

    #[test]
    fn test_clean_line() {
        assert_eq!(clean_line("  HTAR:   HTAR\tSUCCESSFUL \n"), "HTAR: HTAR SUCCESSFUL");
    }
}
