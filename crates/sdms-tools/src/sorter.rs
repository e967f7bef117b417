//! Tape-locality ordering

use crate::exec;
use async_trait::async_trait;
use sdms_common::Result;
use sdms_common::config::ToolConfig;
use std::path::Path;

/// Reorders archive paths by their position on tape
#[async_trait]
pub trait TapeSorter: Send + Sync {
    /// Read the newline-delimited path list in `list_file` and return the
    /// same paths in retrieval order
    async fn sort(&self, list_file: &Path) -> Result<Vec<String>>;
}

/// Site sorter script; prints the reordered list on stdout
#[derive(Debug, Clone)]
pub struct HpssTapeSorter {
    tool: ToolConfig,
}

impl HpssTapeSorter {
    pub const fn new(tool: ToolConfig) -> Self {
        Self { tool }
    }
}

#[async_trait]
impl TapeSorter for HpssTapeSorter {
    async fn sort(&self, list_file: &Path) -> Result<Vec<String>> {
        let mut args = self.tool.args.clone();
        args.push(list_file.to_string_lossy().into_owned());
        let output = exec::run_checked(&self.tool.program, &args, None, self.tool.timeout()).await?;
        Ok(parse_sorted(&output.stdout))
    }
}

/// Non-empty trimmed lines, in order
pub fn parse_sorted(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sorted() {
        assert_eq!(parse_sorted("/b.tar\n\n /a.tar \n"), vec!["/b.tar", "/a.tar"]);
    }

    #[tokio::test]
    async fn test_sorter_runs_program_with_list_file() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("orderMe.txt");
        std::fs::write(&list, "/a.tar\n/b.tar\n").unwrap();

        // `tac` reverses its input, standing in for the site script
        let sorter = HpssTapeSorter::new(ToolConfig::new("tac", &[], 5));
        let sorted = sorter.sort(&list).await.unwrap();
        assert_eq!(sorted, vec!["/b.tar", "/a.tar"]);
    }
}
