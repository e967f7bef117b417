//! Tape archive access: namespace listing, container inventory, retrieval
//!
//! The listing tool prints `ls -lR` style blocks: a header line naming the
//! directory (trailing `:`), one line per entry, a blank line closing the
//! block. The container tool prints one line per member and sentinel lines
//! for success and a missing index.

use crate::exec::{self, clean_line};
use async_trait::async_trait;
use sdms_common::config::{ArchiveConfig, ToolConfig};
use sdms_common::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CONTAINER_SUCCESS: &str = "HTAR: HTAR SUCCESSFUL";

/// A file found by the recursive listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Absolute path
    pub path: String,
    pub size: u64,
}

/// A member of a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMember {
    /// Path of the member as stored in the container
    pub path: String,
    pub size: u64,
}

/// Operations on the tape archive
#[async_trait]
pub trait ArchiveTool: Send + Sync {
    /// Immediate subfolders of `folder` (absolute paths)
    async fn list_subfolders(&self, folder: &str) -> Result<Vec<String>>;

    /// All files below `subfolder`, recursively
    async fn list_files(&self, subfolder: &str) -> Result<Vec<ArchiveEntry>>;

    /// Member inventory of a container
    async fn list_container(&self, container: &str) -> Result<Vec<ContainerMember>>;

    /// Extract every member of `container` below `dest`
    async fn extract_container(&self, container: &str, dest: &Path) -> Result<()>;

    /// Extract a single member of `container` below `dest`
    async fn extract_member(&self, container: &str, member: &str, dest: &Path) -> Result<()>;

    /// Retrieve one standalone file to its mirrored location below `dest`
    async fn extract_file(&self, path: &str, dest: &Path) -> Result<()>;

    /// Whether a transfer into the archive is currently running
    async fn transfer_in_progress(&self) -> Result<bool>;
}

/// Location of an archive path once retrieved below `dest`
pub fn extracted_path(dest: &Path, archive_path: &str) -> PathBuf {
    dest.join(archive_path.trim_start_matches('/'))
}

/// Subfolder names from a one-per-line listing, keeping those containing
/// `marker`
pub fn parse_subfolders<'a>(lines: impl IntoIterator<Item = &'a str>, marker: &str) -> Vec<String> {
    lines
        .into_iter()
        .map(clean_line)
        .filter(|line| !line.is_empty() && line.contains(marker))
        .collect()
}

/// Parser state threaded through the listing fold
#[derive(Debug, Default)]
struct ListingState {
    block: Option<String>,
    entries: Vec<ArchiveEntry>,
}

impl ListingState {
    fn step(mut self, subfolder: &str, raw: &str) -> Self {
        let line = clean_line(raw);
        if line.starts_with(subfolder) {
            self.block = Some(line.trim_end_matches(':').to_string());
        } else if line.is_empty() {
            self.block = None;
        } else if let Some(block) = &self.block {
            if !line.starts_with('d') {
                match parse_entry(block, &line) {
                    Some(entry) => self.entries.push(entry),
                    None => warn!("Skipping unparsable listing line in {}: {}", block, line),
                }
            }
        }
        self
    }
}

fn parse_entry(block: &str, line: &str) -> Option<ArchiveEntry> {
    let tokens: Vec<&str> = line.splitn(9, ' ').collect();
    if tokens.len() < 9 {
        return None;
    }
    let size = tokens[4].parse().ok()?;
    Some(ArchiveEntry {
        path: format!("{block}/{}", tokens[8]),
        size,
    })
}

/// Parse a recursive listing of `subfolder` into file entries.
///
/// Lines outside a block and directory lines are ignored.
pub fn parse_listing<'a>(subfolder: &str, lines: impl IntoIterator<Item = &'a str>) -> Vec<ArchiveEntry> {
    lines
        .into_iter()
        .fold(ListingState::default(), |state, line| state.step(subfolder, line))
        .entries
}

/// Parse a container inventory. A missing index aborts the inventory.
pub fn parse_container_listing<'a>(
    container: &str,
    lines: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<ContainerMember>> {
    let missing_index = format!("ERROR: No such file: {container}.idx");
    let mut members = Vec::new();
    for raw in lines {
        let line = clean_line(raw);
        if line.is_empty() || line == CONTAINER_SUCCESS || line.starts_with("HTAR: d") {
            continue;
        }
        if line == missing_index {
            return Err(Error::tool("htar", format!("no index file for {container}")));
        }
        let tokens: Vec<&str> = line.splitn(7, ' ').collect();
        if tokens.len() < 7 {
            debug!("Skipping short container listing line: {}", line);
            continue;
        }
        match tokens[3].parse() {
            Ok(size) => members.push(ContainerMember {
                path: tokens[6].to_string(),
                size,
            }),
            Err(_) => debug!("Skipping container listing line without size: {}", line),
        }
    }
    Ok(members)
}

fn extraction_succeeded(output: &exec::CommandOutput) -> bool {
    output.cleaned_lines().iter().any(|l| l == CONTAINER_SUCCESS)
}

/// HPSS access through `hsi` and `htar`
#[derive(Debug, Clone)]
pub struct HpssArchive {
    listing: ToolConfig,
    container: ToolConfig,
    transfer_check: Option<ToolConfig>,
    transfer_marker: String,
}

impl HpssArchive {
    pub fn new(config: &ArchiveConfig) -> Self {
        Self {
            listing: config.listing.clone(),
            container: config.container.clone(),
            transfer_check: config.transfer_check.clone(),
            transfer_marker: config.transfer_marker.clone(),
        }
    }

    fn args(tool: &ToolConfig, extra: &[&str]) -> Vec<String> {
        tool.args
            .iter()
            .cloned()
            .chain(extra.iter().map(ToString::to_string))
            .collect()
    }

    async fn extract(&self, args: Vec<String>, dest: &Path, what: &str) -> Result<()> {
        tokio::fs::create_dir_all(dest).await?;
        let output = exec::run(
            &self.container.program,
            &args,
            Some(dest),
            self.container.timeout(),
        )
        .await?;
        if extraction_succeeded(&output) {
            Ok(())
        } else {
            Err(Error::tool(
                &self.container.program,
                format!("extraction of {what} failed: {}", output.combined().trim()),
            ))
        }
    }
}

#[async_trait]
impl ArchiveTool for HpssArchive {
    async fn list_subfolders(&self, folder: &str) -> Result<Vec<String>> {
        let args = Self::args(&self.listing, &["ls", "-1", folder]);
        let output =
            exec::run_checked(&self.listing.program, &args, None, self.listing.timeout()).await?;
        let combined = output.combined();
        Ok(parse_subfolders(combined.lines(), ""))
    }

    async fn list_files(&self, subfolder: &str) -> Result<Vec<ArchiveEntry>> {
        let args = Self::args(&self.listing, &["ls", "-lR", subfolder]);
        let output =
            exec::run_checked(&self.listing.program, &args, None, self.listing.timeout()).await?;
        let combined = output.combined();
        Ok(parse_listing(subfolder, combined.lines()))
    }

    async fn list_container(&self, container: &str) -> Result<Vec<ContainerMember>> {
        let args = Self::args(&self.container, &["-tf", container]);
        let output =
            exec::run(&self.container.program, &args, None, self.container.timeout()).await?;
        let combined = output.combined();
        let members = parse_container_listing(container, combined.lines())?;
        if !output.success {
            return Err(Error::tool(
                &self.container.program,
                format!("listing of {container} exited with {:?}", output.code),
            ));
        }
        Ok(members)
    }

    async fn extract_container(&self, container: &str, dest: &Path) -> Result<()> {
        let args = Self::args(&self.container, &["-xf", container]);
        self.extract(args, dest, container).await
    }

    async fn extract_member(&self, container: &str, member: &str, dest: &Path) -> Result<()> {
        let args = Self::args(&self.container, &["-xf", container, member]);
        self.extract(args, dest, member).await
    }

    async fn extract_file(&self, path: &str, dest: &Path) -> Result<()> {
        let local = extracted_path(dest, path);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let local = local.to_string_lossy().into_owned();
        let args = Self::args(&self.listing, &["get", &local, ":", path]);
        exec::run_checked(&self.listing.program, &args, None, self.listing.timeout()).await?;
        Ok(())
    }

    async fn transfer_in_progress(&self) -> Result<bool> {
        let Some(check) = &self.transfer_check else {
            return Ok(false);
        };
        let output = exec::run(&check.program, &check.args, None, check.timeout()).await?;
        Ok(output
            .cleaned_lines()
            .iter()
            .any(|line| line.contains(&self.transfer_marker)))
    }
}
