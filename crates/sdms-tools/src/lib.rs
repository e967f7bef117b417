//! External tool contracts for SDMS
//!
//! Every slow or unreliable collaborator (tape listing and extraction, the
//! tape-locality sorter, the remote copy tool, remote shell, free-space
//! queries) sits behind a trait. The production implementations shell out
//! through [`exec::run`], which always applies a timeout; the output parsers
//! are pure functions.

pub mod archive;
pub mod copy;
pub mod exec;
pub mod shell;
pub mod sorter;
pub mod space;

pub use archive::{ArchiveEntry, ArchiveTool, ContainerMember, HpssArchive, extracted_path};
pub use copy::{CopyOutcome, CopyTool, XrdCopy};
pub use exec::CommandOutput;
pub use shell::{RemoteShell, SshShell};
pub use sorter::{HpssTapeSorter, TapeSorter};
pub use space::{SpaceProbe, StatvfsProbe};
