//! Core type definitions for SDMS
//!
//! Target classes and stage targets are closed enums; string names only
//! appear at the parse boundary (staging requests, config, CLI).

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Class of payload files. Every class owns its own set of archive and
/// cache collections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetClass {
    #[serde(rename = "picoDst")]
    PicoDst,
    #[serde(rename = "picoDstJet")]
    PicoDstJet,
    #[serde(rename = "aschmah")]
    Aschmah,
}

impl TargetClass {
    /// All known target classes
    pub const ALL: [Self; 3] = [Self::PicoDst, Self::PicoDstJet, Self::Aschmah];

    /// Canonical name as used in staging requests and stored records
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PicoDst => "picoDst",
            Self::PicoDstJet => "picoDstJet",
            Self::Aschmah => "aschmah",
        }
    }

    /// Base name of the collections holding this class
    #[must_use]
    pub const fn collection_base(self) -> &'static str {
        match self {
            Self::PicoDst => "PicoDsts",
            Self::PicoDstJet => "PicoDstsJets",
            Self::Aschmah => "ASchmah",
        }
    }

    /// File name suffix of payload files of this class (e.g. `.picoDst.root`)
    #[must_use]
    pub fn payload_suffix(self) -> String {
        format!(".{}.root", self.as_str())
    }
}

impl fmt::Display for TargetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetClass {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownTarget(s.to_string()))
    }
}

/// Fast tier a file can be staged into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageTarget {
    #[serde(rename = "XRD")]
    Xrd,
}

impl StageTarget {
    /// All known stage targets
    pub const ALL: [Self; 1] = [Self::Xrd];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Xrd => "XRD",
        }
    }

    /// Name of the staging marker field on archive items
    #[must_use]
    pub fn marker_field(self) -> String {
        format!("stageMarker{}", self.as_str())
    }
}

impl fmt::Display for StageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageTarget {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownStageTarget(s.to_string()))
    }
}

/// Strongly-typed map with one slot per target class.
///
/// Used instead of string-keyed dictionaries so that a missing target is a
/// compile error rather than a runtime lookup failure.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetMap<T> {
    #[serde(rename = "picoDst")]
    pub pico_dst: T,
    #[serde(rename = "picoDstJet")]
    pub pico_dst_jet: T,
    #[serde(rename = "aschmah")]
    pub aschmah: T,
}

impl<T> TargetMap<T> {
    /// Build a map by evaluating `f` for every target class
    pub fn from_fn(mut f: impl FnMut(TargetClass) -> T) -> Self {
        Self {
            pico_dst: f(TargetClass::PicoDst),
            pico_dst_jet: f(TargetClass::PicoDstJet),
            aschmah: f(TargetClass::Aschmah),
        }
    }

    #[must_use]
    pub const fn get(&self, target: TargetClass) -> &T {
        match target {
            TargetClass::PicoDst => &self.pico_dst,
            TargetClass::PicoDstJet => &self.pico_dst_jet,
            TargetClass::Aschmah => &self.aschmah,
        }
    }

    pub fn get_mut(&mut self, target: TargetClass) -> &mut T {
        match target {
            TargetClass::PicoDst => &mut self.pico_dst,
            TargetClass::PicoDstJet => &mut self.pico_dst_jet,
            TargetClass::Aschmah => &mut self.aschmah,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (TargetClass, &T)> {
        TargetClass::ALL.into_iter().map(move |t| (t, self.get(t)))
    }
}

/// Name of a cache node (short host name)
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct NodeName(String);

impl NodeName {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Short form of a fully qualified host name (`node.domain` -> `node`)
    #[must_use]
    pub fn from_fqdn(fqdn: &str) -> Self {
        Self(fqdn.split('.').next().unwrap_or(fqdn).to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeName({:?})", self.0)
    }
}

impl From<&str> for NodeName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Node-scoped identifier for observation records: `<node>_<path>`
#[must_use]
pub fn node_file_key(node: &NodeName, logical_path: &str) -> String {
    format!("{}_{}", node.as_str(), logical_path)
}

/// Kind of a physical object on tape
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKind {
    /// Archive container holding many members
    Container,
    /// Container index file
    Index,
    /// Standalone payload file
    Payload,
    Other,
}

impl FileKind {
    /// Classify a file name by extension
    #[must_use]
    pub fn classify(file_name: &str, payload_suffix: &str) -> Self {
        if file_name.ends_with(".tar") {
            Self::Container
        } else if file_name.ends_with(".idx") {
            Self::Index
        } else if file_name.ends_with(payload_suffix) {
            Self::Payload
        } else {
            Self::Other
        }
    }
}

/// Archive-side staging status (Stage-From-Archive Jobs and the archive
/// track of Stage-To-Cache Jobs)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveStatus {
    Unstaged,
    Staging,
    Staged,
    Failed,
}

impl ArchiveStatus {
    /// Whether the transition `self -> next` is allowed.
    ///
    /// Forward moves only; `Staging -> Unstaged` is reserved for the
    /// staging-timeout rollback and must be requested through
    /// [`ArchiveStatus::rollback`].
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unstaged, Self::Staging)
                | (Self::Staging | Self::Unstaged, Self::Staged | Self::Failed)
        )
    }

    /// Timeout-driven rollback. Only a job stuck in `Staging` moves.
    #[must_use]
    pub const fn rollback(self) -> Self {
        match self {
            Self::Staging => Self::Unstaged,
            other => other,
        }
    }
}

/// Cache-side delivery status of a Stage-To-Cache Job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Unstaged,
    Staging,
    Staged,
    Failed,
    /// Needs a human; excluded from automatic retry
    Investigate,
}

/// Failure class of a remote copy attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    AlreadyExists,
    NoSpace,
    NoSuchPath,
    Timeout,
    Unknown,
    /// Archive-side retrieval failed, the file never reached scratch
    Retrieval,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AlreadyExists => "already-exists",
            Self::NoSpace => "no-space",
            Self::NoSuchPath => "no-such-path",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
            Self::Retrieval => "retrieval",
        };
        f.write_str(s)
    }
}

/// Typed catalog attribute value parsed from a path token
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl AttrValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Equality against a JSON scalar as found in staging requests.
    /// A JSON array matches when any of its elements matches.
    #[must_use]
    pub fn matches_json(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match (self, value) {
            (_, Value::Array(items)) => items.iter().any(|v| self.matches_json(v)),
            (Self::Str(s), Value::String(v)) => s == v,
            (Self::Int(i), Value::Number(n)) => n.as_i64() == Some(*i),
            #[allow(clippy::float_cmp)]
            (Self::Float(f), Value::Number(n)) => n.as_f64() == Some(*f),
            _ => false,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Structured attribute set parsed from a logical path
pub type Details = BTreeMap<String, AttrValue>;
