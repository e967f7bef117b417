//! Operator staging requests
//!
//! ```json
//! {"sets": [{"target": "picoDst", "stageTarget": "XRD", "runyear": "Run10"}], "nCopies": 1}
//! ```
//!
//! Every set names a target class, a stage target and any number of
//! catalog attribute filters. An attribute may be given bare (`runyear`) or
//! namespaced (`starDetails.runyear`); array values match any element.

use sdms_common::{Error, Result, StageTarget, TargetClass};
use sdms_meta_store::ArchiveItem;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

/// Prefix of catalog attribute paths on archive items
pub const DETAILS_PREFIX: &str = "starDetails.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRequest {
    sets: Option<Vec<Map<String, Value>>>,
    n_copies: Option<u32>,
}

/// One validated query set
#[derive(Debug, Clone, PartialEq)]
pub struct StageSet {
    pub target: TargetClass,
    pub stage_target: StageTarget,
    /// Attribute name (without namespace) -> accepted value(s)
    pub filters: BTreeMap<String, Value>,
}

impl StageSet {
    pub fn matches(&self, item: &ArchiveItem) -> bool {
        item.target == self.target
            && self
                .filters
                .iter()
                .all(|(name, value)| item.detail(name).is_some_and(|v| v.matches_json(value)))
    }
}

/// A parsed staging request
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRequest {
    pub sets: Vec<StageSet>,
    /// Number of cache copies wanted per file
    pub n_copies: u32,
    /// Sets dropped during validation
    pub rejected: usize,
}

impl StagingRequest {
    pub fn from_file(path: &Path, rules: &RequestRules<'_>) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidRequest(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text, rules)
    }

    /// Parse and validate a request. A missing `sets` list fails the whole
    /// request; an invalid set is logged and dropped.
    pub fn parse(json: &str, rules: &RequestRules<'_>) -> Result<Self> {
        let raw: RawRequest =
            serde_json::from_str(json).map_err(|e| Error::InvalidRequest(e.to_string()))?;
        let raw_sets = raw
            .sets
            .ok_or_else(|| Error::InvalidRequest("no \"sets\" found".to_string()))?;

        let mut sets = Vec::with_capacity(raw_sets.len());
        let mut rejected = 0;
        for raw_set in raw_sets {
            match rules.validate(raw_set) {
                Ok(set) => sets.push(set),
                Err(e) => {
                    warn!("Dropping staging set: {}", e);
                    rejected += 1;
                }
            }
        }

        Ok(Self {
            sets,
            n_copies: raw.n_copies.unwrap_or(1).max(1),
            rejected,
        })
    }
}

/// Names accepted in staging requests
#[derive(Debug, Clone, Copy)]
pub struct RequestRules<'a> {
    pub targets: &'a [TargetClass],
    pub stage_targets: &'a [StageTarget],
    pub query_items: &'a [String],
}

impl RequestRules<'_> {
    fn validate(&self, mut raw: Map<String, Value>) -> Result<StageSet> {
        let stage_target: StageTarget = take_name(&mut raw, "stageTarget")?.parse()?;
        if !self.stage_targets.contains(&stage_target) {
            return Err(Error::UnknownStageTarget(stage_target.to_string()));
        }
        let target: TargetClass = take_name(&mut raw, "target")?.parse()?;
        if !self.targets.contains(&target) {
            return Err(Error::UnknownTarget(target.to_string()));
        }

        let mut filters = BTreeMap::new();
        for (key, value) in raw {
            let name = key.strip_prefix(DETAILS_PREFIX).unwrap_or(&key);
            if !self.query_items.iter().any(|q| q == name) {
                return Err(Error::InvalidRequest(format!(
                    "query item does not exist: {key}"
                )));
            }
            filters.insert(name.to_string(), value);
        }

        Ok(StageSet {
            target,
            stage_target,
            filters,
        })
    }
}

fn take_name(raw: &mut Map<String, Value>, field: &str) -> Result<String> {
    match raw.remove(field) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(Error::InvalidRequest(format!("\"{field}\" is not a string: {other}"))),
        None => Err(Error::InvalidRequest(format!("no \"{field}\" found in set"))),
    }
}
