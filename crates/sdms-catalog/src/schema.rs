//! Catalog path schema and Archive Item construction
//!
//! A payload path looks like
//! `.../Run10/AuAu/11GeV/all/P10ih/149/11149081/st_physics_adc_11149081_raw_2520001.picoDst.root`.
//! Everything from the run-year segment on is the logical path; its
//! segments map to catalog attributes according to the schema variant
//! selected by the segment count.

use regex::Regex;
use sdms_common::{AttrValue, Details, Error, Result, StageTarget, TargetClass};
use sdms_meta_store::ArchiveItem;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::warn;

/// Stream and sub-type of file names that do not follow the convention
pub const UNKNOWN: &str = "unknown";

/// `_<digits>` tokens inside a file name
static NUMBER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_(\d+)").expect("number token regex is valid"));

/// Day numbers never exceed this; larger integers are run numbers
const MAX_DAY: i64 = 370;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FieldType {
    Str,
    Int,
}

type Field = (&'static str, FieldType);

const DEFAULT_FIELDS: &[Field] = &[
    ("runyear", FieldType::Str),
    ("system", FieldType::Str),
    ("energy", FieldType::Str),
    ("trigger", FieldType::Str),
    ("production", FieldType::Str),
    ("day", FieldType::Int),
    ("runnumber", FieldType::Int),
];

/// Productions without a production-tag folder
const NO_PRODUCTION_FIELDS: &[Field] = &[
    ("runyear", FieldType::Str),
    ("system", FieldType::Str),
    ("energy", FieldType::Str),
    ("trigger", FieldType::Str),
    ("day", FieldType::Int),
    ("runnumber", FieldType::Int),
];

/// Directory schema variant of a logical path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathSchema {
    /// `runyear/system/energy/trigger/production/day/runnumber/file`
    V8,
    /// `runyear/system/energy/trigger/day/runnumber/file`
    V7,
    /// Anything else; parsed with the default attribute names
    Unknown,
}

impl PathSchema {
    /// Select the variant for the `/`-separated segments of a logical path
    pub fn detect(segments: &[&str]) -> Self {
        match segments.len() {
            8 => Self::V8,
            7 if day_index(segments) == Some(4) && segments[2].contains("GeV") => Self::V7,
            _ => Self::Unknown,
        }
    }

    fn fields(self) -> &'static [Field] {
        match self {
            Self::V8 | Self::Unknown => DEFAULT_FIELDS,
            Self::V7 => NO_PRODUCTION_FIELDS,
        }
    }
}

/// Index of the first segment that reads as a day number
fn day_index(segments: &[&str]) -> Option<usize> {
    segments
        .iter()
        .position(|s| s.parse::<i64>().is_ok_and(|n| n <= MAX_DAY))
}

fn coerce(name: &str, ty: FieldType, raw: &str) -> Result<AttrValue> {
    let parse_err = || Error::PathParse(format!("attribute {name}={raw:?} is not of the expected type"));
    Ok(match ty {
        FieldType::Str => AttrValue::Str(raw.to_string()),
        FieldType::Int => AttrValue::Int(raw.parse().map_err(|_| parse_err())?),
    })
}

/// Builds Archive Items from absolute archive paths
#[derive(Debug, Clone)]
pub struct ItemBuilder {
    target: TargetClass,
    root_marker: String,
    suffix: String,
}

impl ItemBuilder {
    pub fn new(target: TargetClass, root_marker: impl Into<String>) -> Self {
        Self {
            target,
            root_marker: root_marker.into(),
            suffix: target.payload_suffix(),
        }
    }

    /// Payload file name suffix of the builder's target class
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Build an item for the payload at `full_path`. `container` is the
    /// enclosing container's absolute path for container members.
    pub fn build(&self, full_path: &str, size: u64, container: Option<&str>) -> Result<ArchiveItem> {
        let start = full_path
            .find(&self.root_marker)
            .ok_or_else(|| Error::PathParse(format!("no {} segment in {full_path}", self.root_marker)))?;
        let mut path = full_path[start + 1..].to_string();
        let segments: Vec<&str> = full_path[start + 1..].split('/').collect();

        let schema = PathSchema::detect(&segments);
        if schema == PathSchema::Unknown {
            warn!("Unknown path schema, using default: {}", path);
        }

        let mut details = Details::new();
        for (&(name, ty), raw) in schema.fields().iter().zip(&segments) {
            details.insert(name.to_string(), coerce(name, ty, raw)?);
        }

        let mut is_backup = false;
        let runyear = details
            .get("runyear")
            .and_then(AttrValue::as_str)
            .ok_or_else(|| Error::PathParse(format!("no run year in {full_path}")))?
            .to_string();
        if let Some((year, variant)) = runyear.split_once('.') {
            path = path.replace(&format!(".{variant}"), "");
            details.insert("runyear".to_string(), AttrValue::Str(year.to_string()));
            is_backup = true;
        }

        let file_name = segments.last().copied().unwrap_or_default();
        let runnumber = details
            .get("runnumber")
            .map(ToString::to_string)
            .unwrap_or_default();
        let (stream, sub_type) = self.split_file_name(file_name, &runnumber).unwrap_or_else(|| {
            warn!("File name does not follow the stream convention: {}", file_name);
            (UNKNOWN.to_string(), UNKNOWN.to_string())
        });
        details.insert("stream".to_string(), AttrValue::Str(stream));
        details.insert("picoType".to_string(), AttrValue::Str(sub_type));

        Ok(ArchiveItem {
            path,
            full_path: full_path.to_string(),
            size,
            target: self.target,
            details,
            container: container.map(ToString::to_string),
            staging: StageTarget::ALL.iter().map(|&t| (t, false)).collect::<BTreeMap<_, _>>(),
            is_backup,
        })
    }

    /// `<stream>_<runnumber>_<subtype>_<seq><suffix>` -> (stream, subtype)
    fn split_file_name(&self, file_name: &str, runnumber: &str) -> Option<(String, String)> {
        let token = NUMBER_TOKEN
            .captures_iter(file_name)
            .filter(|caps| caps.get(1).is_some_and(|digits| digits.as_str() == runnumber))
            .filter_map(|caps| caps.get(0))
            .filter(|token| file_name[..token.start()].starts_with("st_"))
            .last()?;
        let stream = file_name[..token.start()].to_string();
        let rest = &file_name[token.end()..];

        let end = rest.len().saturating_sub(self.suffix.len());
        let stripped = rest.get(1..end).unwrap_or_default();
        let parts: Vec<&str> = stripped.split('_').collect();
        let sub_type = if parts.len() == 2 { parts[0] } else { stripped };
        Some((stream, sub_type.to_string()))
    }
}
