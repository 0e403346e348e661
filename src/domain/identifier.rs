//! Identifier Codec
//!
//! Volume and snapshot identifiers handed to the platform are `#`-joined
//! field tuples. Fields are positional; new fields are only ever appended so
//! identifiers issued by older releases keep decoding.
//!
//! ```text
//! volume:   <endpoint>#<root>#<dataset>#<pv-name>#<archive-prefix>#<on-delete>
//! snapshot: <endpoint>#<root>#<dataset@snapshot>#<source-dataset>
//! ```

use super::ports::OnDeletePolicy;
use thiserror::Error;

pub const SEPARATOR: &str = "#";

const VOLUME_MIN_FIELDS: usize = 3;
const SNAPSHOT_MIN_FIELDS: usize = 4;

/// Why an identifier could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier {id:?} has {found} fields, at least {expected} required")]
    TooFewFields {
        id: String,
        found: usize,
        expected: usize,
    },

    #[error("identifier {id:?} has an empty {field}")]
    EmptyField { id: String, field: &'static str },
}

fn trim(field: &str) -> &str {
    field.trim_matches('/')
}

fn split(id: &str, expected: usize) -> Result<Vec<&str>, IdentifierError> {
    let fields: Vec<&str> = id.split(SEPARATOR).collect();
    if fields.len() < expected {
        return Err(IdentifierError::TooFewFields {
            id: id.to_string(),
            found: fields.len(),
            expected,
        });
    }
    Ok(fields)
}

fn required<'a>(id: &str, value: &'a str, field: &'static str) -> Result<&'a str, IdentifierError> {
    if value.is_empty() {
        Err(IdentifierError::EmptyField {
            id: id.to_string(),
            field,
        })
    } else {
        Ok(value)
    }
}

// =============================================================================
// Volume Handle
// =============================================================================

/// Decoded volume identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    /// Appliance WebSocket URL
    pub endpoint: String,
    /// Root dataset all volumes live under
    pub root: String,
    /// Fully-qualified dataset name
    pub dataset: String,
    /// Platform-assigned volume name
    pub pv_name: String,
    /// Prefix for archive datasets
    pub archive_prefix: String,
    /// Per-volume on-delete policy; `None` falls back to the driver default
    pub on_delete: Option<OnDeletePolicy>,
}

impl VolumeHandle {
    pub fn encode(&self) -> String {
        let on_delete = self.on_delete.map(|p| p.as_str()).unwrap_or_default();
        [
            trim(&self.endpoint),
            trim(&self.root),
            trim(&self.dataset),
            trim(&self.pv_name),
            trim(&self.archive_prefix),
            on_delete,
        ]
        .join(SEPARATOR)
    }

    /// Decode an identifier. Missing trailing fields decode as empty.
    pub fn decode(id: &str) -> Result<Self, IdentifierError> {
        let fields = split(id, VOLUME_MIN_FIELDS)?;
        let field = |i: usize| fields.get(i).copied().unwrap_or_default();

        Ok(Self {
            endpoint: required(id, field(0), "endpoint")?.to_string(),
            root: field(1).to_string(),
            dataset: required(id, field(2), "dataset")?.to_string(),
            pv_name: field(3).to_string(),
            archive_prefix: field(4).to_string(),
            on_delete: OnDeletePolicy::parse(field(5)),
        })
    }
}

impl std::fmt::Display for VolumeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

// =============================================================================
// Snapshot Handle
// =============================================================================

/// Decoded snapshot identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub endpoint: String,
    pub root: String,
    /// `dataset@snapshot`
    pub snapshot_name: String,
    pub source_dataset: String,
}

impl SnapshotHandle {
    pub fn encode(&self) -> String {
        [
            trim(&self.endpoint),
            trim(&self.root),
            trim(&self.snapshot_name),
            trim(&self.source_dataset),
        ]
        .join(SEPARATOR)
    }

    pub fn decode(id: &str) -> Result<Self, IdentifierError> {
        let fields = split(id, SNAPSHOT_MIN_FIELDS)?;

        Ok(Self {
            endpoint: required(id, fields[0], "endpoint")?.to_string(),
            root: fields[1].to_string(),
            snapshot_name: required(id, fields[2], "snapshot name")?.to_string(),
            source_dataset: fields[3].to_string(),
        })
    }

    /// Split `dataset@snapshot` into its two halves
    pub fn parts(&self) -> Option<(&str, &str)> {
        self.snapshot_name
            .split_once('@')
            .filter(|(ds, snap)| !ds.is_empty() && !snap.is_empty())
    }
}

impl std::fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}
