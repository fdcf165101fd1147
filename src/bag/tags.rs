//! Tag-file and manifest parsing.
//!
//! Tag files are plain text, one `Key: value` pair per line; lines
//! beginning with whitespace continue the previous value. Manifests are
//! `<hex digest> <relative path>` lines.

use crate::error::{CourierError, Result};
use std::fs;
use std::path::Path;

/// Required tag keys, by tag file. Values may be empty; keys may not be
/// missing.
pub const BAGIT_REQUIRED: &[&str] = &["BagIt-Version", "Tag-File-Character-Encoding"];

pub const BAG_INFO_REQUIRED: &[&str] = &[
    "Source-Organization",
    "Organization-Address",
    "Contact-Name",
    "Contact-Phone",
    "Contact-Email",
    "Bagging-Date",
    "Bag-Size",
    "Bag-Group-Identifier",
    "Bag-Count",
];

pub const DPN_INFO_REQUIRED: &[&str] = &[
    "DPN-Object-ID",
    "Local-ID",
    "Ingest-Node-Name",
    "Ingest-Node-Address",
    "Ingest-Node-Contact-Name",
    "Ingest-Node-Contact-Email",
    "Version-Number",
    "First-Version-Object-ID",
    "Rights-Object-ID",
    "Bag-Type",
];

/// One parsed `Key: value` pair. Keys can repeat within a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub label: String,
    pub value: String,
}

/// Parses a tag file, folding continuation lines into the prior value.
pub fn parse_tag_file(path: &Path) -> Result<Vec<Tag>> {
    let content = fs::read_to_string(path).map_err(|e| {
        CourierError::Validation(format!("cannot read tag file {}: {}", path.display(), e))
    })?;
    let mut tags: Vec<Tag> = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = tags.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim());
            }
            continue;
        }
        match line.split_once(':') {
            Some((label, value)) => tags.push(Tag {
                label: label.trim().to_string(),
                value: value.trim().to_string(),
            }),
            None => {
                return Err(CourierError::Validation(format!(
                    "malformed tag line in {}: {:?}",
                    path.display(),
                    line
                )))
            }
        }
    }
    Ok(tags)
}

/// Returns the required labels absent from `tags`.
pub fn missing_labels<'a>(tags: &[Tag], required: &[&'a str]) -> Vec<&'a str> {
    required
        .iter()
        .filter(|label| !tags.iter().any(|t| t.label == **label))
        .copied()
        .collect()
}

/// One `<digest> <path>` manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub digest: String,
    pub path: String,
}

/// Parses a checksum manifest.
pub fn parse_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    let content = fs::read_to_string(path).map_err(|e| {
        CourierError::Validation(format!("cannot read manifest {}: {}", path.display(), e))
    })?;
    let mut entries = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(char::is_whitespace) {
            Some((digest, rel)) => entries.push(ManifestEntry {
                digest: digest.to_lowercase(),
                path: rel.trim().to_string(),
            }),
            None => {
                return Err(CourierError::Validation(format!(
                    "malformed manifest line in {}: {:?}",
                    path.display(),
                    line
                )))
            }
        }
    }
    Ok(entries)
}
