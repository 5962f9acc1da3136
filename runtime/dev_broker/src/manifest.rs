//! Hardware description manifests
//!
//! A manifest lists the GPIO lines a platform device exposes, in order, each
//! with a direction flag (0 = input, 1 = output):
//!
//! ```toml
//! compatible = "ase,plat_drv"
//!
//! [[gpios]]
//! line = 16
//! direction = 0
//!
//! [[gpios]]
//! line = 21
//! direction = 1
//! ```
//!
//! Entries are decoded one by one. A malformed entry is reported with its
//! index and skipped; its siblings keep their own indices, and a missing or
//! unknown direction is never replaced by a default.

use std::path::Path;

use serde::Deserialize;

use crate::line::{Direction, LineId};
use crate::{DriverError, Result};

/// One decoded manifest entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Position in the manifest; becomes the minor offset
    pub index: usize,
    pub line: LineId,
    pub direction: Direction,
}

/// Outcome of decoding every entry of a manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedManifest {
    pub compatible: Option<String>,
    /// Well-formed entries in manifest order
    pub entries: Vec<ManifestEntry>,
    /// One [`DriverError::ManifestParse`] per rejected entry
    pub errors: Vec<DriverError>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    compatible: Option<String>,
    #[serde(default)]
    gpios: Vec<toml::Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntry {
    line: i64,
    direction: i64,
}

/// An undecoded hardware description
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    compatible: Option<String>,
    gpios: Vec<toml::Value>,
}

impl Manifest {
    /// Read a manifest document
    ///
    /// Only the document structure is checked here; entries are decoded by
    /// [`parse`](Self::parse).
    ///
    /// # Errors
    /// [`DriverError::Manifest`] if the document is not valid TOML or has
    /// unexpected top-level keys
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: RawManifest = toml::from_str(text).map_err(|e| DriverError::Manifest(e.to_string()))?;
        Ok(Self {
            compatible: raw.compatible,
            gpios: raw.gpios,
        })
    }

    /// Read a manifest file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DriverError::Manifest(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Build a manifest from `(line, direction flag)` pairs
    pub fn from_entries(compatible: &str, entries: &[(LineId, u8)]) -> Self {
        let gpios = entries
            .iter()
            .map(|&(line, direction)| {
                let mut table = toml::map::Map::new();
                table.insert("line".into(), toml::Value::Integer(i64::from(line)));
                table.insert("direction".into(), toml::Value::Integer(i64::from(direction)));
                toml::Value::Table(table)
            })
            .collect();

        Self {
            compatible: Some(compatible.to_owned()),
            gpios,
        }
    }

    pub fn compatible(&self) -> Option<&str> {
        self.compatible.as_deref()
    }

    /// Number of entries, well-formed or not
    pub fn len(&self) -> usize {
        self.gpios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gpios.is_empty()
    }

    /// Decode every entry
    pub fn parse(&self) -> ParsedManifest {
        let mut entries = Vec::with_capacity(self.gpios.len());
        let mut errors = Vec::new();

        for (index, value) in self.gpios.iter().enumerate() {
            match decode_entry(index, value) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    log::warn!("manifest: {}", err);
                    errors.push(err);
                }
            }
        }

        log::debug!("manifest: {} of {} entries usable", entries.len(), self.gpios.len());
        ParsedManifest {
            compatible: self.compatible.clone(),
            entries,
            errors,
        }
    }
}

/// Decode every entry of `manifest`
pub fn parse(manifest: &Manifest) -> ParsedManifest {
    manifest.parse()
}

fn decode_entry(index: usize, value: &toml::Value) -> Result<ManifestEntry> {
    let fail = |reason: String| DriverError::ManifestParse { index, reason };

    let raw = RawEntry::deserialize(value.clone()).map_err(|e| fail(e.to_string()))?;
    let line = LineId::try_from(raw.line).map_err(|_| fail(format!("line {} out of range", raw.line)))?;
    let direction = Direction::from_flag(raw.direction).ok_or_else(|| {
        fail(format!(
            "direction flag {} is neither 0 (input) nor 1 (output)",
            raw.direction
        ))
    })?;

    Ok(ManifestEntry { index, line, direction })
}
