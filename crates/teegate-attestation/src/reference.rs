//! Reference measurements: the known-good values a record is compared against.
//!
//! Entries are keyed by a [`PresetId`] (architecture + build version) and loaded
//! from configuration rather than compiled in, so new enclave builds can be
//! admitted without touching the validator.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AttestationError, Result};
use crate::record::Measurements;
use crate::validator::is_measurement_hex;

/// Identifies one enclave build: architecture plus build version, written `arch/version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PresetId {
    /// CPU architecture, e.g. `arm64`.
    pub arch: String,
    /// Build version, e.g. `v1.0.0`.
    pub version: String,
}

impl PresetId {
    /// Create a preset id.
    #[must_use]
    pub fn new(arch: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            arch: arch.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PresetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.arch, self.version)
    }
}

impl FromStr for PresetId {
    type Err = AttestationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((arch, version)) if !arch.is_empty() && !version.is_empty() => {
                Ok(Self::new(arch, version))
            }
            _ => Err(AttestationError::Config(format!(
                "invalid preset '{s}': expected 'arch/version'"
            ))),
        }
    }
}

/// The expected measurements for one preset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedMeasurements {
    preset: PresetId,
    measurements: Measurements,
}

impl ExpectedMeasurements {
    /// Build an entry, checking that every reference value is a 64-hex digest.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::Config` if the map is empty or a value is malformed.
    pub fn new(preset: PresetId, measurements: Measurements) -> Result<Self> {
        if measurements.is_empty() {
            return Err(AttestationError::Config(format!(
                "preset {preset} has no measurements"
            )));
        }
        let mut normalized = Measurements::new();
        for (name, value) in measurements {
            if !is_measurement_hex(&value) {
                return Err(AttestationError::Config(format!(
                    "preset {preset}: reference value for '{name}' is not a 64-character hex digest"
                )));
            }
            normalized.insert(name.to_ascii_lowercase(), value.to_ascii_lowercase());
        }
        Ok(Self {
            preset,
            measurements: normalized,
        })
    }

    /// The preset this entry belongs to.
    #[must_use]
    pub const fn preset(&self) -> &PresetId {
        &self.preset
    }

    /// Expected register values, lower-cased.
    #[must_use]
    pub const fn measurements(&self) -> &Measurements {
        &self.measurements
    }
}

/// Read-only lookup of reference measurements at validation time.
pub trait ReferenceMeasurementStore: Send + Sync {
    /// Expected measurements for `preset`, if known.
    fn expected(&self, preset: &PresetId) -> Option<ExpectedMeasurements>;

    /// All known presets.
    fn presets(&self) -> Vec<PresetId>;
}

impl<T: ReferenceMeasurementStore + ?Sized> ReferenceMeasurementStore for Arc<T> {
    fn expected(&self, preset: &PresetId) -> Option<ExpectedMeasurements> {
        (**self).expected(preset)
    }

    fn presets(&self) -> Vec<PresetId> {
        (**self).presets()
    }
}

#[derive(Debug, Deserialize)]
struct ReferenceFile {
    #[serde(default, rename = "preset")]
    presets: Vec<PresetEntry>,
}

#[derive(Debug, Deserialize)]
struct PresetEntry {
    arch: String,
    version: String,
    measurements: Measurements,
}

/// Reference store held in memory, populated from a TOML file or programmatically.
#[derive(Debug, Clone, Default)]
pub struct InMemoryReferenceStore {
    entries: HashMap<PresetId, ExpectedMeasurements>,
}

impl InMemoryReferenceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a preset.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::Config` if the preset already exists.
    pub fn insert(&mut self, entry: ExpectedMeasurements) -> Result<()> {
        if self.entries.contains_key(entry.preset()) {
            return Err(AttestationError::Config(format!(
                "duplicate preset {}",
                entry.preset()
            )));
        }
        self.entries.insert(entry.preset().clone(), entry);
        Ok(())
    }

    /// Parse `[[preset]]` tables from TOML.
    ///
    /// ```toml
    /// [[preset]]
    /// arch = "arm64"
    /// version = "v1.0.0"
    /// [preset.measurements]
    /// pcr0 = "0d8c...7220"
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::Config` on invalid TOML, malformed values or duplicates.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: ReferenceFile = toml::from_str(content)
            .map_err(|e| AttestationError::Config(format!("invalid reference TOML: {e}")))?;
        let mut store = Self::new();
        for entry in file.presets {
            let preset = PresetId::new(entry.arch, entry.version);
            store.insert(ExpectedMeasurements::new(preset, entry.measurements)?)?;
        }
        debug!(count = store.len(), "loaded reference presets");
        Ok(store)
    }

    /// Load a reference file from disk.
    ///
    /// # Errors
    ///
    /// Returns `AttestationError::Io` if unreadable, otherwise as [`Self::from_toml`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AttestationError::Io(format!(
                "failed to read reference file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Number of presets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store has no presets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ReferenceMeasurementStore for InMemoryReferenceStore {
    fn expected(&self, preset: &PresetId) -> Option<ExpectedMeasurements> {
        self.entries.get(preset).cloned()
    }

    fn presets(&self) -> Vec<PresetId> {
        let mut presets: Vec<_> = self.entries.keys().cloned().collect();
        presets.sort();
        presets
    }
}
