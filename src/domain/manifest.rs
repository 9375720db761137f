//! Shipment manifest - the expected barcode payloads for one load
//!
//! Codes are unique as stored (case-sensitive). Order follows the source
//! text and has no bearing on matching.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest contains no readable barcodes")]
    Empty,
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Immutable, de-duplicated list of expected codes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShipmentManifest {
    codes: Vec<String>,
}

impl ShipmentManifest {
    /// Build from already-parsed codes. Blank entries are dropped and
    /// repeats keep their first occurrence.
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for code in codes {
            let code = code.as_ref().trim();
            if code.is_empty() {
                continue;
            }
            if seen.insert(code.to_string()) {
                unique.push(code.to_string());
            }
        }
        Self { codes: unique }
    }

    /// Parse manifest text: codes separated by whitespace and/or commas,
    /// any length, numeric or alphanumeric.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let manifest = Self::new(text.split(|c: char| c.is_whitespace() || c == ','));
        if manifest.is_empty() {
            return Err(ManifestError::Empty);
        }
        Ok(manifest)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|source| ManifestError::Io { path: path.display().to_string(), source })?;
        Self::parse(&text)
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_mixed_separators() {
        let manifest = ShipmentManifest::parse("A100, B200\nC300\t\tD400,,\n").unwrap();
        assert_eq!(manifest.codes(), &["A100", "B200", "C300", "D400"]);
    }

    #[test]
    fn test_parse_strips_bom_and_dedupes() {
        let manifest = ShipmentManifest::parse("\u{feff}0123 0456 0123 a100 A100").unwrap();
        // Identity is case-sensitive as stored
        assert_eq!(manifest.codes(), &["0123", "0456", "a100", "A100"]);
    }

    #[test]
    fn test_parse_empty_is_error() {
        assert!(matches!(ShipmentManifest::parse(" , \n "), Err(ManifestError::Empty)));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "X1\nX2").unwrap();
        let manifest = ShipmentManifest::from_file(file.path()).unwrap();
        assert_eq!(manifest.len(), 2);

        let missing = ShipmentManifest::from_file("/nonexistent/barcodes.txt");
        assert!(matches!(missing, Err(ManifestError::Io { .. })));
    }
}
