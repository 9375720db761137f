//! Manifest matching - reconciles decoded payloads with the expected codes
//!
//! Matching is exact after normalization (trim, lowercase). When two
//! manifest entries normalize to the same key, the first one is the
//! canonical spelling reported for that key.

use crate::domain::manifest::ShipmentManifest;
use crate::domain::types::MatchMethod;
use rustc_hash::{FxHashMap, FxHashSet};

/// Normalized form used for lookups
pub fn normalize(code: &str) -> String {
    code.trim().to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// Manifest spelling of the matched code
    pub canonical: Option<String>,
    /// 100 for an exact match, 0 otherwise
    pub score: u8,
    pub method: MatchMethod,
}

impl MatchResult {
    fn none() -> Self {
        Self { canonical: None, score: 0, method: MatchMethod::None }
    }
}

/// Lookup table built once per session
#[derive(Debug, Clone, Default)]
pub struct ManifestMatcher {
    lut: FxHashMap<String, String>,
}

impl ManifestMatcher {
    pub fn new(manifest: &ShipmentManifest) -> Self {
        let mut lut = FxHashMap::default();
        for code in manifest.codes() {
            let key = normalize(code);
            if !key.is_empty() {
                lut.entry(key).or_insert_with(|| code.clone());
            }
        }
        Self { lut }
    }

    /// Match a decoded payload against the manifest
    pub fn lookup(&self, decoded: &str) -> MatchResult {
        let key = normalize(decoded);
        if key.is_empty() {
            return MatchResult::none();
        }
        match self.lut.get(&key) {
            Some(canonical) => MatchResult {
                canonical: Some(canonical.clone()),
                score: 100,
                method: MatchMethod::Exact,
            },
            None => MatchResult::none(),
        }
    }

    /// Number of distinct normalized codes that must be found
    pub fn expected(&self) -> usize {
        self.lut.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lut.is_empty()
    }
}

/// Codes found so far in one session, keyed by normalized form
#[derive(Debug, Clone, Default)]
pub struct MatchState {
    found: FxHashSet<String>,
}

impl MatchState {
    /// Record a matched canonical code. Returns false if it was already found.
    pub fn insert(&mut self, canonical: &str) -> bool {
        self.found.insert(normalize(canonical))
    }

    pub fn contains(&self, canonical: &str) -> bool {
        self.found.contains(&normalize(canonical))
    }

    pub fn len(&self) -> usize {
        self.found.len()
    }

    pub fn is_empty(&self) -> bool {
        self.found.is_empty()
    }

    /// Every expected code has been found. An empty manifest never completes.
    pub fn is_complete(&self, matcher: &ManifestMatcher) -> bool {
        !matcher.is_empty() && self.found.len() >= matcher.expected()
    }
}
