use super::default_description;
use crate::random::RandomByteSource;
use serde::{Deserialize, Serialize};

/// How the bytes of a single [`PatchChange`] are produced.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ReplacementRule {
    /// Fixed replacement bytes written starting at the change offset.
    Bytes { replacement: Vec<u8> },
    /// `count` bytes drawn from `[from, to]` every time the change is applied.
    Random { count: u16, from: u8, to: u8 },
}

/// A single offset-addressed replacement.
///
/// A replacement longer than one byte overwrites the bytes that follow the offset;
/// the stream length never changes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PatchChange {
    pub offset: u64,
    #[serde(flatten)]
    pub rule: ReplacementRule,
}

impl PatchChange {
    pub fn bytes(offset: u64, replacement: impl Into<Vec<u8>>) -> Self {
        Self {
            offset,
            rule: ReplacementRule::Bytes {
                replacement: replacement.into(),
            },
        }
    }

    pub fn random(offset: u64, count: u16, from: u8, to: u8) -> Self {
        Self {
            offset,
            rule: ReplacementRule::Random { count, from, to },
        }
    }

    /// Produces the bytes this change writes for one application.
    pub fn materialize(&self, rng: &mut RandomByteSource) -> Vec<u8> {
        match &self.rule {
            ReplacementRule::Bytes { replacement } => replacement.clone(),
            ReplacementRule::Random { count, from, to } => {
                let count = usize::from(*count);
                let mut bytes = vec![0u8; count];
                rng.fill(&mut bytes, 0, count, |r| r.next(*from, *to));
                bytes
            }
        }
    }
}

/// An explicit list of offset replacements.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PatchConfig {
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default)]
    pub changes: Vec<PatchChange>,
}

impl PatchConfig {
    pub fn new(description: impl Into<String>, changes: Vec<PatchChange>) -> Self {
        Self {
            description: description.into(),
            changes,
        }
    }

    /// Returns the first change registered for `offset`.
    ///
    /// Later entries sharing the same offset are never returned. `elapsed_secs` is
    /// accepted for parity with the randomized variant and ignored.
    pub fn get(&self, offset: u64, _elapsed_secs: u64) -> Option<&PatchChange> {
        self.changes.iter().find(|change| change.offset == offset)
    }
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            description: default_description(),
            changes: Vec::new(),
        }
    }
}
