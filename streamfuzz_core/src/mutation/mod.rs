//! Mutation strategies and their on-disk representation.
//!
//! A [`FuzzingConfig`] decides, offset by offset, whether a byte of the seed
//! stream is replaced. Configurations are stored as JSON documents tagged with
//! their `type`; the file extension tells the importer which type to expect.

mod patch;
mod randomized;

pub use patch::{PatchChange, PatchConfig, ReplacementRule};
pub use randomized::{MutationConfig, MutationRule};

use crate::random::RandomByteSource;
use crate::stream::FuzzingStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub(crate) fn default_description() -> String {
    "Unnamed".to_string()
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read mutation config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed mutation config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unrecognized mutation config extension for {0:?}")]
    UnknownExtension(PathBuf),

    #[error("Expected a {expected} config but the document describes a {found} config")]
    KindMismatch { expected: ConfigKind, found: ConfigKind },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    Patch,
    Mutation,
}

impl ConfigKind {
    /// File extension (without the dot) used for configs of this kind.
    pub fn extension(&self) -> &'static str {
        match self {
            ConfigKind::Patch => "fpatch",
            ConfigKind::Mutation => "fmut",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        [ConfigKind::Patch, ConfigKind::Mutation]
            .into_iter()
            .find(|kind| kind.extension() == extension)
    }
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigKind::Patch => f.write_str("Patch"),
            ConfigKind::Mutation => f.write_str("Mutation"),
        }
    }
}

/// A registered mutation strategy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum FuzzingConfig {
    Patch(PatchConfig),
    Mutation(MutationConfig),
}

impl FuzzingConfig {
    pub fn kind(&self) -> ConfigKind {
        match self {
            FuzzingConfig::Patch(_) => ConfigKind::Patch,
            FuzzingConfig::Mutation(_) => ConfigKind::Mutation,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            FuzzingConfig::Patch(config) => &config.description,
            FuzzingConfig::Mutation(config) => &config.description,
        }
    }

    /// Returns the change to apply at `offset`, if any.
    pub fn get(
        &self,
        offset: u64,
        elapsed_secs: u64,
        rng: &mut RandomByteSource,
    ) -> Option<PatchChange> {
        match self {
            FuzzingConfig::Patch(config) => config.get(offset, elapsed_secs).cloned(),
            FuzzingConfig::Mutation(config) => config.get(offset, elapsed_secs, rng),
        }
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a config file, resolving the expected kind from its extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let expected = ConfigKind::from_path(path)
            .ok_or_else(|| ConfigError::UnknownExtension(path.to_path_buf()))?;
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&json)?;
        if config.kind() != expected {
            return Err(ConfigError::KindMismatch {
                expected,
                found: config.kind(),
            });
        }
        Ok(config)
    }

    /// Wraps `original` in a stream that applies this config lazily at read time.
    pub fn create_stream<R: Read>(
        self: &Arc<Self>,
        original: R,
        sample_id: impl Into<String>,
        rng: RandomByteSource,
    ) -> FuzzingStream<R> {
        FuzzingStream::new(original, Arc::clone(self), sample_id, rng)
    }
}

impl From<PatchConfig> for FuzzingConfig {
    fn from(config: PatchConfig) -> Self {
        FuzzingConfig::Patch(config)
    }
}

impl From<MutationConfig> for FuzzingConfig {
    fn from(config: MutationConfig) -> Self {
        FuzzingConfig::Mutation(config)
    }
}

impl fmt::Display for FuzzingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn patch_config_round_trips_through_json() {
        let original = FuzzingConfig::from(PatchConfig::new(
            "header fuzz",
            vec![
                PatchChange::bytes(0, *b"\xff"),
                PatchChange::bytes(16, vec![0, 0, 0, 0]),
                PatchChange::random(32, 3, 0x20, 0x7e),
            ],
        ));

        let json = original.to_json().unwrap();
        assert!(json.contains("\"type\": \"Patch\""));

        let restored = FuzzingConfig::from_json(&json).unwrap();
        match &restored {
            FuzzingConfig::Patch(patch) => {
                assert_eq!(patch.changes.len(), 3);
                assert_eq!(patch.changes[1], PatchChange::bytes(16, vec![0, 0, 0, 0]));
            }
            other => panic!("expected a patch config, got {other:?}"),
        }
        assert_eq!(restored.description(), "header fuzz");
        assert_eq!(restored, original);
    }

    #[test]
    fn documented_patch_format_parses() {
        let json = r#"{
            "type": "Patch",
            "description": "flip third byte",
            "changes": [{ "offset": 2, "replacement": [88] }]
        }"#;
        let config = FuzzingConfig::from_json(json).unwrap();
        assert_eq!(config.kind(), ConfigKind::Patch);
        assert_eq!(config.to_string(), "flip third byte");

        let mut rng = RandomByteSource::from_seed(0);
        assert_eq!(
            config.get(2, 0, &mut rng),
            Some(PatchChange::bytes(2, *b"X"))
        );
    }

    #[test]
    fn mutation_config_round_trips_through_json() {
        let original = FuzzingConfig::from(MutationConfig::new(
            "noise",
            vec![MutationRule {
                offset_from: 4,
                offset_to: 64,
                probability: 0.25,
                ramp_up_secs: Some(30),
                ..MutationRule::default()
            }],
        ));
        let restored = FuzzingConfig::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(restored, original);
        assert_eq!(restored.kind(), ConfigKind::Mutation);
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            FuzzingConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(FuzzingConfig::from_json(r#"{"type": "Spline"}"#).is_err());
    }

    #[test]
    fn load_resolves_kind_by_extension() {
        let dir = tempdir().unwrap();
        let patch = FuzzingConfig::from(PatchConfig::new("p", vec![PatchChange::bytes(1, *b"a")]));

        let good = dir.path().join("one.FPATCH");
        fs::write(&good, patch.to_json().unwrap()).unwrap();
        assert_eq!(FuzzingConfig::load(&good).unwrap(), patch);

        let mismatched = dir.path().join("one.fmut");
        fs::write(&mismatched, patch.to_json().unwrap()).unwrap();
        assert!(matches!(
            FuzzingConfig::load(&mismatched),
            Err(ConfigError::KindMismatch {
                expected: ConfigKind::Mutation,
                found: ConfigKind::Patch
            })
        ));

        let unknown = dir.path().join("one.json");
        fs::write(&unknown, patch.to_json().unwrap()).unwrap();
        assert!(matches!(
            FuzzingConfig::load(&unknown),
            Err(ConfigError::UnknownExtension(_))
        ));

        assert!(matches!(
            FuzzingConfig::load(&dir.path().join("missing.fpatch")),
            Err(ConfigError::Io { .. })
        ));
    }
}
