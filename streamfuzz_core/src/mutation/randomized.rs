use super::default_description;
use super::patch::PatchChange;
use crate::random::RandomByteSource;
use serde::{Deserialize, Serialize};

const DEFAULT_RULE_PROBABILITY: f64 = 0.01;

fn default_probability() -> f64 {
    DEFAULT_RULE_PROBABILITY
}

fn default_offset_to() -> u64 {
    u64::MAX
}

fn default_value_to() -> u8 {
    u8::MAX
}

fn default_length() -> u16 {
    1
}

/// One randomized mutation window.
///
/// Every offset in `[offset_from, offset_to]` is mutated with `probability`.
/// With `ramp_up_secs` set, the probability starts at zero when the stream is
/// opened and grows linearly until the ramp is over.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct MutationRule {
    #[serde(default)]
    pub offset_from: u64,
    #[serde(default = "default_offset_to")]
    pub offset_to: u64,
    #[serde(default = "default_probability")]
    pub probability: f64,
    #[serde(default)]
    pub value_from: u8,
    #[serde(default = "default_value_to")]
    pub value_to: u8,
    #[serde(default = "default_length")]
    pub length_from: u16,
    #[serde(default = "default_length")]
    pub length_to: u16,
    #[serde(default)]
    pub ramp_up_secs: Option<u64>,
}

impl MutationRule {
    pub fn covers(&self, offset: u64) -> bool {
        self.offset_from <= offset && offset <= self.offset_to
    }

    pub fn effective_probability(&self, elapsed_secs: u64) -> f64 {
        match self.ramp_up_secs {
            Some(ramp) if ramp > 0 => {
                let progress = (elapsed_secs as f64 / ramp as f64).min(1.0);
                self.probability * progress
            }
            _ => self.probability,
        }
    }
}

impl Default for MutationRule {
    fn default() -> Self {
        Self {
            offset_from: 0,
            offset_to: default_offset_to(),
            probability: default_probability(),
            value_from: 0,
            value_to: default_value_to(),
            length_from: default_length(),
            length_to: default_length(),
            ramp_up_secs: None,
        }
    }
}

/// Randomized mutation strategy: a list of probabilistic windows over the stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MutationConfig {
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default)]
    pub rules: Vec<MutationRule>,
}

impl MutationConfig {
    pub fn new(description: impl Into<String>, rules: Vec<MutationRule>) -> Self {
        Self {
            description: description.into(),
            rules,
        }
    }

    /// Rolls the rules covering `offset` in order and returns a change for the
    /// first one that fires.
    pub fn get(
        &self,
        offset: u64,
        elapsed_secs: u64,
        rng: &mut RandomByteSource,
    ) -> Option<PatchChange> {
        let rule = self.rules.iter().find(|rule| {
            rule.covers(offset) && rng.next_bool(rule.effective_probability(elapsed_secs))
        })?;
        let count = rng.next(rule.length_from, rule.length_to);
        Some(PatchChange::random(
            offset,
            count,
            rule.value_from,
            rule.value_to,
        ))
    }
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            description: default_description(),
            rules: Vec::new(),
        }
    }
}
