use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing the simple reward string format.
#[derive(Debug, Error, PartialEq)]
pub enum RewardParseError {
    #[error("empty reward string")]
    Empty,
    #[error("reward entry `{0}` is missing the dimension separator")]
    MissingSeparator(String),
    #[error("invalid reward dimension `{0}`")]
    InvalidDimension(String),
    #[error("invalid reward value `{0}`")]
    InvalidValue(String),
}

/// Multi-dimensional reward, keyed by dimension index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reward {
    values: BTreeMap<u32, f64>,
}

impl Reward {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(value: f64) -> Self {
        let mut reward = Self::new();
        reward.values.insert(0, value);
        reward
    }

    pub fn with_value(mut self, dimension: u32, value: f64) -> Self {
        self.values.insert(dimension, value);
        self
    }

    /// Parses `"<dim>:<value>,<dim>:<value>"`.
    pub fn parse_simple(text: &str) -> Result<Self, RewardParseError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RewardParseError::Empty);
        }
        let mut values = BTreeMap::new();
        for entry in text.split(',') {
            let entry = entry.trim();
            let (dimension, value) = entry
                .split_once(':')
                .ok_or_else(|| RewardParseError::MissingSeparator(entry.to_string()))?;
            let dimension = dimension
                .trim()
                .parse::<u32>()
                .map_err(|_| RewardParseError::InvalidDimension(dimension.to_string()))?;
            let value = value
                .trim()
                .parse::<f64>()
                .map_err(|_| RewardParseError::InvalidValue(value.to_string()))?;
            values.insert(dimension, value);
        }
        Ok(Self { values })
    }

    pub fn to_simple_string(&self) -> String {
        self.values
            .iter()
            .map(|(dimension, value)| format!("{dimension}:{value}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Sums `other` into `self`, dimension by dimension.
    pub fn add(&mut self, other: &Reward) {
        for (dimension, value) in &other.values {
            *self.values.entry(*dimension).or_insert(0.0) += value;
        }
    }

    pub fn value(&self, dimension: u32) -> Option<f64> {
        self.values.get(&dimension).copied()
    }

    pub fn has_value(&self, dimension: u32) -> bool {
        self.values.contains_key(&dimension)
    }

    pub fn dimensions(&self) -> impl Iterator<Item = u32> + '_ {
        self.values.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for Reward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_simple_string())
    }
}
