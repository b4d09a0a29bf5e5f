use serde::{Deserialize, Serialize};

use crate::{Estimate, PokerError};

/// Invocation options exactly as the host supplies them
/// (`{ "includeUnknown": .., "values": [..] }`). Unrecognized keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RawEstimateOptions {
    #[serde(default, alias = "includeUnknown")]
    pub include_unknown: bool,
    pub values: Vec<String>,
}

impl RawEstimateOptions {
    /// Split a comma separated list such as `"1,2,3,5,8"`.
    #[must_use]
    pub fn from_csv(values: &str, include_unknown: bool) -> Self {
        Self {
            include_unknown,
            values: values.split(',').map(|value| value.trim().to_string()).collect(),
        }
    }
}

/// Parsed estimate configuration. `values` is both the set of valid cards and
/// the rank order used for display colors.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EstimateOptions {
    pub values: Vec<i64>,
    pub include_unknown: bool,
}

impl EstimateOptions {
    /// Parse raw option strings, failing fast on anything that is not an integer.
    ///
    /// # Errors
    /// Returns [`PokerError::Config`] for an empty value list, a non-integer
    /// entry, or a repeated value.
    pub fn parse(raw: &RawEstimateOptions) -> Result<Self, PokerError> {
        if raw.values.is_empty() {
            return Err(PokerError::Config("estimate values MUST NOT be empty".to_string()));
        }

        let mut values = Vec::with_capacity(raw.values.len());
        for (position, entry) in raw.values.iter().enumerate() {
            let trimmed = entry.trim();
            let value = trimmed.parse::<i64>().map_err(|_| {
                PokerError::Config(format!(
                    "estimate value `{trimmed}` at position {position} is not an integer"
                ))
            })?;
            if values.contains(&value) {
                return Err(PokerError::Config(format!(
                    "estimate value `{value}` is listed more than once"
                )));
            }
            values.push(value);
        }

        Ok(Self { values, include_unknown: raw.include_unknown })
    }

    /// Check that a cast uses one of the configured cards.
    ///
    /// # Errors
    /// Returns [`PokerError::Validation`] for a value outside `values`, or for
    /// the unknown card when it is not offered.
    pub fn validate(&self, estimate: Estimate) -> Result<(), PokerError> {
        match estimate {
            Estimate::Points(value) if self.values.contains(&value) => Ok(()),
            Estimate::Points(value) => Err(PokerError::Validation(format!(
                "estimate {value} is not one of the configured values"
            ))),
            Estimate::Unknown if self.include_unknown => Ok(()),
            Estimate::Unknown => {
                Err(PokerError::Validation("the unknown card is not offered".to_string()))
            }
        }
    }

    /// Cards offered to a participant who has not voted yet, in configured order.
    #[must_use]
    pub fn choices(&self) -> Vec<Estimate> {
        let mut choices = self.values.iter().copied().map(Estimate::Points).collect::<Vec<_>>();
        if self.include_unknown {
            choices.push(Estimate::Unknown);
        }
        choices
    }
}
