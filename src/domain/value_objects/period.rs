use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::errors::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timespan {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Timespan {
    /// Suffix used in display text: `m`, `H`, `D`, `W`, `M`.
    pub fn suffix(&self) -> &'static str {
        match self {
            Timespan::Minute => "m",
            Timespan::Hour => "H",
            Timespan::Day => "D",
            Timespan::Week => "W",
            Timespan::Month => "M",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timespan::Minute => "minute",
            Timespan::Hour => "hour",
            Timespan::Day => "day",
            Timespan::Week => "week",
            Timespan::Month => "month",
        }
    }

    /// Nominal length in milliseconds. Months count as 30 days.
    pub fn millis(&self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            Timespan::Minute => MINUTE,
            Timespan::Hour => 60 * MINUTE,
            Timespan::Day => 24 * 60 * MINUTE,
            Timespan::Week => 7 * 24 * 60 * MINUTE,
            Timespan::Month => 30 * 24 * 60 * MINUTE,
        }
    }
}

/// Bar period: multiplier + timespan, displayed as e.g. `15m` or `4H`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    multiplier: u32,
    timespan: Timespan,
}

impl Period {
    pub fn new(multiplier: u32, timespan: Timespan) -> Result<Self, ValidationError> {
        if multiplier == 0 {
            return Err(ValidationError::InvalidPeriod(
                "multiplier must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            multiplier,
            timespan,
        })
    }

    pub fn one_minute() -> Self {
        Self {
            multiplier: 1,
            timespan: Timespan::Minute,
        }
    }

    pub fn multiplier(&self) -> u32 {
        self.multiplier
    }

    pub fn timespan(&self) -> Timespan {
        self.timespan
    }

    pub fn text(&self) -> String {
        format!("{}{}", self.multiplier, self.timespan.suffix())
    }

    pub fn millis(&self) -> i64 {
        self.multiplier as i64 * self.timespan.millis()
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text())
    }
}

impl FromStr for Period {
    type Err = ValidationError;

    /// Accepts `15m`, `1H`, `1D`, `1W`, `1M`, bare minute counts (`60` becomes
    /// `1H`) and bare unit letters (`D` means `1D`). Lower-case `m` is minutes,
    /// upper-case `M` is months.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let split = value
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(value.len());
        let (digits, unit) = value.split_at(split);
        let multiplier = if digits.is_empty() {
            1
        } else {
            digits
                .parse::<u32>()
                .map_err(|e| ValidationError::InvalidPeriod(format!("{value}: {e}")))?
        };

        let timespan = match unit {
            "" => {
                if multiplier % 60 == 0 {
                    return Period::new(multiplier / 60, Timespan::Hour);
                }
                Timespan::Minute
            }
            "m" | "min" => Timespan::Minute,
            "H" | "h" => Timespan::Hour,
            "D" | "d" => Timespan::Day,
            "W" | "w" => Timespan::Week,
            "M" | "mo" => Timespan::Month,
            other => {
                return Err(ValidationError::InvalidPeriod(format!(
                    "unknown period unit '{other}' in '{value}'"
                )))
            }
        };
        Period::new(multiplier, timespan)
    }
}

impl TryFrom<String> for Period {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(period: Period) -> Self {
        period.text()
    }
}
