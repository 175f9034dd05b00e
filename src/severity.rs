//! Severity levels shared by compliance controls and alerts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Severity levels, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Investigate within a day.
    Low,
    /// Investigate within hours.
    #[default]
    Medium,
    /// Investigate within the hour.
    High,
    /// Page now.
    Critical,
}

impl Severity {
    /// Whether this severity should page someone.
    pub fn requires_page(&self) -> bool {
        matches!(self, Self::Critical)
    }

    /// Whether this severity is `high` or `critical`.
    pub fn is_high_or_above(&self) -> bool {
        *self >= Self::High
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse, mapping a blank string to the default (`medium`).
    pub fn parse_or_default(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        text.parse()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(Error::validation("severity must be low, medium, high, or critical")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_and_parse() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High.is_high_or_above());
        assert!(!Severity::Medium.is_high_or_above());
        assert_eq!(" HIGH ".parse::<Severity>().unwrap(), Severity::High);
        assert_eq!(Severity::parse_or_default("").unwrap(), Severity::Medium);
        assert!("urgent".parse::<Severity>().is_err());
        assert!(Severity::Critical.requires_page());
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Severity::Critical).unwrap(), "\"critical\"");
    }
}
