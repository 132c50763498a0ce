//! Queue priority classes.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Scheduling priority of a job. Lower values are served first.
///
/// Any value is accepted; the named classes are the ones the priority policy
/// hands out.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const URGENT: Priority = Priority(0);
    pub const HIGH: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(5);
    pub const LOW: Priority = Priority(10);

    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u8 {
        self.0
    }

    /// Name of the class this value belongs to, if it is one of the named classes.
    pub fn class_name(self) -> Option<&'static str> {
        match self {
            Self::URGENT => Some("urgent"),
            Self::HIGH => Some("high"),
            Self::NORMAL => Some("normal"),
            Self::LOW => Some("low"),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.class_name() {
            Some(name) => write!(f, "{name}({})", self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Accepts either a class name (`"urgent"`, `"high"`, `"normal"`, `"low"`) or a raw number.
impl FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "urgent" => Ok(Self::URGENT),
            "high" => Ok(Self::HIGH),
            "normal" => Ok(Self::NORMAL),
            "low" => Ok(Self::LOW),
            other => other
                .parse::<u8>()
                .map(Self)
                .map_err(|_| DomainError::validation(format!("invalid priority: {s}"))),
        }
    }
}
