use serde::{Deserialize, Serialize};
use std::fmt;

/// Dispatch priority. Higher values are claimed sooner.
///
/// Stored as a single byte so the priority index can sort on it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const HIGH_MIN: u8 = 200;
    pub const NORMAL_MIN: u8 = 100;

    pub fn new(value: u8) -> Self {
        Priority(value)
    }

    pub fn high() -> Self {
        Priority(200)
    }

    pub fn normal() -> Self {
        Priority(150)
    }

    pub fn low() -> Self {
        Priority(50)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Inverted byte for ascending key order: highest priority sorts first
    pub fn index_byte(&self) -> u8 {
        u8::MAX - self.0
    }

    pub fn from_index_byte(byte: u8) -> Self {
        Priority(u8::MAX - byte)
    }

    /// Tier name used as a metrics label
    pub fn tier(&self) -> &'static str {
        match self.0 {
            Self::HIGH_MIN..=u8::MAX => "high",
            Self::NORMAL_MIN..=199 => "normal",
            _ => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::normal()
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Priority(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
