//! Numeric bounds for concurrency policies.
//!
//! Settings follow the convention used by managed executor configuration:
//! `-1` means unbounded and any other value must be at least 1.

use crate::error::ConfigError;
use core::fmt;

/// Value that configures a bound as unbounded.
pub const UNBOUNDED: i64 = -1;

/// An optional upper limit on a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bound {
    /// No limit.
    #[default]
    Unbounded,
    /// At most this many (always at least 1).
    Limit(usize),
}

impl Bound {
    /// Parses a configured setting value.
    ///
    /// `-1` yields [`Bound::Unbounded`]; `0` and other negative values are
    /// rejected with [`ConfigError::OutOfRange`] naming the setting.
    pub fn from_setting(setting: &'static str, value: i64) -> Result<Self, ConfigError> {
        match value {
            UNBOUNDED => Ok(Self::Unbounded),
            n if n >= 1 => usize::try_from(n)
                .map(Self::Limit)
                .map_err(|_| ConfigError::OutOfRange { setting, value }),
            _ => Err(ConfigError::OutOfRange { setting, value }),
        }
    }

    /// Returns true if one more unit fits when `count` are already in use.
    #[inline]
    #[must_use]
    pub const fn admits(self, count: usize) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Limit(limit) => count < limit,
        }
    }

    /// Returns the finite limit, if any.
    #[must_use]
    pub const fn limit(self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Limit(limit) => Some(limit),
        }
    }

    /// Returns the setting value this bound was configured from.
    #[must_use]
    pub fn as_setting(self) -> i64 {
        match self {
            Self::Unbounded => UNBOUNDED,
            Self::Limit(limit) => i64::try_from(limit).unwrap_or(i64::MAX),
        }
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbounded => f.write_str("unbounded"),
            Self::Limit(limit) => write!(f, "{limit}"),
        }
    }
}
