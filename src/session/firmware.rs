//! Firmware-gated behaviour, resolved once per session.

use crate::error::{TspError, TspResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// First firmware major version that ships the compiling helper.
pub const BYTE_CODE_CUTOVER_MAJOR: u32 = 3;

/// Parsed `major.minor.patch` firmware revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareVersion {
    /// Major revision.
    pub major: u32,
    /// Minor revision.
    pub minor: u32,
    /// Patch revision.
    pub patch: u32,
}

impl FirmwareVersion {
    /// Parse revisions such as `3.0.2`, `2.1.7b` or `1.4`.
    pub fn parse(revision: &str) -> TspResult<Self> {
        let mut parts = revision.trim().trim_matches('"').split('.').map(leading_number);
        let major = parts.next().flatten().ok_or_else(|| {
            TspError::Protocol(format!("Unrecognized firmware revision '{}'", revision))
        })?;
        Ok(Self {
            major,
            minor: parts.next().flatten().unwrap_or(0),
            patch: parts.next().flatten().unwrap_or(0),
        })
    }
}

fn leading_number(part: &str) -> Option<u32> {
    let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The closed set of firmware behaviours the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirmwareRules {
    /// Byte-code conversion by nulling the script source.
    Legacy,
    /// Byte-code conversion through the compiling helper function.
    Compiled,
}

impl FirmwareRules {
    /// Pick the rules for a firmware version.
    pub fn for_version(version: FirmwareVersion) -> Self {
        if version.major >= BYTE_CODE_CUTOVER_MAJOR {
            FirmwareRules::Compiled
        } else {
            FirmwareRules::Legacy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_revisions() {
        assert_eq!(
            FirmwareVersion::parse("3.0.2").unwrap(),
            FirmwareVersion { major: 3, minor: 0, patch: 2 }
        );
        assert_eq!(
            FirmwareVersion::parse("2.1.7b").unwrap(),
            FirmwareVersion { major: 2, minor: 1, patch: 7 }
        );
        assert_eq!(FirmwareVersion::parse("1.4").unwrap().to_string(), "1.4.0");
        assert!(FirmwareVersion::parse("nil").is_err());
    }

    #[test]
    fn test_rules_cutover() {
        let legacy = FirmwareVersion::parse("2.9.9").unwrap();
        let compiled = FirmwareVersion::parse("3.0.0").unwrap();
        assert_eq!(FirmwareRules::for_version(legacy), FirmwareRules::Legacy);
        assert_eq!(FirmwareRules::for_version(compiled), FirmwareRules::Compiled);
    }
}
