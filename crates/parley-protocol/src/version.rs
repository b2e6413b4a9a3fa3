//! Protocol versioning for Parley.
//!
//! Clients announce the engine protocol revision in the `EIO` query
//! parameter of every transport request.

use serde::{Deserialize, Serialize};

/// Current protocol version (engine.io revision 4).
pub const PROTOCOL_VERSION: Version = Version { major: 4, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Parse the `EIO` query value sent by a client.
    #[must_use]
    pub fn from_query(value: &str) -> Option<Self> {
        value.trim().parse::<u8>().ok().map(|major| Self::new(major, 0))
    }

    /// Check if this version is compatible with another version.
    ///
    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_from_query() {
        assert_eq!(Version::from_query("4"), Some(PROTOCOL_VERSION));
        assert_eq!(Version::from_query("abc"), None);
        assert!(!Version::from_query("3")
            .unwrap()
            .is_compatible_with(&PROTOCOL_VERSION));
    }

    #[test]
    fn test_version_display() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "4.0");
    }
}
