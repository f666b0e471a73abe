//! HTTP protocol versions and the process-wide capability set

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// HTTP protocol version, ordered from oldest to newest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    #[default]
    Http11,
    Http2,
    Http3,
}

impl ProtocolVersion {
    /// Versions tried for a requested version, most preferred first.
    ///
    /// A request never upgrades silently: HTTP/1.1 yields only itself.
    pub fn fallback_chain(self) -> &'static [ProtocolVersion] {
        match self {
            ProtocolVersion::Http3 => &[
                ProtocolVersion::Http3,
                ProtocolVersion::Http2,
                ProtocolVersion::Http11,
            ],
            ProtocolVersion::Http2 => &[ProtocolVersion::Http2, ProtocolVersion::Http11],
            ProtocolVersion::Http11 => &[ProtocolVersion::Http11],
        }
    }

    /// Short form used in configuration ("1.1", "2", "3")
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::Http11 => "1.1",
            ProtocolVersion::Http2 => "2",
            ProtocolVersion::Http3 => "3",
        }
    }

    pub fn to_http_version(self) -> reqwest::Version {
        match self {
            ProtocolVersion::Http11 => reqwest::Version::HTTP_11,
            ProtocolVersion::Http2 => reqwest::Version::HTTP_2,
            ProtocolVersion::Http3 => reqwest::Version::HTTP_3,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}", self.as_str())
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bare = trimmed
            .strip_prefix("HTTP/")
            .or_else(|| trimmed.strip_prefix("http/"))
            .unwrap_or(trimmed);
        match bare {
            "1.1" | "1" => Ok(ProtocolVersion::Http11),
            "2" | "2.0" => Ok(ProtocolVersion::Http2),
            "3" | "3.0" => Ok(ProtocolVersion::Http3),
            other => Err(format!(
                "unsupported http_version '{}', expected one of \"1.1\", \"2\", \"3\"",
                other
            )),
        }
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Protocol implementations available in the running process.
///
/// Computed once and handed to the transport selector; never re-probed per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    available: BTreeSet<ProtocolVersion>,
}

impl Capabilities {
    /// Probe what the bundled transport stack supports.
    ///
    /// HTTP/3 in reqwest sits behind an unstable build flag, so only HTTP/1.1
    /// and HTTP/2 are reported here.
    pub fn detect() -> Self {
        Self::from_versions([ProtocolVersion::Http11, ProtocolVersion::Http2])
    }

    /// Every protocol version, for custom transports that implement all of them
    pub fn all() -> Self {
        Self::from_versions([
            ProtocolVersion::Http11,
            ProtocolVersion::Http2,
            ProtocolVersion::Http3,
        ])
    }

    pub fn from_versions(versions: impl IntoIterator<Item = ProtocolVersion>) -> Self {
        Self {
            available: versions.into_iter().collect(),
        }
    }

    pub fn supports(&self, version: ProtocolVersion) -> bool {
        self.available.contains(&version)
    }

    /// Fallback chain for `requested` with unavailable versions pruned
    pub fn chain_for(&self, requested: ProtocolVersion) -> Vec<ProtocolVersion> {
        requested
            .fallback_chain()
            .iter()
            .copied()
            .filter(|version| self.supports(*version))
            .collect()
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::detect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_chains() {
        assert_eq!(
            ProtocolVersion::Http3.fallback_chain(),
            &[
                ProtocolVersion::Http3,
                ProtocolVersion::Http2,
                ProtocolVersion::Http11
            ]
        );
        assert_eq!(
            ProtocolVersion::Http2.fallback_chain(),
            &[ProtocolVersion::Http2, ProtocolVersion::Http11]
        );
        assert_eq!(
            ProtocolVersion::Http11.fallback_chain(),
            &[ProtocolVersion::Http11]
        );
    }

    #[test]
    fn test_chain_prunes_unavailable_versions() {
        let caps = Capabilities::detect();
        assert_eq!(
            caps.chain_for(ProtocolVersion::Http3),
            vec![ProtocolVersion::Http2, ProtocolVersion::Http11]
        );

        let only_h1 = Capabilities::from_versions([ProtocolVersion::Http11]);
        assert_eq!(
            only_h1.chain_for(ProtocolVersion::Http2),
            vec![ProtocolVersion::Http11]
        );
        assert!(Capabilities::from_versions([]).chain_for(ProtocolVersion::Http11).is_empty());
    }

    #[test]
    fn test_parse_versions() {
        assert_eq!("1.1".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::Http11);
        assert_eq!("2".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::Http2);
        assert_eq!("HTTP/3".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::Http3);
        assert!("4".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn test_default_version_is_http11() {
        assert_eq!(ProtocolVersion::default(), ProtocolVersion::Http11);
    }

    #[test]
    fn test_serde_uses_short_form() {
        let json = serde_json::to_string(&ProtocolVersion::Http2).unwrap();
        assert_eq!(json, "\"2\"");
        let parsed: ProtocolVersion = serde_json::from_str("\"1.1\"").unwrap();
        assert_eq!(parsed, ProtocolVersion::Http11);
    }
}
