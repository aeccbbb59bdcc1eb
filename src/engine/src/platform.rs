//! Target platform parsing and validation.

use std::fmt;

use imgcd_core::{Error, Result};

/// Platforms accepted at the CLI boundary.
pub const SUPPORTED_PLATFORMS: &[&str] = &[
    "linux/amd64",
    "linux/arm64",
    "darwin/amd64",
    "darwin/arm64",
];

/// A parsed `os/arch[/variant]` platform specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    /// Operating system (linux, darwin).
    pub os: String,
    /// Architecture (amd64, arm64).
    pub arch: String,
    /// Optional variant (e.g., "v8").
    pub variant: Option<String>,
}

impl Platform {
    /// Parse a platform string of the form `os/arch` or `os/arch/variant`.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                arch: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    os: os.to_string(),
                    arch: arch.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
            _ => Err(Error::InvalidPlatform {
                given: s.to_string(),
                supported: SUPPORTED_PLATFORMS.join(", "),
            }),
        }
    }

    /// Parse a platform string, additionally enforcing the supported set.
    ///
    /// This is the CLI-boundary check; the engine itself accepts any
    /// well-formed `os/arch[/variant]`.
    pub fn parse_supported(s: &str) -> Result<Self> {
        if !SUPPORTED_PLATFORMS.contains(&s) {
            return Err(Error::InvalidPlatform {
                given: s.to_string(),
                supported: SUPPORTED_PLATFORMS.join(", "),
            });
        }
        Self::parse(s)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.arch, v),
            None => write!(f, "{}/{}", self.os, self.arch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_os_arch() {
        let p = Platform::parse("linux/amd64").unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.arch, "amd64");
        assert_eq!(p.variant, None);
    }

    #[test]
    fn test_parse_with_variant() {
        let p = Platform::parse("linux/arm64/v8").unwrap();
        assert_eq!(p.os, "linux");
        assert_eq!(p.arch, "arm64");
        assert_eq!(p.variant, Some("v8".to_string()));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Platform::parse("linux").is_err());
        assert!(Platform::parse("linux/").is_err());
        assert!(Platform::parse("/amd64").is_err());
        assert!(Platform::parse("a/b/c/d").is_err());
        assert!(Platform::parse("").is_err());
    }

    #[test]
    fn test_parse_supported() {
        assert!(Platform::parse_supported("linux/amd64").is_ok());
        assert!(Platform::parse_supported("darwin/arm64").is_ok());
        // Well-formed but outside the CLI allow-list.
        assert!(Platform::parse_supported("windows/amd64").is_err());
        assert!(Platform::parse_supported("linux/arm64/v8").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for s in SUPPORTED_PLATFORMS {
            assert_eq!(Platform::parse(s).unwrap().to_string(), *s);
        }
        assert_eq!(
            Platform::parse("linux/arm64/v8").unwrap().to_string(),
            "linux/arm64/v8"
        );
    }
}
