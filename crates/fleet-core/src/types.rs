//! Shared types used across Fleetgate crates.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CPU architecture a package is built for and a channel serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    All,
    Amd64,
    Aarch64,
    X86,
}

/// Raised when an architecture string is not one Fleetgate knows about.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid arch: {0}")]
pub struct InvalidArch(pub String);

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::All => "all",
            Arch::Amd64 => "amd64",
            Arch::Aarch64 => "aarch64",
            Arch::X86 => "x86",
        }
    }
}

impl FromStr for Arch {
    type Err = InvalidArch;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" | "" => Ok(Arch::All),
            "amd64" | "x86_64" | "x64" => Ok(Arch::Amd64),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            "x86" | "i386" | "i686" => Ok(Arch::X86),
            _ => Err(InvalidArch(s.to_string())),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a package version. Leading `v` is tolerated.
pub fn parse_version(raw: &str) -> Result<semver::Version, semver::Error> {
    semver::Version::parse(raw.trim().trim_start_matches('v'))
}

/// Whether two reported versions denote the same release.
///
/// Semver versions compare on major/minor/patch/pre-release; build metadata
/// is ignored. Anything that does not parse falls back to exact comparison.
pub fn versions_match(a: &str, b: &str) -> bool {
    match (parse_version(a), parse_version(b)) {
        (Ok(x), Ok(y)) => {
            x.major == y.major && x.minor == y.minor && x.patch == y.patch && x.pre == y.pre
        }
        _ => a.trim() == b.trim(),
    }
}

/// Whether `hash` is a hex-encoded SHA-256 digest.
pub fn is_sha256_hex(hash: &str) -> bool {
    matches!(hex::decode(hash), Ok(bytes) if bytes.len() == 32)
}

/// Current wall-clock time as Unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
