//! Version and target-platform model.
//!
//! A stored version pairs a semver string with a target-platform tag
//! and serializes to its disk-path form as `V` for universal builds
//! and `V@P` otherwise (`@` is not legal in semver, so the delimiter
//! is unambiguous). Ordering is descending semver with ties broken by
//! lexicographic platform tag, which is the order version directories
//! are listed and walked in.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Target platform tag for a stored version.
///
/// The tags mirror the platforms VS Code ships platform-specific
/// builds for. `Web`, `Universal`, `Unknown`, `Undefined`, and the
/// empty tag are all treated as platform-independent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TargetPlatform {
    Win32X64,
    Win32Ia32,
    Win32Arm64,
    LinuxX64,
    LinuxArm64,
    LinuxArmhf,
    AlpineX64,
    AlpineArm64,
    DarwinX64,
    DarwinArm64,
    Web,
    Universal,
    Unknown,
    Undefined,
    #[default]
    None,
}

impl TargetPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Win32X64 => "win32-x64",
            Self::Win32Ia32 => "win32-ia32",
            Self::Win32Arm64 => "win32-arm64",
            Self::LinuxX64 => "linux-x64",
            Self::LinuxArm64 => "linux-arm64",
            Self::LinuxArmhf => "linux-armhf",
            Self::AlpineX64 => "alpine-x64",
            Self::AlpineArm64 => "alpine-arm64",
            Self::DarwinX64 => "darwin-x64",
            Self::DarwinArm64 => "darwin-arm64",
            Self::Web => "web",
            Self::Universal => "universal",
            Self::Unknown => "unknown",
            Self::Undefined => "undefined",
            Self::None => "",
        }
    }

    /// True for tags that mean "runs anywhere".
    pub fn is_universal(&self) -> bool {
        matches!(
            self,
            Self::Web | Self::Universal | Self::Unknown | Self::Undefined | Self::None
        )
    }
}

impl fmt::Display for TargetPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetPlatform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "win32-x64" => Ok(Self::Win32X64),
            "win32-ia32" => Ok(Self::Win32Ia32),
            "win32-arm64" => Ok(Self::Win32Arm64),
            "linux-x64" => Ok(Self::LinuxX64),
            "linux-arm64" => Ok(Self::LinuxArm64),
            "linux-armhf" => Ok(Self::LinuxArmhf),
            "alpine-x64" => Ok(Self::AlpineX64),
            "alpine-arm64" => Ok(Self::AlpineArm64),
            "darwin-x64" => Ok(Self::DarwinX64),
            "darwin-arm64" => Ok(Self::DarwinArm64),
            "web" => Ok(Self::Web),
            "universal" => Ok(Self::Universal),
            "unknown" => Ok(Self::Unknown),
            "undefined" => Ok(Self::Undefined),
            "" => Ok(Self::None),
            other => Err(Error::Validation(format!(
                "unrecognized target platform {other:?}"
            ))),
        }
    }
}

/// A stored extension version: semver string plus target platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Version {
    pub version: String,
    pub target_platform: TargetPlatform,
}

impl Version {
    pub fn new(version: impl Into<String>, target_platform: TargetPlatform) -> Self {
        Self {
            version: version.into(),
            target_platform,
        }
    }

    pub fn is_universal(&self) -> bool {
        self.target_platform.is_universal()
    }

    /// Platform tag for gallery responses; `None` for universal builds.
    pub fn platform_for_response(&self) -> Option<String> {
        if self.is_universal() {
            None
        } else {
            Some(self.target_platform.to_string())
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_universal() {
            f.write_str(&self.version)
        } else {
            write!(f, "{}@{}", self.version, self.target_platform)
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::Validation("version must not be empty".to_string()));
        }
        match s.split_once('@') {
            Some((version, platform)) => Ok(Self {
                version: version.to_string(),
                target_platform: platform.parse()?,
            }),
            None => Ok(Self {
                version: s.to_string(),
                target_platform: TargetPlatform::None,
            }),
        }
    }
}

impl Ord for Version {
    /// Newest-first: higher semver sorts before lower, equal semver
    /// breaks ties by ascending platform tag. Version strings that do
    /// not parse as semver fall back to descending lexicographic
    /// comparison so a malformed upstream version is still orderable.
    fn cmp(&self, other: &Self) -> Ordering {
        let by_version = match (
            semver::Version::parse(&self.version),
            semver::Version::parse(&other.version),
        ) {
            (Ok(a), Ok(b)) => b.cmp(&a),
            _ => other.version.cmp(&self.version),
        };
        by_version
            .then_with(|| {
                self.target_platform
                    .as_str()
                    .cmp(other.target_platform.as_str())
            })
            // Semver comparison ignores build metadata; fall back to
            // the raw string so the order stays total.
            .then_with(|| other.version.cmp(&self.version))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
