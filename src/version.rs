use std::fmt;

/// Darwin kernel major version, the ordinal the patch policy is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion(pub u32);

impl KernelVersion {
    pub const BIG_SUR: KernelVersion = KernelVersion(20);
    pub const MONTEREY: KernelVersion = KernelVersion(21);
    pub const VENTURA: KernelVersion = KernelVersion(22);
    pub const SONOMA: KernelVersion = KernelVersion(23);
    pub const SEQUOIA: KernelVersion = KernelVersion(24);

    /// Parses a `uname -r` style release string ("23.4.0").
    pub fn from_release(release: &str) -> Option<Self> {
        let major = release.trim().split('.').next()?;
        major.parse().ok().map(KernelVersion)
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            20 => "Big Sur",
            21 => "Monterey",
            22 => "Ventura",
            23 => "Sonoma",
            24 => "Sequoia",
            _ => "unknown",
        }
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// Inclusive window of kernel versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    pub min: KernelVersion,
    pub max: KernelVersion,
}

impl VersionRange {
    pub const fn new(min: KernelVersion, max: KernelVersion) -> Self {
        assert!(min.0 <= max.0, "empty version range");
        VersionRange { min, max }
    }

    pub fn contains(&self, version: KernelVersion) -> bool {
        self.min <= version && version <= self.max
    }
}
