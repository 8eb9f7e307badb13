//! Host architecture detection.
//!
//! Images are cached and instantiated per architecture, using the names the
//! LXC templates understand (`amd64`, `arm64`, ...). The kernel
//! personality (`x86_64`, ...) is what goes into an image's `lxc.arch`.

/// CPU architecture of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Armhf,
    I386,
    Unknown,
}

impl Arch {
    /// Detects the architecture this binary was built for.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        return Arch::Amd64;

        #[cfg(target_arch = "aarch64")]
        return Arch::Arm64;

        #[cfg(target_arch = "arm")]
        return Arch::Armhf;

        #[cfg(target_arch = "x86")]
        return Arch::I386;

        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "arm",
            target_arch = "x86"
        )))]
        return Arch::Unknown;
    }

    /// Returns the Debian/LXC architecture name used in cache paths and
    /// template arguments.
    pub fn lxc_name(&self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
            Self::Armhf => "armhf",
            Self::I386 => "i386",
            // The cache is keyed by amd64 everywhere else; keep it that way.
            Self::Unknown => "amd64",
        }
    }

    /// Returns the kernel personality written as `lxc.arch`.
    pub fn personality(&self) -> &'static str {
        match self {
            Self::Amd64 | Self::Unknown => "x86_64",
            Self::Arm64 => "aarch64",
            Self::Armhf => "armv7l",
            Self::I386 => "i686",
        }
    }
}

impl Default for Arch {
    fn default() -> Self {
        Self::detect()
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.lxc_name())
    }
}
