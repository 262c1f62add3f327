// src/arch.rs

//! Target architecture tags
//!
//! Architectures are a closed set of Alpine-style tags. Each tag carries two
//! derived attributes: the kernel machine name (`uname -m` style) and the
//! GNU hostspec triplet used as CHOST/CTARGET by the cross toolchain.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Alpine-style architecture tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    X86,
    X86_64,
    Armhf,
    Armv7,
    Aarch64,
    Riscv64,
    Ppc64le,
    S390x,
    Mips64el,
}

/// All supported architectures, in display order
pub const ALL_ARCHES: &[Arch] = &[
    Arch::X86,
    Arch::X86_64,
    Arch::Armhf,
    Arch::Armv7,
    Arch::Aarch64,
    Arch::Riscv64,
    Arch::Ppc64le,
    Arch::S390x,
    Arch::Mips64el,
];

impl Arch {
    /// The Alpine tag, as written in APKBUILDs and directory names
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
            Arch::Armhf => "armhf",
            Arch::Armv7 => "armv7",
            Arch::Aarch64 => "aarch64",
            Arch::Riscv64 => "riscv64",
            Arch::Ppc64le => "ppc64le",
            Arch::S390x => "s390x",
            Arch::Mips64el => "mips64el",
        }
    }

    /// Kernel machine name (`uname -m`) for this architecture
    pub fn kernel_name(&self) -> &'static str {
        match self {
            Arch::X86 => "i686",
            Arch::X86_64 => "x86_64",
            Arch::Armhf => "armv6l",
            Arch::Armv7 => "armv7l",
            Arch::Aarch64 => "aarch64",
            Arch::Riscv64 => "riscv64",
            Arch::Ppc64le => "ppc64le",
            Arch::S390x => "s390x",
            Arch::Mips64el => "mips64",
        }
    }

    /// GNU triplet (CHOST/CTARGET) for this architecture
    pub fn hostspec(&self) -> &'static str {
        match self {
            Arch::X86 => "i586-alpine-linux-musl",
            Arch::X86_64 => "x86_64-alpine-linux-musl",
            Arch::Armhf => "armv6-alpine-linux-musleabihf",
            Arch::Armv7 => "armv7-alpine-linux-musleabihf",
            Arch::Aarch64 => "aarch64-alpine-linux-musl",
            Arch::Riscv64 => "riscv64-alpine-linux-musl",
            Arch::Ppc64le => "powerpc64le-alpine-linux-musl",
            Arch::S390x => "s390x-alpine-linux-musl",
            Arch::Mips64el => "mips64el-alpine-linux-musl",
        }
    }

    /// QEMU user binary suffix (qemu-<this>) used for binfmt registration
    pub fn qemu_name(&self) -> &'static str {
        match self {
            Arch::X86 => "i386",
            Arch::X86_64 => "x86_64",
            Arch::Armhf | Arch::Armv7 => "arm",
            Arch::Aarch64 => "aarch64",
            Arch::Riscv64 => "riscv64",
            Arch::Ppc64le => "ppc64le",
            Arch::S390x => "s390x",
            Arch::Mips64el => "mips64el",
        }
    }

    /// The architecture of the machine this process runs on
    pub fn native() -> Arch {
        Self::from_kernel_name(std::env::consts::ARCH).unwrap_or(Arch::X86_64)
    }

    /// Whether this arch differs from the host's
    pub fn is_foreign(&self) -> bool {
        *self != Arch::native()
    }

    /// Map a kernel machine name back to an Alpine tag
    pub fn from_kernel_name(machine: &str) -> Option<Arch> {
        match machine {
            // std::env::consts::ARCH spellings first, uname -m spellings after
            "x86" | "i386" | "i586" | "i686" => Some(Arch::X86),
            "x86_64" => Some(Arch::X86_64),
            "arm" | "armv6l" => Some(Arch::Armhf),
            "armv7l" => Some(Arch::Armv7),
            "aarch64" => Some(Arch::Aarch64),
            "riscv64" => Some(Arch::Riscv64),
            "powerpc64le" | "ppc64le" => Some(Arch::Ppc64le),
            "s390x" => Some(Arch::S390x),
            "mips64el" | "mips64" => Some(Arch::Mips64el),
            _ => None,
        }
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ALL_ARCHES
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| Error::UsageError(format!("unknown architecture '{s}'")))
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_tags() {
        for arch in ALL_ARCHES {
            assert_eq!(Arch::from_str(arch.as_str()).unwrap(), *arch);
        }
    }

    #[test]
    fn test_unknown_tag_is_usage_error() {
        let err = Arch::from_str("sparc").unwrap_err();
        assert_eq!(err.tag(), "UsageError");
    }

    #[test]
    fn test_hostspec_triplets() {
        assert_eq!(Arch::Armv7.hostspec(), "armv7-alpine-linux-musleabihf");
        assert_eq!(Arch::X86_64.hostspec(), "x86_64-alpine-linux-musl");
        assert_eq!(Arch::Ppc64le.hostspec(), "powerpc64le-alpine-linux-musl");
    }

    #[test]
    fn test_kernel_name_mapping() {
        assert_eq!(Arch::from_kernel_name("armv7l"), Some(Arch::Armv7));
        assert_eq!(Arch::from_kernel_name("i686"), Some(Arch::X86));
        assert_eq!(Arch::from_kernel_name("unknown"), None);
    }

    #[test]
    fn test_qemu_name_shares_arm() {
        assert_eq!(Arch::Armhf.qemu_name(), "arm");
        assert_eq!(Arch::Armv7.qemu_name(), "arm");
    }

    #[test]
    fn test_native_is_not_foreign() {
        assert!(!Arch::native().is_foreign());
    }
}
