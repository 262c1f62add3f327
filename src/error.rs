// src/error.rs

//! Crate-wide error type
//!
//! Every failure the core can produce maps to one variant here, carrying the
//! machine-readable data (pid, version, urls, digests, ...) alongside the
//! human message. The CLI layer prints a single-line summary and maps the
//! variant to an exit code; library code only constructs and propagates.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // ---- Input ----
    #[error("usage error: {0}")]
    UsageError(String),

    #[error("no aport found for package '{0}'")]
    NoSuchAport(String),

    #[error("package '{pkgname}' does not support architecture {arch} (arch list: {arch_list})")]
    UnsupportedArch {
        pkgname: String,
        arch: String,
        arch_list: String,
    },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    // ---- Resolution ----
    #[error("dependency conflict: {}", chain.join(" -> "))]
    DependencyConflict { chain: Vec<String> },

    #[error("make-depends cycle requires bootstrap ordering: {}", cycle.join(" -> "))]
    BootstrapRequired { cycle: Vec<String> },

    #[error("no package provides '{0}'")]
    MissingProvider(String),

    // ---- Environment ----
    #[error("work directory is locked by pid {0} (another pmbootstrap is running)")]
    WorkdirLocked(u32),

    #[error("work directory version {found} is newer than supported version {supported}")]
    WorkdirFromFuture { found: u32, supported: u32 },

    #[error("all mirrors failed: {}", urls.join(", "))]
    MirrorUnavailable { urls: Vec<String> },

    #[error("privilege escalation failed: {0}")]
    PrivilegeEscalationFailed(String),

    // ---- Execution ----
    #[error("command exited with code {code}: {argv}\n{tail}")]
    NonZeroExit {
        code: i32,
        argv: String,
        tail: String,
    },

    #[error("command timed out after {elapsed_secs}s: {argv}")]
    Timeout { argv: String, elapsed_secs: u64 },

    #[error("failed to spawn command: {0}")]
    SpawnFailed(String),

    #[error("build failed during {step}: {detail}")]
    BuildFailed { step: String, detail: String },

    #[error("mount leak detected under work directory: {}", paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    MountLeak { paths: Vec<PathBuf> },

    // ---- Data ----
    #[error("checksum mismatch for {file}: expected {want}, got {got}")]
    ChecksumMismatch {
        file: String,
        want: String,
        got: String,
    },

    #[error("malformed version string '{0}'")]
    VersionMalformed(String),

    #[error("corrupt index: {0}")]
    IndexCorrupt(String),

    #[error("pkgrel bump did not converge after {0} iterations")]
    PkgrelBumpNonConverging(u32),

    // ---- Ambient ----
    #[error("interrupted")]
    Interrupted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Machine tag used in log lines and by tests asserting on error classes
    pub fn tag(&self) -> &'static str {
        match self {
            Error::UsageError(_) => "UsageError",
            Error::NoSuchAport(_) => "NoSuchAport",
            Error::UnsupportedArch { .. } => "UnsupportedArch",
            Error::ConfigInvalid(_) => "ConfigInvalid",
            Error::DependencyConflict { .. } => "DependencyConflict",
            Error::BootstrapRequired { .. } => "BootstrapRequired",
            Error::MissingProvider(_) => "MissingProvider",
            Error::WorkdirLocked(_) => "WorkdirLocked",
            Error::WorkdirFromFuture { .. } => "WorkdirFromFuture",
            Error::MirrorUnavailable { .. } => "MirrorUnavailable",
            Error::PrivilegeEscalationFailed(_) => "PrivilegeEscalationFailed",
            Error::NonZeroExit { .. } => "NonZeroExit",
            Error::Timeout { .. } => "Timeout",
            Error::SpawnFailed(_) => "SpawnFailed",
            Error::BuildFailed { .. } => "BuildFailed",
            Error::MountLeak { .. } => "MountLeak",
            Error::ChecksumMismatch { .. } => "ChecksumMismatch",
            Error::VersionMalformed(_) => "VersionMalformed",
            Error::IndexCorrupt(_) => "IndexCorrupt",
            Error::PkgrelBumpNonConverging(_) => "PkgrelBumpNonConverging",
            Error::Interrupted => "Interrupted",
            Error::Io(_) => "Io",
            Error::Internal(_) => "Internal",
        }
    }

    /// Exit code for the CLI layer (0 success is never an Error)
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::UsageError(_) => 2,
            Error::Interrupted => 130,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_matches_variant() {
        let err = Error::WorkdirLocked(4242);
        assert_eq!(err.tag(), "WorkdirLocked");
        assert!(err.to_string().contains("4242"));
    }

    #[test]
    fn test_usage_error_exit_code() {
        assert_eq!(Error::UsageError("bad flag".into()).exit_code(), 2);
        assert_eq!(Error::NoSuchAport("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_conflict_message_names_chain() {
        let err = Error::DependencyConflict {
            chain: vec!["foo>=2".into(), "foo<2".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("foo>=2"));
        assert!(msg.contains("foo<2"));
    }

    #[test]
    fn test_checksum_mismatch_names_both_digests() {
        let err = Error::ChecksumMismatch {
            file: "hello-1.0.tar.gz".into(),
            want: "aaaa".into(),
            got: "bbbb".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("aaaa") && msg.contains("bbbb"));
    }
}
