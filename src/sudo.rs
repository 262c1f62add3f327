// src/sudo.rs

//! Privilege escalation channel
//!
//! All root-requiring commands are routed through a single escalation binary
//! selected once per process: the `PMB_SUDO` environment variable wins, then
//! `doas` if installed, then `sudo`. The argv shape is stable
//! (`<escalator> -E -- <real argv...>`); environment variables the child
//! needs are re-exported explicitly instead of relying on sudoers policy.

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Escalators probed in order when `PMB_SUDO` is unset
const SUPPORTED_ESCALATORS: &[&str] = &["doas", "sudo"];

static SELECTED: OnceLock<Result<PathBuf>> = OnceLock::new();

/// Locate a binary on PATH
fn find_on_path(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let p = PathBuf::from(name);
        return p.is_file().then_some(p);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Select the escalation binary for this process
///
/// The result is computed once and cached; a missing `PMB_SUDO` target is a
/// hard error rather than a silent fallback to sudo/doas.
pub fn which_sudo() -> Result<PathBuf> {
    let selected = SELECTED.get_or_init(|| {
        if let Some(user_set) = std::env::var_os("PMB_SUDO") {
            let name = user_set.to_string_lossy().to_string();
            return find_on_path(&name).ok_or_else(|| {
                Error::PrivilegeEscalationFailed(format!(
                    "PMB_SUDO is set to '{name}' but that command is not on PATH"
                ))
            });
        }

        for name in SUPPORTED_ESCALATORS {
            if let Some(path) = find_on_path(name) {
                debug!("selected privilege escalator: {}", path.display());
                return Ok(path);
            }
        }

        Err(Error::PrivilegeEscalationFailed(
            "neither doas nor sudo found; install one or set PMB_SUDO".to_string(),
        ))
    });

    match selected {
        Ok(path) => Ok(path.clone()),
        Err(e) => Err(Error::PrivilegeEscalationFailed(e.to_string())),
    }
}

/// Environment variables re-exported through the escalator to root children
pub const PASSTHROUGH_ENV: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "http_proxy",
    "https_proxy",
    "SOURCE_DATE_EPOCH",
    "TESTUSER",
];

/// Wrap an argv in the escalation prefix: `<escalator> -E -- <argv...>`
pub fn escalate(argv: &[OsString]) -> Result<Vec<OsString>> {
    let escalator = which_sudo()?;
    let mut wrapped = Vec::with_capacity(argv.len() + 3);
    wrapped.push(escalator.into_os_string());
    wrapped.push(OsString::from("-E"));
    wrapped.push(OsString::from("--"));
    wrapped.extend(argv.iter().cloned());
    Ok(wrapped)
}

/// True when this process already runs as root and no escalation is needed
pub fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

/// Resolve the unprivileged user commands run as inside a chroot.
/// `TESTUSER` overrides the default for CI runs.
pub fn chroot_user() -> String {
    std::env::var("TESTUSER").unwrap_or_else(|_| "pmos".to_string())
}

/// Sanity check a path is absolute before it is handed to a root command
pub fn require_absolute(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::Internal(format!(
            "refusing to run privileged command on relative path {}",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalate_argv_shape() {
        // Only runs meaningfully where doas or sudo exists; the shape check
        // itself is independent of which one was found.
        if let Ok(wrapped) = escalate(&[OsString::from("true")]) {
            assert!(wrapped.len() >= 4);
            assert_eq!(wrapped[1], OsString::from("-E"));
            assert_eq!(wrapped[2], OsString::from("--"));
            assert_eq!(wrapped[3], OsString::from("true"));
        }
    }

    #[test]
    fn test_find_on_path_absolute() {
        assert!(find_on_path("/definitely/not/here").is_none());
    }

    #[test]
    fn test_chroot_user_default() {
        if std::env::var_os("TESTUSER").is_none() {
            assert_eq!(chroot_user(), "pmos");
        }
    }

    #[test]
    fn test_require_absolute() {
        assert!(require_absolute(Path::new("/tmp")).is_ok());
        assert!(require_absolute(Path::new("tmp")).is_err());
    }
}
