// src/chroot/mount.rs

//! Mount registry: every kernel mount the tool creates, in order
//!
//! The registry is the single writer of mount state within one process. A
//! chroot's records form an ordered list; release walks it in reverse. On
//! shutdown the registry reconciles against `/proc/self/mountinfo`: any
//! mountpoint under the work dir that it does not know about (left by an
//! aborted earlier run) is unmounted too. Leaving a mount behind once its
//! chroot is no longer mounted is a fatal invariant violation, because a
//! later `zap` would recurse into bind-mounted host paths.

use crate::error::{Error, Result};
use crate::runner::{CommandSpec, OutputMode, Runner};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What kind of mount a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Tmpfs,
    Proc,
    Sys,
    Dev,
    DevPts,
    Binfmt,
}

/// One tracked mount
#[derive(Debug, Clone)]
pub struct MountRecord {
    /// Chroot suffix this mount belongs to (e.g. "native", "buildroot_armv7")
    pub chroot: String,
    pub source: PathBuf,
    pub target: PathBuf,
    pub kind: MountKind,
}

impl MountRecord {
    fn mount_argv(&self) -> Vec<String> {
        let target = self.target.display().to_string();
        match self.kind {
            MountKind::Bind => vec![
                "mount".into(),
                "--bind".into(),
                self.source.display().to_string(),
                target,
            ],
            MountKind::Tmpfs => vec!["mount".into(), "-t".into(), "tmpfs".into(), "tmpfs".into(), target],
            MountKind::Proc => vec!["mount".into(), "-t".into(), "proc".into(), "proc".into(), target],
            MountKind::Sys => vec!["mount".into(), "-t".into(), "sysfs".into(), "sysfs".into(), target],
            MountKind::Dev => vec![
                "mount".into(),
                "-t".into(),
                "tmpfs".into(),
                "-o".into(),
                "size=1M,noexec,dev".into(),
                "tmpfs".into(),
                target,
            ],
            MountKind::DevPts => vec![
                "mount".into(),
                "-t".into(),
                "devpts".into(),
                "devpts".into(),
                target,
            ],
            MountKind::Binfmt => vec![
                "mount".into(),
                "-t".into(),
                "binfmt_misc".into(),
                "binfmt_misc".into(),
                target,
            ],
        }
    }
}

/// Process-wide registry of live mounts, keyed by chroot suffix
#[derive(Debug, Default)]
pub struct MountRegistry {
    mounts: HashMap<String, Vec<MountRecord>>,
    /// Nested-entry counts; a chroot is released only when this reaches zero
    acquisitions: HashMap<String, u32>,
}

impl MountRegistry {
    pub fn new() -> MountRegistry {
        MountRegistry::default()
    }

    /// Whether the chroot currently has live mounts
    pub fn is_mounted(&self, chroot: &str) -> bool {
        self.mounts.get(chroot).is_some_and(|list| !list.is_empty())
    }

    /// Targets currently recorded for one chroot, in acquisition order
    pub fn targets(&self, chroot: &str) -> Vec<PathBuf> {
        self.mounts
            .get(chroot)
            .map(|list| list.iter().map(|r| r.target.clone()).collect())
            .unwrap_or_default()
    }

    /// Bump the acquisition count for a chroot entry
    pub fn acquire(&mut self, chroot: &str) -> u32 {
        let count = self.acquisitions.entry(chroot.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop one acquisition; returns the remaining count
    pub fn release_ref(&mut self, chroot: &str) -> u32 {
        let count = self.acquisitions.entry(chroot.to_string()).or_insert(0);
        *count = count.saturating_sub(1);
        *count
    }

    /// Perform a mount and record it. The target directory is created first.
    pub fn mount(&mut self, runner: &Runner, record: MountRecord) -> Result<()> {
        let target = record.target.display().to_string();
        runner.run(
            CommandSpec::new(["mkdir".to_string(), "-p".to_string(), target])
                .as_root(true)
                .output(OutputMode::StreamToLog),
        )?;
        runner.run(
            CommandSpec::new(record.mount_argv())
                .as_root(true)
                .output(OutputMode::StreamToLog),
        )?;
        debug!(
            "mounted {:?} {} -> {}",
            record.kind,
            record.source.display(),
            record.target.display()
        );
        self.mounts
            .entry(record.chroot.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    /// Release every recorded mount of one chroot, newest first.
    ///
    /// Ignores the acquisition count; callers go through the chroot manager
    /// which only calls this at count zero. After unmounting, verifies
    /// against the kernel that nothing under `chroot_root` is still mounted.
    pub fn release_chroot(&mut self, runner: &Runner, chroot: &str, chroot_root: &Path) -> Result<()> {
        let Some(records) = self.mounts.remove(chroot) else {
            return Ok(());
        };

        for record in records.iter().rev() {
            unmount(runner, &record.target)?;
        }
        self.acquisitions.remove(chroot);

        let leaked = mounts_under(chroot_root)?;
        if !leaked.is_empty() {
            return Err(Error::MountLeak { paths: leaked });
        }
        Ok(())
    }

    /// Release everything: recorded mounts first, then any stray mountpoint
    /// under the work dir (healing aborted previous runs). Call only while
    /// holding the work-dir lock.
    pub fn shutdown(&mut self, runner: &Runner, work_root: &Path) -> Result<()> {
        let chroots: Vec<String> = self.mounts.keys().cloned().collect();
        for chroot in chroots {
            if let Some(records) = self.mounts.remove(&chroot) {
                for record in records.iter().rev() {
                    unmount(runner, &record.target)?;
                }
            }
        }
        self.acquisitions.clear();

        // Strays: deepest path first so nested mounts unwind cleanly
        let mut strays = mounts_under(work_root)?;
        strays.sort_by_key(|p| std::cmp::Reverse(p.as_os_str().len()));
        for path in &strays {
            warn!("unmounting stray mount from earlier run: {}", path.display());
            unmount(runner, path)?;
        }

        let leaked = mounts_under(work_root)?;
        if !leaked.is_empty() {
            return Err(Error::MountLeak { paths: leaked });
        }
        Ok(())
    }
}

/// Unmount one target; falls back to a lazy unmount when busy
fn unmount(runner: &Runner, target: &Path) -> Result<()> {
    let target_str = target.display().to_string();
    let result = runner.run(
        CommandSpec::new(["umount".to_string(), target_str.clone()])
            .as_root(true)
            .check(false)
            .output(OutputMode::StreamToLog),
    )?;
    if result.success() {
        return Ok(());
    }
    warn!("umount {} failed, retrying lazily", target.display());
    runner.run(
        CommandSpec::new(["umount".to_string(), "-l".to_string(), target_str])
            .as_root(true)
            .output(OutputMode::StreamToLog),
    )?;
    Ok(())
}

/// Kernel mountpoints strictly inside `root`, from /proc/self/mountinfo
pub fn mounts_under(root: &Path) -> Result<Vec<PathBuf>> {
    let content = fs::read_to_string("/proc/self/mountinfo")?;
    Ok(parse_mountinfo(&content)
        .into_iter()
        .filter(|p| p.starts_with(root))
        .collect())
}

/// Extract mountpoint paths from mountinfo content. Field five is the mount
/// point; octal escapes (\040 for space, etc.) are decoded.
fn parse_mountinfo(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(unescape_mountinfo)
        .map(PathBuf::from)
        .collect()
}

fn unescape_mountinfo(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.by_ref().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) => out.push(byte as char),
            Err(_) => {
                out.push('\\');
                out.push_str(&digits);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
24 30 0:22 / /proc rw,nosuid,nodev,noexec,relatime shared:13 - proc proc rw
30 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
91 30 8:1 /work /home/user/.local/var/pmbootstrap/chroot_native/mnt/pmaports rw,relatime shared:1 - ext4 /dev/sda1 rw
92 30 0:22 / /home/user/.local/var/pmbootstrap/chroot_native/proc rw - proc proc rw
93 30 8:1 /spa\\040ce /home/user/with\\040space rw - ext4 /dev/sda1 rw
";

    #[test]
    fn test_parse_mountinfo_extracts_targets() {
        let mounts = parse_mountinfo(SAMPLE);
        assert!(mounts.contains(&PathBuf::from("/proc")));
        assert!(mounts.contains(&PathBuf::from(
            "/home/user/.local/var/pmbootstrap/chroot_native/proc"
        )));
    }

    #[test]
    fn test_parse_mountinfo_unescapes_spaces() {
        let mounts = parse_mountinfo(SAMPLE);
        assert!(mounts.contains(&PathBuf::from("/home/user/with space")));
    }

    #[test]
    fn test_filter_under_workdir() {
        let work = PathBuf::from("/home/user/.local/var/pmbootstrap");
        let inside: Vec<PathBuf> = parse_mountinfo(SAMPLE)
            .into_iter()
            .filter(|p| p.starts_with(&work))
            .collect();
        assert_eq!(inside.len(), 2);
    }

    #[test]
    fn test_acquire_release_counting() {
        let mut registry = MountRegistry::new();
        assert_eq!(registry.acquire("native"), 1);
        assert_eq!(registry.acquire("native"), 2);
        assert_eq!(registry.release_ref("native"), 1);
        assert_eq!(registry.release_ref("native"), 0);
        assert_eq!(registry.release_ref("native"), 0);
    }

    #[test]
    fn test_registry_starts_unmounted() {
        let registry = MountRegistry::new();
        assert!(!registry.is_mounted("native"));
        assert!(registry.targets("native").is_empty());
    }

    #[test]
    fn test_mount_argv_shapes() {
        let record = MountRecord {
            chroot: "native".into(),
            source: PathBuf::from("/aports"),
            target: PathBuf::from("/w/chroot_native/mnt/pmaports"),
            kind: MountKind::Bind,
        };
        assert_eq!(
            record.mount_argv(),
            vec!["mount", "--bind", "/aports", "/w/chroot_native/mnt/pmaports"]
        );

        let proc = MountRecord {
            chroot: "native".into(),
            source: PathBuf::from("proc"),
            target: PathBuf::from("/w/chroot_native/proc"),
            kind: MountKind::Proc,
        };
        assert_eq!(
            proc.mount_argv(),
            vec!["mount", "-t", "proc", "proc", "/w/chroot_native/proc"]
        );
    }
}
