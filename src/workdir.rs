// src/workdir.rs

//! Work directory layout, format migrations, and the exclusive lock
//!
//! Everything persistent lives under one work directory: chroot trees, apk
//! and git caches, the local package repository, and the log. The on-disk
//! format carries an integer version; older trees are migrated forward with
//! ordered idempotent steps, newer trees are a hard error. A single advisory
//! file lock serializes all pmbootstrap processes against the same work dir.

use crate::arch::Arch;
use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Current work directory format version
pub const FORMAT_VERSION: u32 = 7;

/// Name of the lock file inside the work dir
pub const LOCK_FILE: &str = "pmbootstrap.lock";

/// The work directory and its path layout
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> WorkDir {
        WorkDir { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_file(&self) -> PathBuf {
        self.root.join("version")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("log.txt")
    }

    pub fn chroot_native(&self) -> PathBuf {
        self.root.join("chroot_native")
    }

    pub fn chroot_buildroot(&self, arch: Arch) -> PathBuf {
        self.root.join(format!("chroot_buildroot_{arch}"))
    }

    pub fn chroot_rootfs(&self, device: &str) -> PathBuf {
        self.root.join(format!("chroot_rootfs_{device}"))
    }

    pub fn chroot_installer(&self, device: &str) -> PathBuf {
        self.root.join(format!("chroot_installer_{device}"))
    }

    pub fn cache_apk(&self, arch: Arch) -> PathBuf {
        self.root.join(format!("cache_apk_{arch}"))
    }

    pub fn cache_git(&self) -> PathBuf {
        self.root.join("cache_git")
    }

    pub fn packages(&self, arch: Arch) -> PathBuf {
        self.root.join("packages").join(arch.as_str())
    }

    pub fn config_abuild(&self) -> PathBuf {
        self.root.join("config_abuild")
    }

    /// Create the directory skeleton and stamp the current format version.
    /// Safe to call on an existing work dir; never downgrades the stamp.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.cache_git())?;
        fs::create_dir_all(self.config_abuild())?;
        fs::create_dir_all(self.root.join("packages"))?;

        if !self.version_file().exists() {
            fs::write(self.version_file(), format!("{FORMAT_VERSION}\n"))?;
            info!("initialized work dir at {}", self.root.display());
        }
        Ok(())
    }

    /// Read the on-disk format version. A missing marker on a non-empty tree
    /// counts as version 0 (pre-versioning layout).
    pub fn read_version(&self) -> Result<u32> {
        let path = self.version_file();
        if !path.exists() {
            return Ok(0);
        }
        let content = fs::read_to_string(&path)?;
        content
            .trim()
            .parse::<u32>()
            .map_err(|_| Error::Internal(format!("unreadable version marker: {content:?}")))
    }

    /// Check the format version and run any pending migrations.
    /// Returns the number of migrations applied.
    pub fn migrate(&self) -> Result<u32> {
        let found = self.read_version()?;
        if found > FORMAT_VERSION {
            return Err(Error::WorkdirFromFuture {
                found,
                supported: FORMAT_VERSION,
            });
        }
        if found == FORMAT_VERSION {
            return Ok(0);
        }

        let mut applied = 0;
        for (target, name, step) in MIGRATIONS {
            if *target <= found {
                continue;
            }
            debug!("work dir migration to v{target}: {name}");
            step(&self.root)?;
            fs::write(self.version_file(), format!("{target}\n"))?;
            applied += 1;
        }
        if applied > 0 {
            info!("migrated work dir from v{found} to v{FORMAT_VERSION}");
        }
        Ok(applied)
    }

    /// Acquire the exclusive work-dir lock.
    ///
    /// Non-blocking by default: a held lock reports `WorkdirLocked` with the
    /// holder's pid. With `wait` the call retries quietly until the lock is
    /// free. The lock file is never unlinked; unlinking a still-locked file
    /// would let a second process lock a fresh inode at the same path.
    pub fn lock(&self, wait: bool) -> Result<WorkDirLock> {
        fs::create_dir_all(&self.root)?;
        let path = self.lock_file();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if wait => {
                    std::thread::sleep(Duration::from_millis(500));
                }
                Err(_) => {
                    let pid = read_lock_pid(&mut file).unwrap_or(0);
                    return Err(Error::WorkdirLocked(pid));
                }
            }
        }

        // Diagnostics only: a stale pid from a crashed run is expected here,
        // since the kernel already released that process's lock.
        if let Some(old_pid) = read_lock_pid(&mut file) {
            if old_pid != std::process::id() && !pid_alive(old_pid) {
                debug!("clearing stale lock pid {old_pid}");
            }
        }
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        debug!("acquired work dir lock at {}", path.display());
        Ok(WorkDirLock { file, path })
    }
}

/// Held work-dir lock; released on drop
#[derive(Debug)]
pub struct WorkDirLock {
    file: File,
    path: PathBuf,
}

impl WorkDirLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkDirLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!("failed to release work dir lock: {e}");
        }
    }
}

fn read_lock_pid(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}

fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Ordered migration steps: (target version, description, step).
/// Each step must be idempotent; re-running on an already-migrated tree is a
/// no-op. Steps below the on-disk version are skipped.
type MigrationFn = fn(&Path) -> Result<()>;

const MIGRATIONS: &[(u32, &str, MigrationFn)] = &[
    (5, "rename packages/edge to packages/master", migrate_packages_edge),
    (6, "split apk cache per architecture", migrate_split_apk_cache),
    (7, "drop obsolete chroot_buildroot_armel tree", migrate_drop_armel),
];

fn migrate_packages_edge(root: &Path) -> Result<()> {
    let old = root.join("packages/edge");
    let new = root.join("packages/master");
    if old.is_dir() && !new.exists() {
        fs::rename(&old, &new)?;
    }
    Ok(())
}

fn migrate_split_apk_cache(root: &Path) -> Result<()> {
    // Pre-v6 layouts shared one cache; moving it under the native arch keeps
    // already-downloaded apks usable.
    let old = root.join("cache_apk");
    if old.is_dir() {
        let new = root.join(format!("cache_apk_{}", Arch::native()));
        if !new.exists() {
            fs::rename(&old, &new)?;
        }
    }
    Ok(())
}

fn migrate_drop_armel(root: &Path) -> Result<()> {
    let old = root.join("chroot_buildroot_armel");
    if old.is_dir() {
        fs::remove_dir_all(&old)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_stamps_current_version() {
        let dir = tempdir().unwrap();
        let work = WorkDir::new(dir.path().join("work"));
        work.init().unwrap();
        assert_eq!(work.read_version().unwrap(), FORMAT_VERSION);
        assert_eq!(work.migrate().unwrap(), 0);
    }

    #[test]
    fn test_migrate_from_older_version() {
        let dir = tempdir().unwrap();
        let work = WorkDir::new(dir.path().join("work"));
        work.init().unwrap();
        fs::write(work.version_file(), format!("{}\n", FORMAT_VERSION - 1)).unwrap();

        let applied = work.migrate().unwrap();
        assert!(applied >= 1);
        assert_eq!(work.read_version().unwrap(), FORMAT_VERSION);
    }

    #[test]
    fn test_future_version_is_fatal() {
        let dir = tempdir().unwrap();
        let work = WorkDir::new(dir.path().join("work"));
        work.init().unwrap();
        fs::write(work.version_file(), format!("{}\n", FORMAT_VERSION + 1)).unwrap();

        let err = work.migrate().unwrap_err();
        assert_eq!(err.tag(), "WorkdirFromFuture");
    }

    #[test]
    fn test_packages_edge_migration_idempotent() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("packages/edge")).unwrap();

        migrate_packages_edge(dir.path()).unwrap();
        assert!(dir.path().join("packages/master").is_dir());
        assert!(!dir.path().join("packages/edge").exists());

        // Second run is a no-op
        migrate_packages_edge(dir.path()).unwrap();
        assert!(dir.path().join("packages/master").is_dir());
    }

    #[test]
    fn test_lock_writes_pid() {
        let dir = tempdir().unwrap();
        let work = WorkDir::new(dir.path().join("work"));
        let lock = work.lock(false).unwrap();

        let content = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();
        let work = WorkDir::new(dir.path().join("work"));
        drop(work.lock(false).unwrap());
        // Re-acquiring in the same process must succeed after release
        let _again = work.lock(false).unwrap();
    }

    #[test]
    fn test_layout_paths() {
        let work = WorkDir::new("/w");
        assert_eq!(work.chroot_native(), PathBuf::from("/w/chroot_native"));
        assert_eq!(
            work.chroot_buildroot(Arch::Armv7),
            PathBuf::from("/w/chroot_buildroot_armv7")
        );
        assert_eq!(work.packages(Arch::X86_64), PathBuf::from("/w/packages/x86_64"));
        assert_eq!(work.cache_apk(Arch::Aarch64), PathBuf::from("/w/cache_apk_aarch64"));
    }
}
