// src/context.rs

//! Per-invocation context
//!
//! One `Context` is created per command invocation and passed explicitly to
//! every component; there are no ambient globals apart from kernel signal
//! state. Construction acquires the work-dir lock and runs pending format
//! migrations; drop releases recorded mounts and then the lock, on every
//! exit path including panics.

use crate::chroot::mount::MountRegistry;
use crate::config::Config;
use crate::error::Result;
use crate::runner::Runner;
use crate::workdir::{WorkDir, WorkDirLock};
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug)]
pub struct Context {
    pub config: Config,
    pub work: WorkDir,
    pub runner: Runner,
    pub mounts: Mutex<MountRegistry>,
    /// Skip network access; apk runs with --no-network
    pub offline: bool,
    /// Chroots whose apk-tools minimum version was verified this invocation
    pub apk_version_checked: Mutex<HashSet<String>>,
    /// Chroots whose /etc/apk/repositories was brought up to date
    pub repositories_updated: Mutex<HashSet<String>>,
    // Held until drop; field order keeps the lock alive through teardown
    _lock: WorkDirLock,
}

impl Context {
    /// Build the context: init + lock + migrate the work dir, open the log
    pub fn acquire(config: Config, wait_for_lock: bool) -> Result<Context> {
        config.validate()?;
        let work = WorkDir::new(&config.work);
        work.init()?;
        let lock = work.lock(wait_for_lock)?;
        work.migrate()?;
        let runner = Runner::new(&work.log_file())?;

        // Heal mounts left behind by an aborted earlier run before doing
        // anything else with the work dir.
        let mut mounts = MountRegistry::new();
        mounts.shutdown(&runner, work.root())?;

        Ok(Context {
            config,
            work,
            runner,
            mounts: Mutex::new(mounts),
            offline: false,
            apk_version_checked: Mutex::new(HashSet::new()),
            repositories_updated: Mutex::new(HashSet::new()),
            _lock: lock,
        })
    }

    /// Release all recorded mounts plus any stray mount under the work dir
    pub fn shutdown(&self) -> Result<()> {
        let mut mounts = self.mounts.lock().unwrap();
        mounts.shutdown(&self.runner, self.work.root())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Teardown must run on every exit path; errors here are logged, not
        // propagated, because drop cannot fail.
        if let Ok(mut mounts) = self.mounts.lock() {
            if let Err(e) = mounts.shutdown(&self.runner, self.work.root()) {
                warn!("mount cleanup during teardown failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.work = dir.join("work");
        config.aports = dir.join("aports");
        config
    }

    #[test]
    fn test_acquire_initializes_workdir() {
        let dir = tempdir().unwrap();
        let ctx = Context::acquire(test_config(dir.path()), false).unwrap();
        assert!(ctx.work.version_file().exists());
        assert!(ctx.work.lock_file().exists());
    }

    #[test]
    fn test_second_context_sees_lock() {
        let dir = tempdir().unwrap();
        let _first = Context::acquire(test_config(dir.path()), false).unwrap();
        // flock is per open file description, so a second acquire conflicts
        // even within one process.
        let err = Context::acquire(test_config(dir.path()), false).unwrap_err();
        assert_eq!(err.tag(), "WorkdirLocked");
    }
}
