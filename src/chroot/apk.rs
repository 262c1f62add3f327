// src/chroot/apk.rs

//! apk operations inside a chroot
//!
//! Wraps the `apk` binary that lives inside each chroot: package
//! installation with the add/del split (`!name` removes), explicit-install
//! marking through a virtual meta-package, local-package path substitution,
//! the installed-database query, and the once-per-invocation repository
//! list and minimum-version checks.

use crate::chroot::{ChrootId, ChrootManager};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::parse::apkindex::{self, IndexEntry};
use crate::runner::{CommandSpec, OutputMode, StdinSource};
use crate::version::ApkVersion;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Oldest apk-tools the tool is known to work with. Chroots carrying an
/// older one predate the work-dir format and need a zap.
const MIN_APK_VERSION: &str = "2.12.0";

/// Virtual package used to mark only the requested packages as explicitly
/// installed, not their dependencies.
const VIRTUAL_MARKER: &str = ".pmbootstrap";

/// In-chroot path where the local package repository is bound
pub const PACKAGES_MOUNT: &str = "/mnt/pmbootstrap/packages";

/// Sort a package list into additions and removals. A leading `!` requests
/// removal of the named package.
pub fn split_to_add_del(packages: &[String]) -> (Vec<String>, Vec<String>) {
    let mut to_add = Vec::new();
    let mut to_del = Vec::new();
    for package in packages {
        match package.strip_prefix('!') {
            Some(name) => to_del.push(name.to_string()),
            None => to_add.push(package.clone()),
        }
    }
    (to_add, to_del)
}

/// Install packages into a chroot. `local_paths` maps pkgnames built into
/// the local repository to their in-chroot apk paths; apk only re-installs
/// a same-version rebuild when given the absolute path.
pub fn install(
    ctx: &Context,
    id: &ChrootId,
    packages: &[String],
    local_paths: &HashMap<String, String>,
) -> Result<()> {
    if packages.is_empty() {
        debug!("({id}) install called with empty package list, ignoring");
        return Ok(());
    }

    let (to_add, to_del) = split_to_add_del(packages);

    // apk option injection through package names is not a thing we allow
    for name in to_add.iter().chain(to_del.iter()) {
        if name.starts_with('-') {
            return Err(Error::UsageError(format!("invalid package name: {name}")));
        }
    }

    let manager = ChrootManager::new(ctx);
    manager.mount(id)?;
    let result = install_mounted(ctx, &manager, id, local_paths, &to_add, &to_del);

    // Balance the acquisition taken above; the mounts stay live while any
    // outer caller still holds the chroot.
    manager.unmount(id)?;
    result
}

fn install_mounted(
    ctx: &Context,
    manager: &ChrootManager,
    id: &ChrootId,
    local_paths: &HashMap<String, String>,
    to_add: &[String],
    to_del: &[String],
) -> Result<()> {
    check_min_version(ctx, id)?;

    let installed_now = installed(ctx, id)?;
    let new: Vec<&String> = to_add
        .iter()
        .filter(|name| !installed_now.contains_key(*name))
        .collect();
    if !new.is_empty() {
        info!(
            "({id}) install {}",
            new.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" ")
        );
    }

    let with_paths: Vec<String> = to_add
        .iter()
        .map(|name| local_paths.get(name).cloned().unwrap_or_else(|| name.clone()))
        .collect();

    // When local paths are substituted, a virtual package keeps only the
    // requested names marked as explicitly installed.
    let mut commands: Vec<Vec<String>> = Vec::new();
    if with_paths != to_add {
        let mut mark = vec!["add".into(), "-u".into(), "--virtual".into(), VIRTUAL_MARKER.into()];
        mark.extend(to_add.iter().cloned());
        commands.push(mark);

        let mut add = vec!["add".into()];
        add.extend(with_paths);
        commands.push(add);

        commands.push(vec!["del".into(), VIRTUAL_MARKER.into()]);
    } else if !to_add.is_empty() {
        let mut add = vec!["add".into()];
        add.extend(to_add.iter().cloned());
        commands.push(add);
    }
    if !to_del.is_empty() {
        let mut del = vec!["del".into()];
        del.extend(to_del.iter().cloned());
        commands.push(del);
    }

    for command in commands {
        let mut argv: Vec<String> = vec!["apk".into(), "--no-progress".into()];
        if ctx.offline {
            argv.push("--no-network".into());
        }
        argv.extend(command);
        manager.run_spec(id, CommandSpec::new(argv).output(OutputMode::StreamToLog))?;
    }
    Ok(())
}

/// Read the chroot's installed-package database. The format matches
/// APKINDEX with extra keys, which the index parser tolerates.
pub fn installed(ctx: &Context, id: &ChrootId) -> Result<HashMap<String, IndexEntry>> {
    let path = id.dir(&ctx.work).join("lib/apk/db/installed");
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let entries = apkindex::parse_installed(&path)?;
    Ok(entries
        .into_iter()
        .map(|entry| (entry.pkgname.clone(), entry))
        .collect())
}

/// Check the chroot's apk-tools against the supported minimum, once per
/// chroot per invocation. Skipped when apk is not installed yet.
pub fn check_min_version(ctx: &Context, id: &ChrootId) -> Result<()> {
    let suffix = id.suffix();
    if ctx.apk_version_checked.lock().unwrap().contains(&suffix) {
        return Ok(());
    }
    if !id.dir(&ctx.work).join("sbin/apk").exists() {
        debug!("({id}) apk not installed yet, skipping version check");
        return Ok(());
    }

    let installed_db = installed(ctx, id)?;
    if let Some(apk_tools) = installed_db.get("apk-tools") {
        let minimum = ApkVersion::parse(MIN_APK_VERSION)?;
        if apk_tools.version < minimum {
            return Err(Error::Internal(format!(
                "({id}) apk-tools {} is older than the supported minimum {MIN_APK_VERSION}; \
                 delete the http cache and zap all chroots, then try again: 'pmbootstrap zap'",
                apk_tools.version
            )));
        }
    }

    ctx.apk_version_checked.lock().unwrap().insert(suffix);
    Ok(())
}

/// Bring `/etc/apk/repositories` up to date with the configured mirrors,
/// then re-read to verify. Cached per chroot per invocation so repeated
/// installs do not rewrite the file.
pub fn write_repository_list(ctx: &Context, id: &ChrootId) -> Result<()> {
    let suffix = id.suffix();
    if ctx.repositories_updated.lock().unwrap().contains(&suffix) {
        return Ok(());
    }

    let path = id.dir(&ctx.work).join("etc/apk/repositories");
    let wanted = repository_lines(ctx);
    if read_lines(&path) == wanted {
        ctx.repositories_updated.lock().unwrap().insert(suffix);
        return Ok(());
    }

    debug!("({id}) updating /etc/apk/repositories");
    ctx.runner.run(
        CommandSpec::new([
            "mkdir".to_string(),
            "-p".to_string(),
            path.parent().unwrap().display().to_string(),
        ])
        .as_root(true)
        .output(OutputMode::StreamToLog),
    )?;
    let content = wanted.join("\n") + "\n";
    ctx.runner.run(
        CommandSpec::new(["tee".to_string(), path.display().to_string()])
            .stdin(StdinSource::Bytes(content.into_bytes()))
            .as_root(true)
            .output(OutputMode::StreamToLog),
    )?;

    if read_lines(&path) != wanted {
        return Err(Error::Internal(format!(
            "failed to update {}",
            path.display()
        )));
    }
    ctx.repositories_updated.lock().unwrap().insert(suffix);
    Ok(())
}

/// The local repository first, so freshly built packages win over mirrors
fn repository_lines(ctx: &Context) -> Vec<String> {
    let mut lines = vec![PACKAGES_MOUNT.to_string()];
    lines.extend(ctx.config.mirror_urls());
    lines
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|content| content.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_to_add_del() {
        let (add, del) = split_to_add_del(&strings(&["hello-world", "!conflict", "busybox"]));
        assert_eq!(add, vec!["hello-world", "busybox"]);
        assert_eq!(del, vec!["conflict"]);
    }

    #[test]
    fn test_split_empty() {
        let (add, del) = split_to_add_del(&[]);
        assert!(add.is_empty());
        assert!(del.is_empty());
    }

    #[test]
    fn test_read_lines_missing_file() {
        assert!(read_lines(Path::new("/no/such/file")).is_empty());
    }
}
