// src/commands.rs
//! Command handlers for the pmbootstrap CLI

use anyhow::Result;
use pmbootstrap::build::{self, BuildOptions};
use pmbootstrap::chroot::{apk, ChrootId, ChrootManager, ChrootState};
use pmbootstrap::repo;
use pmbootstrap::runner::{CommandSpec, OutputMode};
use pmbootstrap::workdir::FORMAT_VERSION;
use pmbootstrap::{Arch, Config, Context};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

/// Options shared by every verb
pub struct Global {
    pub config_path: PathBuf,
    /// Wait quietly for the work-dir lock instead of failing fast
    pub quiet_wait: bool,
    pub offline: bool,
}

impl Global {
    fn context(&self) -> Result<Context> {
        let config = Config::load(&self.config_path)?;
        let mut ctx = Context::acquire(config, self.quiet_wait)?;
        ctx.offline = self.offline;
        Ok(ctx)
    }
}

/// Prepare the work dir, signing key, and persisted config
pub fn cmd_init(
    global: &Global,
    work: Option<PathBuf>,
    aports: Option<PathBuf>,
    device: Option<String>,
) -> Result<()> {
    let mut config = Config::load(&global.config_path)?;
    if let Some(work) = work {
        config.work = work;
    }
    if let Some(aports) = aports {
        config.aports = aports;
    }
    if let Some(device) = device {
        config.device = device;
    }
    config.save(&global.config_path)?;

    let mut ctx = Context::acquire(config, global.quiet_wait)?;
    ctx.offline = global.offline;
    let manager = ChrootManager::new(&ctx);
    build::ensure_signing_key(&ctx, &manager)?;
    ctx.shutdown()?;

    println!("work dir ready at {}", ctx.work.root().display());
    println!("config written to {}", global.config_path.display());
    Ok(())
}

/// Plan and build packages
pub fn cmd_build(
    global: &Global,
    packages: &[String],
    arch: Option<String>,
    force: bool,
    strict: bool,
    no_depends: bool,
    src: Option<PathBuf>,
) -> Result<()> {
    let arch = arch.map(|a| Arch::from_str(&a)).transpose()?;
    let ctx = global.context()?;

    let opts = BuildOptions {
        arch,
        force,
        strict,
        no_depends,
        src,
    };
    for pkgname in packages {
        let outcome = build::package(&ctx, pkgname, &opts)?;
        if outcome.already_built {
            println!("{}: already built for {}", outcome.pkgname, outcome.arch);
        } else {
            println!(
                "{}: built for {} ({})",
                outcome.pkgname,
                outcome.arch,
                outcome.strategy.map(|s| s.as_str()).unwrap_or("native")
            );
        }
    }
    ctx.shutdown()?;
    Ok(())
}

/// Enter a chroot and run a command (or a login shell)
pub fn cmd_chroot(
    global: &Global,
    arch: Option<String>,
    user: bool,
    command: &[String],
) -> Result<()> {
    let ctx = global.context()?;
    let id = match arch {
        Some(tag) => {
            let arch = Arch::from_str(&tag)?;
            ChrootId::for_build(arch)
        }
        None => ChrootId::Native,
    };

    let manager = ChrootManager::new(&ctx);
    manager.mount(&id)?;

    let argv: Vec<&str> = if command.is_empty() {
        vec!["/bin/sh"]
    } else {
        command.iter().map(String::as_str).collect()
    };

    let spec = CommandSpec::new(argv).output(OutputMode::TeeToTerminal);
    if user {
        manager.run_user_spec(&id, spec)?;
    } else {
        manager.run_spec(&id, spec)?;
    }

    manager.unmount(&id)?;
    ctx.shutdown()?;
    Ok(())
}

/// Destroy chroots; optionally purge packages and caches
pub fn cmd_zap(global: &Global, packages: bool, apk_cache: bool, other_caches: bool) -> Result<()> {
    let ctx = global.context()?;
    ctx.shutdown()?;

    let manager = ChrootManager::new(&ctx);
    let zapped = manager.zap_all()?;
    for name in &zapped {
        println!("removed {name}");
    }

    let work = ctx.work.root();
    let mut purged: Vec<PathBuf> = Vec::new();
    if packages {
        purged.push(work.join("packages"));
    }
    for entry in std::fs::read_dir(work)?.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if apk_cache && name.starts_with("cache_apk_") {
            purged.push(entry.path());
        }
        if other_caches && (name == "cache_git" || name == "apk.static") {
            purged.push(entry.path());
        }
    }
    for path in purged {
        if path.exists() {
            info!("purging {}", path.display());
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
    }
    Ok(())
}

/// Regenerate the local repository indexes for every arch present
pub fn cmd_index(global: &Global) -> Result<()> {
    let ctx = global.context()?;
    let manager = ChrootManager::new(&ctx);

    let packages_root = ctx.work.root().join("packages");
    if packages_root.is_dir() {
        for entry in std::fs::read_dir(&packages_root)?.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Ok(arch) = Arch::from_str(&name) {
                build::index_repo(&ctx, &manager, arch)?;
            }
        }
    }
    ctx.shutdown()?;
    Ok(())
}

/// List aports with no matching binary package
pub fn cmd_repo_missing(global: &Global, arch: Option<String>) -> Result<()> {
    let arch = match arch {
        Some(tag) => Arch::from_str(&tag)?,
        None => Arch::native(),
    };
    let ctx = global.context()?;
    for pkgname in repo::repo_missing(&ctx, arch, !global.offline)? {
        println!("{pkgname}");
    }
    Ok(())
}

/// Bump pkgrel for outdated binaries
pub fn cmd_pkgrel_bump(
    global: &Global,
    packages: &[String],
    auto: bool,
    dry: bool,
) -> Result<()> {
    if packages.is_empty() && !auto {
        // Typed so the dispatcher maps this to the usage exit code
        return Err(pmbootstrap::Error::UsageError(
            "specify packages to bump, or use --auto".to_string(),
        )
        .into());
    }
    let ctx = global.context()?;
    let bumped = repo::pkgrel_bump(&ctx, Arch::native(), packages, auto, dry)?;
    for pkgname in &bumped {
        println!("{}{pkgname}", if dry { "would bump " } else { "bumped " });
    }
    if bumped.is_empty() {
        println!("nothing to bump");
    }
    Ok(())
}

/// Release all mounts and drop the lock
pub fn cmd_shutdown(global: &Global) -> Result<()> {
    let ctx = global.context()?;
    ctx.shutdown()?;
    println!("all mounts released");
    Ok(())
}

/// Run pending work-dir migrations (context acquisition migrates)
pub fn cmd_work_migrate(global: &Global) -> Result<()> {
    let ctx = global.context()?;
    println!(
        "work dir {} is at format version {FORMAT_VERSION}",
        ctx.work.root().display()
    );
    Ok(())
}

/// Print a health and configuration summary
pub fn cmd_status(global: &Global) -> Result<()> {
    let config = Config::load(&global.config_path)?;
    let native = Arch::native();
    println!("host:     {} ({})", native, native.kernel_name());
    println!("config:   {}", global.config_path.display());
    println!("work:     {}", config.work.display());
    println!("aports:   {}", config.aports.display());
    println!("device:   {}", config.device);
    println!("ui:       {}", config.ui);
    println!("jobs:     {}", config.jobs);

    let ctx = global.context()?;
    let manager = ChrootManager::new(&ctx);
    let mut chroots: Vec<(ChrootId, ChrootState)> = vec![ChrootId::Native]
        .into_iter()
        .map(|id| {
            let state = manager.state(&id);
            (id, state)
        })
        .collect();
    for entry in std::fs::read_dir(ctx.work.root())?.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(rest) = name.strip_prefix("chroot_buildroot_") {
            if let Ok(arch) = Arch::from_str(rest) {
                let id = ChrootId::Buildroot(arch);
                let state = manager.state(&id);
                chroots.push((id, state));
            }
        }
    }
    for (id, state) in chroots {
        println!("chroot:   {id} ({state:?})");
    }

    let installed = apk::installed(&ctx, &ChrootId::Native)?;
    println!("packages installed in native chroot: {}", installed.len());
    Ok(())
}
