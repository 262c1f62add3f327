// src/build/mod.rs

//! Build planning and execution
//!
//! Turns a (pkgname, arch) target into a finished apk in the local
//! repository: recipe lookup, arch validation, freshness check, dependency
//! closure with recursive rebuilds, cross-strategy selection, chroot
//! preparation, source staging and checksum verification, the abuild
//! invocation, and the atomic commit plus index rebuild. A failed build
//! leaves the chroot mounted and marked contaminated for inspection.

use crate::arch::Arch;
use crate::chroot::{apk, ChrootId, ChrootManager};
use crate::chroot::mount::{MountKind, MountRecord};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::parse::apkbuild::Apkbuild;
use crate::repo::{self, aports, PackageDb, PackageSource};
use crate::resolver::{self, Resolution};
use crate::runner::{CommandSpec, OutputMode};
use crate::sudo;
use crate::version::Dependency;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Packages every build chroot needs besides the dependency closure
const BUILD_PACKAGES: &[&str] = &["abuild", "build-base", "ccache"];

/// Where a make-depends cycle names a package, this table supplies the
/// bootstrap recipe that must be built first to break the cycle.
const BOOTSTRAP_ORDER: &[(&str, &str)] = &[
    ("gcc", "gcc-pass2"),
    ("musl", "musl-bootstrap"),
    ("binutils", "binutils-pass1"),
];

/// Wall-clock ceiling for one abuild phase
const BUILD_TIMEOUT: Duration = Duration::from_secs(4 * 3600);

/// How a target gets compiled for its architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Target arch equals the host arch
    Native,
    /// Cross compiler in the native chroot, no emulation
    CrossDirect,
    /// Build under QEMU, compilation offloaded to native distcc
    DistccQemu,
    /// Full emulation fallback
    QemuOnly,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Native => "native",
            Strategy::CrossDirect => "cross-direct",
            Strategy::DistccQemu => "distcc+qemu",
            Strategy::QemuOnly => "qemu-only",
        }
    }
}

/// Options from the `build` verb
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub arch: Option<Arch>,
    pub force: bool,
    /// Let abuild verify and install dependencies itself
    pub strict: bool,
    /// Skip the dependency closure entirely
    pub no_depends: bool,
    /// Build from this source tree instead of the recipe's sources
    pub src: Option<PathBuf>,
}

/// What a build request produced
#[derive(Debug)]
pub struct BuildOutcome {
    pub pkgname: String,
    pub arch: Arch,
    /// Unset when the existing binary was already current
    pub strategy: Option<Strategy>,
    pub already_built: bool,
}

/// Build one package (and whatever parts of its closure need rebuilding)
pub fn package(ctx: &Context, pkgname: &str, opts: &BuildOptions) -> Result<BuildOutcome> {
    let arch = opts.arch.unwrap_or_else(Arch::native);
    let mut stack = Vec::new();
    package_inner(ctx, pkgname, arch, opts, &mut stack)
}

fn package_inner(
    ctx: &Context,
    pkgname: &str,
    arch: Arch,
    opts: &BuildOptions,
    stack: &mut Vec<String>,
) -> Result<BuildOutcome> {
    // Step 1: recipe lookup
    let recipe = aports::find(&ctx.config.aports, pkgname, arch)?;

    // Step 2: arch validation
    if !recipe.supports_arch(arch) && !opts.force {
        return Err(Error::UnsupportedArch {
            pkgname: recipe.pkgname.clone(),
            arch: arch.to_string(),
            arch_list: recipe.arch.join(" "),
        });
    }

    let db = PackageDb::load(ctx, arch, true)?;

    // Step 3: freshness
    if !opts.force && is_built(ctx, &db, &recipe, arch, opts)? {
        debug!("{}: binary is up to date for {arch}", recipe.pkgname);
        return Ok(BuildOutcome {
            pkgname: recipe.pkgname.clone(),
            arch,
            strategy: None,
            already_built: true,
        });
    }

    info!("building {} for {arch}", recipe.pkgname);
    stack.push(recipe.pkgname.clone());

    // Step 4: dependency closure, rebuilding stale members first
    let resolution = if opts.no_depends {
        Resolution::default()
    } else {
        let closure = resolve_closure(&db, &recipe)?;
        build_stale_members(ctx, &db, &closure, arch, opts, stack)?;
        closure
    };

    // Step 5: strategy
    let strategy = select_strategy(ctx, &recipe, arch);
    info!("{}: strategy {}", recipe.pkgname, strategy.as_str());

    // Step 6: chroot preparation
    let chroot = match strategy {
        Strategy::Native | Strategy::CrossDirect => ChrootId::Native,
        Strategy::DistccQemu | Strategy::QemuOnly => ChrootId::Buildroot(arch),
    };
    let manager = ChrootManager::new(ctx);
    if manager.is_contaminated(&chroot) {
        return Err(Error::BuildFailed {
            step: "prepare".to_string(),
            detail: format!(
                "chroot {chroot} is contaminated by an earlier failed build; \
                 inspect it and run 'pmbootstrap zap'"
            ),
        });
    }
    manager.mount(&chroot)?;
    prepare_chroot(ctx, &manager, &chroot, &strategy, arch, &resolution)?;

    // Steps 7-9 run with the chroot live; any failure leaves it mounted
    // and contaminated so the user can look inside.
    let result = build_in_chroot(ctx, &manager, &chroot, &recipe, &strategy, arch, opts);
    stack.pop();
    match result {
        Ok(()) => {}
        Err(e) => {
            let _ = manager.mark_contaminated(&chroot);
            return Err(e);
        }
    }

    Ok(BuildOutcome {
        pkgname: recipe.pkgname.clone(),
        arch,
        strategy: Some(strategy),
        already_built: false,
    })
}

/// Steps 7-9: staging, invocation, commit
fn build_in_chroot(
    ctx: &Context,
    manager: &ChrootManager,
    chroot: &ChrootId,
    recipe: &Apkbuild,
    strategy: &Strategy,
    arch: Arch,
    opts: &BuildOptions,
) -> Result<()> {
    verify_local_sources(recipe)?;
    let build_dir = stage_sources(ctx, manager, chroot, recipe, opts)?;

    let env = build_env(ctx, recipe, strategy, arch)?;
    run_abuild(manager, chroot, recipe, strategy, &build_dir, &env, opts)?;

    commit(ctx, manager, chroot, recipe, arch, opts)
}

/// Resolve runtime, make, and (unless `!check`) check dependencies
fn resolve_closure(db: &PackageDb, recipe: &Apkbuild) -> Result<Resolution> {
    let mut roots: Vec<Dependency> = Vec::new();
    roots.extend(recipe.depends.iter().cloned());
    roots.extend(recipe.makedepends.iter().cloned());
    if !recipe.has_option("!check") {
        roots.extend(recipe.checkdepends.iter().cloned());
    }
    resolver::resolve(db, &roots)
}

/// Closure members chosen from aports without a current binary must be
/// built first. Make-depends cycles consult the bootstrap table.
fn build_stale_members(
    ctx: &Context,
    db: &PackageDb,
    closure: &Resolution,
    arch: Arch,
    opts: &BuildOptions,
    stack: &mut Vec<String>,
) -> Result<()> {
    let dep_opts = BuildOptions {
        arch: Some(arch),
        // Target-only options do not propagate into the closure
        force: false,
        src: None,
        ..opts.clone()
    };

    for name in closure.names() {
        let selection = &closure.chosen[name];
        if selection.source != PackageSource::Aport {
            continue;
        }
        let has_binary = db
            .best_index_entry(name)
            .is_some_and(|entry| entry.version == selection.version);
        if has_binary {
            continue;
        }

        let origin = selection.origin.clone().unwrap_or_else(|| name.to_string());
        if stack.contains(&origin) {
            // A make-depends cycle: break it via the bootstrap ordering or
            // report it with the cycle named.
            let mut cycle = stack.clone();
            cycle.push(origin.clone());
            let bootstrap = BOOTSTRAP_ORDER
                .iter()
                .find(|(name, _)| *name == origin)
                .map(|(_, pass)| *pass);
            match bootstrap {
                Some(pass) if !stack.iter().any(|s| s == pass) => {
                    info!("breaking bootstrap cycle for {origin} via {pass}");
                    package_inner(ctx, pass, arch, &dep_opts, stack)?;
                    continue;
                }
                _ => return Err(Error::BootstrapRequired { cycle }),
            }
        }

        debug!("closure member {origin} needs a rebuild first");
        package_inner(ctx, &origin, arch, &dep_opts, stack)?;
    }
    Ok(())
}

/// Step 5: deterministic strategy choice. Preference order: native,
/// cross-direct, distcc+qemu, plain QEMU.
fn select_strategy(ctx: &Context, recipe: &Apkbuild, arch: Arch) -> Strategy {
    if arch == Arch::native() {
        return Strategy::Native;
    }
    if !recipe.has_option("!cross") && cross_aports_available(ctx, arch) {
        return Strategy::CrossDirect;
    }
    if !recipe.has_option("!distcc") {
        return Strategy::DistccQemu;
    }
    Strategy::QemuOnly
}

/// Cross-direct requires the full cross toolchain as aports
fn cross_aports_available(ctx: &Context, arch: Arch) -> bool {
    ["gcc", "binutils", "musl-dev"].iter().all(|tool| {
        aports::find_optional(
            &ctx.config.aports,
            &format!("{tool}-{arch}"),
            Arch::native(),
        )
        .map(|found| found.is_some())
        .unwrap_or(false)
    })
}

/// Step 3 support: an existing binary counts as current when its version
/// matches the recipe, its recorded depends are still satisfiable, and
/// the source fingerprint is unchanged.
fn is_built(
    ctx: &Context,
    db: &PackageDb,
    recipe: &Apkbuild,
    arch: Arch,
    opts: &BuildOptions,
) -> Result<bool> {
    let version = recipe.version()?;
    let local = repo::local_index(ctx, arch)?;
    let Some(entry) = local
        .iter()
        .find(|e| e.pkgname == recipe.pkgname && e.version == version)
    else {
        return Ok(false);
    };

    for dep in &entry.depends {
        if dep.conflict {
            continue;
        }
        let satisfiable = db
            .providers(&dep.name)
            .iter()
            .any(|c| dep.constraint.satisfies(&c.version));
        if !satisfiable {
            debug!(
                "{}: dependency {dep} of the existing binary is unsatisfiable",
                recipe.pkgname
            );
            return Ok(false);
        }
    }

    let stored = fs::read_to_string(fingerprint_path(ctx, arch, &recipe.pkgname)).ok();
    let current = fingerprint(recipe, opts)?;
    Ok(stored.as_deref() == Some(current.as_str()))
}

/// The freshness fingerprint: version, local source hashes, and (for
/// `--src`) a content hash over the override tree.
fn fingerprint(recipe: &Apkbuild, opts: &BuildOptions) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(recipe.version()?.to_string().as_bytes());

    for source in &recipe.source {
        if source.is_remote() {
            // Remote sources are pinned by their recorded sha512sums
            continue;
        }
        let path = recipe.path.join(&source.filename);
        hasher.update(source.filename.as_bytes());
        if let Ok(content) = fs::read(&path) {
            hasher.update(&content);
        }
    }

    if let Some(src) = &opts.src {
        hash_tree(&mut hasher, src)?;
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn hash_tree(hasher: &mut Sha256, root: &Path) -> Result<()> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    for path in files {
        hasher.update(path.to_string_lossy().as_bytes());
        let mut file = fs::File::open(&path)?;
        std::io::copy(&mut file, hasher)?;
    }
    Ok(())
}

fn fingerprint_path(ctx: &Context, arch: Arch, pkgname: &str) -> PathBuf {
    ctx.work
        .packages(arch)
        .join(format!(".fingerprint-{pkgname}"))
}

/// Step 6 support: install the closure plus build tooling, start helper
/// daemons, and wire up the cross sysroot.
fn prepare_chroot(
    ctx: &Context,
    manager: &ChrootManager,
    chroot: &ChrootId,
    strategy: &Strategy,
    arch: Arch,
    resolution: &Resolution,
) -> Result<()> {
    let mut packages: Vec<String> = BUILD_PACKAGES.iter().map(|s| s.to_string()).collect();
    match strategy {
        Strategy::CrossDirect => {
            // Host tools stay native; the dependency closure is target-arch
            // and lands in the foreign buildroot below.
            for tool in ["gcc", "binutils", "musl-dev"] {
                packages.push(format!("{tool}-{arch}"));
            }
        }
        Strategy::DistccQemu => {
            packages.push("distcc".to_string());
            packages.extend(resolution.names().iter().map(|s| s.to_string()));
        }
        _ => packages.extend(resolution.names().iter().map(|s| s.to_string())),
    }

    // Locally built dependencies install by path so apk picks up rebuilds
    // of the same version.
    let local = repo::local_index(ctx, arch)?;
    let mut local_paths = HashMap::new();
    for entry in &local {
        local_paths.insert(
            entry.pkgname.clone(),
            format!(
                "{}/{arch}/{}-{}.apk",
                apk::PACKAGES_MOUNT,
                entry.pkgname,
                entry.version
            ),
        );
    }

    apk::install(ctx, chroot, &packages, &local_paths)?;

    match strategy {
        Strategy::CrossDirect => {
            // Reverse /native: the foreign buildroot holds the target-arch
            // dependency closure and is bound into the native build as the
            // cross sysroot.
            let buildroot = ChrootId::Buildroot(arch);
            manager.mount(&buildroot)?;
            let target_closure: Vec<String> =
                resolution.names().iter().map(|s| s.to_string()).collect();
            apk::install(ctx, &buildroot, &target_closure, &local_paths)?;

            let target = chroot
                .dir(&ctx.work)
                .join(format!("mnt/pmbootstrap/sysroot_{arch}"));
            let mut mounts = ctx.mounts.lock().unwrap();
            if !mounts.targets(&chroot.suffix()).contains(&target) {
                mounts.mount(
                    &ctx.runner,
                    MountRecord {
                        chroot: chroot.suffix(),
                        source: buildroot.dir(&ctx.work),
                        target,
                        kind: MountKind::Bind,
                    },
                )?;
            }
        }
        Strategy::DistccQemu => {
            // Compilers run natively; the emulated chroot offloads to them
            apk::install(ctx, &ChrootId::Native, &["distcc".to_string()], &HashMap::new())?;
            manager.run(
                &ChrootId::Native,
                &[
                    "sh",
                    "-c",
                    "pgrep distccd >/dev/null || distccd --daemon --listen 127.0.0.1 \
                     --allow 127.0.0.1 --port 3632",
                ],
                OutputMode::StreamToLog,
            )?;
        }
        _ => {}
    }
    Ok(())
}

/// Verify every local source file against its recorded sha512 before it
/// is staged. No apk is committed past a mismatch.
fn verify_local_sources(recipe: &Apkbuild) -> Result<()> {
    for source in &recipe.source {
        if source.is_remote() {
            continue;
        }
        let Some((want, _)) = recipe
            .sha512sums
            .iter()
            .find(|(_, name)| name == &source.filename)
        else {
            warn!("{}: no sha512 recorded for {}", recipe.pkgname, source.filename);
            continue;
        };

        let path = recipe.path.join(&source.filename);
        let mut file = fs::File::open(&path)?;
        let mut hasher = Sha512::new();
        std::io::copy(&mut file, &mut hasher)?;
        let got = format!("{:x}", hasher.finalize());

        if &got != want {
            return Err(Error::ChecksumMismatch {
                file: source.filename.clone(),
                want: want.clone(),
                got,
            });
        }
    }
    Ok(())
}

/// Step 7: copy the aport into the chroot's build area; with `--src`, bind
/// the override tree in and patch the staged recipe to skip fetching.
fn stage_sources(
    ctx: &Context,
    manager: &ChrootManager,
    chroot: &ChrootId,
    recipe: &Apkbuild,
    opts: &BuildOptions,
) -> Result<String> {
    let user = sudo::chroot_user();
    let build_dir = format!("/home/{user}/build/{}", recipe.pkgname);
    let host_dir = chroot
        .dir(&ctx.work)
        .join(build_dir.trim_start_matches('/'));

    manager.run(
        chroot,
        &["rm", "-rf", &build_dir],
        OutputMode::StreamToLog,
    )?;
    ctx.runner.run(
        CommandSpec::new([
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "mkdir -p {parent} && cp -r {aport} {dest}",
                parent = host_dir.parent().unwrap().display(),
                aport = recipe.path.display(),
                dest = host_dir.display(),
            ),
        ])
        .as_root(true)
        .output(OutputMode::StreamToLog),
    )?;

    if let Some(src) = &opts.src {
        let target = chroot.dir(&ctx.work).join("mnt/pmbootstrap/src");
        let mut mounts = ctx.mounts.lock().unwrap();
        mounts.mount(
            &ctx.runner,
            MountRecord {
                chroot: chroot.suffix(),
                source: src.clone(),
                target,
                kind: MountKind::Bind,
            },
        )?;
        drop(mounts);

        // Later assignments win in shell; appending overrides the staged
        // recipe without touching the aports checkout.
        let overrides = "\n# pmbootstrap --src override\n\
             source=\"\"\nsha512sums=\"\"\nbuilddir=\"/mnt/pmbootstrap/src\"\n";
        manager.run(
            chroot,
            &[
                "sh",
                "-c",
                &format!("printf '%s' '{overrides}' >> {build_dir}/APKBUILD"),
            ],
            OutputMode::StreamToLog,
        )?;
    }

    manager.run(
        chroot,
        &["chown", "-R", &user, &format!("/home/{user}/build")],
        OutputMode::StreamToLog,
    )?;
    Ok(build_dir)
}

/// Step 8 support: the environment one strategy needs
fn build_env(
    ctx: &Context,
    recipe: &Apkbuild,
    strategy: &Strategy,
    arch: Arch,
) -> Result<Vec<(String, String)>> {
    let mut env: Vec<(String, String)> = vec![
        ("MAKEFLAGS".into(), format!("-j{}", ctx.config.jobs)),
        ("REPODEST".into(), repodest()),
    ];

    // Reproducible builds: stamp from the recipe, not the wall clock
    let epoch = fs::metadata(recipe.apkbuild_path())
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    env.push(("SOURCE_DATE_EPOCH".into(), epoch.to_string()));

    if ctx.config.ccache {
        env.push(("USE_CCACHE".into(), "1".into()));
        env.push(("CCACHE_MAXSIZE".into(), ctx.config.ccache_size.clone()));
    }

    match strategy {
        Strategy::Native | Strategy::QemuOnly => {}
        Strategy::CrossDirect => {
            let hostspec = arch.hostspec();
            env.push(("CHOST".into(), hostspec.into()));
            env.push(("CTARGET".into(), hostspec.into()));
            env.push(("CBUILD".into(), Arch::native().hostspec().into()));
            env.push(("CROSS_COMPILE".into(), format!("{hostspec}-")));
            env.push((
                "CBUILDROOT".into(),
                format!("/mnt/pmbootstrap/sysroot_{arch}"),
            ));
        }
        Strategy::DistccQemu => {
            env.push(("DISTCC_HOSTS".into(), "127.0.0.1:3632".into()));
            env.push((
                "PATH".into(),
                "/usr/lib/distcc/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"
                    .into(),
            ));
        }
    }
    Ok(env)
}

fn repodest() -> String {
    format!("/home/{}/packages", sudo::chroot_user())
}

/// Step 8: abuild phases as the unprivileged user.
///
/// The one failure class the planner absorbs: a failing check phase under
/// emulation, where test suites routinely trip over QEMU rather than the
/// package. Everything else propagates.
fn run_abuild(
    manager: &ChrootManager,
    chroot: &ChrootId,
    recipe: &Apkbuild,
    strategy: &Strategy,
    build_dir: &str,
    env: &[(String, String)],
    opts: &BuildOptions,
) -> Result<()> {
    let mut flags = String::new();
    if !opts.strict {
        flags.push_str(" -d");
    }
    if opts.force {
        flags.push_str(" -f");
    }

    let mut phases: Vec<(&str, &str)> = vec![("build", "unpack prepare build")];
    if !recipe.has_option("!check") {
        phases.push(("check", "check"));
    }
    phases.push(("package", "rootpkg"));

    let emulated = matches!(strategy, Strategy::DistccQemu | Strategy::QemuOnly);
    for (step, phase) in phases {
        let script = format!("cd {build_dir} && abuild{flags} {phase}");
        let mut spec = CommandSpec::new(["sh".to_string(), "-c".to_string(), script])
            .output(OutputMode::StreamToLog)
            .timeout(BUILD_TIMEOUT);
        for (key, value) in env {
            spec = spec.env(key, value);
        }

        if let Err(e) = manager.run_user_spec(chroot, spec) {
            if step == "check" && emulated {
                warn!("{}: check phase failed under emulation, continuing: {e}", recipe.pkgname);
                continue;
            }
            return Err(Error::BuildFailed {
                step: step.to_string(),
                detail: e.to_string(),
            });
        }
    }
    Ok(())
}

/// Step 9: move the produced apks into the local repository, record the
/// fingerprint, and rebuild the signed index. Only then is the build
/// considered committed.
fn commit(
    ctx: &Context,
    manager: &ChrootManager,
    chroot: &ChrootId,
    recipe: &Apkbuild,
    arch: Arch,
    opts: &BuildOptions,
) -> Result<()> {
    let user = sudo::chroot_user();
    let out_root = chroot
        .dir(&ctx.work)
        .join(format!("home/{user}/packages"));

    let mut produced = Vec::new();
    for entry in WalkDir::new(&out_root).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "apk") {
            produced.push(path.to_path_buf());
        }
    }
    if produced.is_empty() {
        return Err(Error::BuildFailed {
            step: "commit".to_string(),
            detail: format!("abuild produced no apk under {}", out_root.display()),
        });
    }

    let packages_dir = ctx.work.packages(arch);
    fs::create_dir_all(&packages_dir)?;
    for apk_path in &produced {
        let name = apk_path.file_name().unwrap().to_string_lossy().into_owned();
        info!("committing {name}");
        ctx.runner.run(
            CommandSpec::new([
                "mv".to_string(),
                apk_path.display().to_string(),
                packages_dir.join(&name).display().to_string(),
            ])
            .as_root(true)
            .output(OutputMode::StreamToLog),
        )?;
    }

    fs::write(
        fingerprint_path(ctx, arch, &recipe.pkgname),
        fingerprint(recipe, opts)?,
    )?;

    index_repo(ctx, manager, arch)
}

/// Regenerate and sign the local repository index for one arch. The index
/// is produced by apk itself inside the native chroot; this tool never
/// writes APKINDEX bytes directly.
pub fn index_repo(ctx: &Context, manager: &ChrootManager, arch: Arch) -> Result<()> {
    let packages_dir = ctx.work.packages(arch);
    fs::create_dir_all(&packages_dir)?;

    let has_apks = fs::read_dir(&packages_dir)?
        .flatten()
        .any(|e| e.path().extension().is_some_and(|ext| ext == "apk"));
    if !has_apks {
        debug!("no packages for {arch}, skipping index");
        return Ok(());
    }

    manager.mount(&ChrootId::Native)?;
    apk::install(
        ctx,
        &ChrootId::Native,
        &["abuild".to_string()],
        &HashMap::new(),
    )?;
    let key = ensure_signing_key(ctx, manager)?;

    let script = format!(
        "cd {mount}/{arch} && apk -q index --output APKINDEX.tar.gz.new \
         --rewrite-arch {arch} *.apk && abuild-sign -k {key} APKINDEX.tar.gz.new \
         && mv APKINDEX.tar.gz.new APKINDEX.tar.gz",
        mount = apk::PACKAGES_MOUNT,
    );
    manager.run(&ChrootId::Native, &["sh", "-c", &script], OutputMode::StreamToLog)?;
    info!("rebuilt index for {arch}");
    Ok(())
}

/// The local signing key, created on first use under config_abuild/
pub fn ensure_signing_key(ctx: &Context, manager: &ChrootManager) -> Result<String> {
    let key_dir = ctx.work.config_abuild();
    fs::create_dir_all(&key_dir)?;

    let existing = fs::read_dir(&key_dir)?
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .find(|name| name.ends_with(".rsa"));
    let name = match existing {
        Some(name) => name,
        None => {
            let name = "pmbootstrap.rsa".to_string();
            info!("generating local package signing key");
            manager.mount(&ChrootId::Native)?;
            apk::install(
                ctx,
                &ChrootId::Native,
                &["openssl".to_string()],
                &HashMap::new(),
            )?;
            let script = format!(
                "openssl genrsa -out /mnt/pmbootstrap/config_abuild/{name} 2048 && \
                 openssl rsa -in /mnt/pmbootstrap/config_abuild/{name} -pubout \
                 -out /mnt/pmbootstrap/config_abuild/{name}.pub",
            );
            manager.run(&ChrootId::Native, &["sh", "-c", &script], OutputMode::StreamToLog)?;
            name
        }
    };
    Ok(format!("/mnt/pmbootstrap/config_abuild/{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::apkbuild::parse_str;

    fn recipe_with_options(options: &str) -> Apkbuild {
        parse_str(
            &format!("pkgname=t\npkgver=1\npkgrel=0\narch=\"all\"\noptions=\"{options}\"\n"),
            Arch::X86_64,
            Path::new("/aports/main/t"),
        )
        .unwrap()
    }

    #[test]
    fn test_strategy_display_names() {
        assert_eq!(Strategy::Native.as_str(), "native");
        assert_eq!(Strategy::CrossDirect.as_str(), "cross-direct");
        assert_eq!(Strategy::DistccQemu.as_str(), "distcc+qemu");
        assert_eq!(Strategy::QemuOnly.as_str(), "qemu-only");
    }

    #[test]
    fn test_bootstrap_table_lookup() {
        let pass = BOOTSTRAP_ORDER
            .iter()
            .find(|(name, _)| *name == "gcc")
            .map(|(_, pass)| *pass);
        assert_eq!(pass, Some("gcc-pass2"));
    }

    #[test]
    fn test_fingerprint_changes_with_local_source() {
        let dir = tempfile::tempdir().unwrap();
        let aport = dir.path().join("main/demo");
        fs::create_dir_all(&aport).unwrap();
        fs::write(aport.join("fix.patch"), b"-old\n+new\n").unwrap();

        let content =
            "pkgname=demo\npkgver=1\npkgrel=0\narch=\"all\"\nsource=\"fix.patch\"\n";
        let recipe = parse_str(content, Arch::X86_64, &aport).unwrap();
        let opts = BuildOptions::default();

        let before = fingerprint(&recipe, &opts).unwrap();
        fs::write(aport.join("fix.patch"), b"-old\n+other\n").unwrap();
        let after = fingerprint(&recipe, &opts).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_checksum_mismatch_names_file_and_digests() {
        let dir = tempfile::tempdir().unwrap();
        let aport = dir.path().join("main/demo");
        fs::create_dir_all(&aport).unwrap();
        fs::write(aport.join("fix.patch"), b"tampered").unwrap();

        let content = "pkgname=demo\npkgver=1\npkgrel=0\narch=\"all\"\n\
                       source=\"fix.patch\"\nsha512sums=\"\ncafe0000  fix.patch\n\"\n";
        let recipe = parse_str(content, Arch::X86_64, &aport).unwrap();

        let err = verify_local_sources(&recipe).unwrap_err();
        match err {
            Error::ChecksumMismatch { file, want, got } => {
                assert_eq!(file, "fix.patch");
                assert_eq!(want, "cafe0000");
                assert_ne!(got, want);
            }
            other => panic!("expected ChecksumMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_check_phase_skipped_with_option() {
        let with_check = recipe_with_options("");
        let without_check = recipe_with_options("!check");
        assert!(!with_check.has_option("!check"));
        assert!(without_check.has_option("!check"));
    }
}
