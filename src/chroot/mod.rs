// src/chroot/mod.rs

//! Chroot lifecycle management
//!
//! Each chroot identity (kind, arch) maps to one directory under the work
//! dir and moves through the states absent -> initializing -> ready <->
//! mounted -> zapping -> absent. Initialization extracts a pinned static
//! apk binary and seeds `alpine-base`; mounting acquires the kernel, cache,
//! aports, and package-repository mounts in a fixed order and releases them
//! in reverse. Foreign-arch chroots additionally get the native chroot
//! bound at `/native`, the QEMU user binary bound over their interpreter
//! path, and a binfmt_misc registration.

pub mod apk;
pub mod binfmt;
pub mod mount;

use crate::arch::Arch;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::repo::mirror;
use crate::runner::{CommandResult, CommandSpec, ExecContext, OutputMode, StdinSource};
use crate::sudo;
use flate2::read::MultiGzDecoder;
use mount::{MountKind, MountRecord};
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pinned apk-tools-static per host architecture: (version, apk sha256)
const APK_STATIC_PINS: &[(Arch, &str, &str)] = &[
    (
        Arch::X86_64,
        "2.14.4-r1",
        "7a4dca45130b9cdc7b2805c60c90aa4ad0b0a937ea61374981ba54d63ab83b75",
    ),
    (
        Arch::Aarch64,
        "2.14.4-r1",
        "e3a4b33a6c785fbdfeff4a400bbe620f2e10d83e56a84a1a8997c4151164e7f4",
    ),
];

/// Seed package set installed into every fresh chroot
const SEED_PACKAGES: &[&str] = &["alpine-base"];

/// Marker file left at a chroot's root after a failed build
const CONTAMINATED_MARKER: &str = ".pmbootstrap-contaminated";

/// Identity of one chroot: its kind plus target architecture
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChrootId {
    /// The host-arch chroot where native builds and cross tools run
    Native,
    /// A build chroot for one (possibly foreign) architecture
    Buildroot(Arch),
    /// The device root filesystem being assembled
    Rootfs { device: String, arch: Arch },
    /// The on-device installer image's chroot
    Installer { device: String, arch: Arch },
}

impl ChrootId {
    pub fn arch(&self) -> Arch {
        match self {
            ChrootId::Native => Arch::native(),
            ChrootId::Buildroot(arch) => *arch,
            ChrootId::Rootfs { arch, .. } | ChrootId::Installer { arch, .. } => *arch,
        }
    }

    /// Directory name suffix, also used as the registry key
    pub fn suffix(&self) -> String {
        match self {
            ChrootId::Native => "native".to_string(),
            ChrootId::Buildroot(arch) => format!("buildroot_{arch}"),
            ChrootId::Rootfs { device, .. } => format!("rootfs_{device}"),
            ChrootId::Installer { device, .. } => format!("installer_{device}"),
        }
    }

    pub fn dir(&self, work: &crate::workdir::WorkDir) -> PathBuf {
        work.root().join(format!("chroot_{}", self.suffix()))
    }

    /// The buildroot used when building packages for `arch`
    pub fn for_build(arch: Arch) -> ChrootId {
        if arch == Arch::native() {
            ChrootId::Native
        } else {
            ChrootId::Buildroot(arch)
        }
    }
}

impl fmt::Display for ChrootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.suffix())
    }
}

/// Observable lifecycle state of one chroot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChrootState {
    Absent,
    Ready,
    Mounted,
}

/// Manager for chroot lifecycle operations, bound to one context
pub struct ChrootManager<'a> {
    ctx: &'a Context,
}

impl<'a> ChrootManager<'a> {
    pub fn new(ctx: &'a Context) -> ChrootManager<'a> {
        ChrootManager { ctx }
    }

    pub fn state(&self, id: &ChrootId) -> ChrootState {
        if self.ctx.mounts.lock().unwrap().is_mounted(&id.suffix()) {
            return ChrootState::Mounted;
        }
        if id.dir(&self.ctx.work).is_dir() {
            return ChrootState::Ready;
        }
        ChrootState::Absent
    }

    /// Create and seed the chroot tree (absent -> ready). A tree that
    /// already exists is left untouched.
    pub fn init(&self, id: &ChrootId) -> Result<()> {
        let dir = id.dir(&self.ctx.work);
        if dir.is_dir() {
            return Ok(());
        }

        info!("({id}) initializing chroot");
        let apk_static = ensure_apk_static(self.ctx)?;
        let arch = id.arch();

        self.root_host(["mkdir", "-p", &path_str(&dir.join("etc/apk"))])?;
        self.write_file_as_root(&dir.join("etc/apk/arch"), format!("{arch}\n").as_bytes())?;
        apk::write_repository_list(self.ctx, id)?;

        // Signing keys for the Alpine mirrors come from the aports checkout;
        // without them the seed install runs untrusted (warned, not fatal,
        // for offline development setups).
        let keys_dir = self.ctx.config.aports.join("keys");
        let trusted = keys_dir.is_dir();
        if trusted {
            self.root_host(["mkdir", "-p", &path_str(&dir.join("etc/apk/keys"))])?;
            self.root_host([
                "sh",
                "-c",
                &format!(
                    "cp {}/* {}/",
                    shell_path(&keys_dir),
                    shell_path(&dir.join("etc/apk/keys"))
                ),
            ])?;
        } else {
            warn!("({id}) no keys at {}, seeding untrusted", keys_dir.display());
        }

        let mut argv: Vec<String> = vec![
            path_str(&apk_static),
            "--root".into(),
            path_str(&dir),
            "--arch".into(),
            arch.to_string(),
            "--initdb".into(),
            "--no-progress".into(),
        ];
        if !trusted {
            argv.push("--allow-untrusted".into());
        }
        if self.ctx.offline {
            argv.push("--no-network".into());
        }
        for url in self.ctx.config.mirror_urls() {
            argv.push("--repository".into());
            argv.push(url);
        }
        argv.push("add".into());
        argv.extend(SEED_PACKAGES.iter().map(|s| s.to_string()));

        self.ctx.runner.run(
            CommandSpec::new(argv)
                .as_root(true)
                .timeout(Duration::from_secs(1800))
                .output(OutputMode::StreamToLog),
        )?;

        // The unprivileged build user every package build runs as
        let user = sudo::chroot_user();
        self.ctx.runner.run(
            CommandSpec::new([
                "chroot".to_string(),
                path_str(&dir),
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("adduser -D {user} 2>/dev/null || true"),
            ])
            .as_root(true)
            .output(OutputMode::StreamToLog),
        )?;

        info!("({id}) chroot ready");
        Ok(())
    }

    /// Acquire all mounts for a chroot (ready -> mounted). Nested calls
    /// bump an acquisition count; only the matching number of `unmount`
    /// calls releases the mounts.
    pub fn mount(&self, id: &ChrootId) -> Result<()> {
        let suffix = id.suffix();
        {
            let mut mounts = self.ctx.mounts.lock().unwrap();
            if mounts.is_mounted(&suffix) {
                mounts.acquire(&suffix);
                return Ok(());
            }
        }

        self.init(id)?;
        let dir = id.dir(&self.ctx.work);
        let arch = id.arch();
        debug!("({id}) mounting");

        let mut plan: Vec<(MountKind, PathBuf, PathBuf)> = vec![
            (MountKind::Proc, "proc".into(), dir.join("proc")),
            (MountKind::Sys, "sysfs".into(), dir.join("sys")),
            (MountKind::Dev, "tmpfs".into(), dir.join("dev")),
            (MountKind::DevPts, "devpts".into(), dir.join("dev/pts")),
        ];

        // Host directories bound into the tree; sources are created first
        // so a fresh work dir mounts cleanly.
        let cache_apk = self.ctx.work.cache_apk(arch);
        let packages = self.ctx.work.packages(arch);
        fs::create_dir_all(&cache_apk)?;
        fs::create_dir_all(&packages)?;
        fs::create_dir_all(self.ctx.work.config_abuild())?;
        if self.ctx.config.aports.is_dir() {
            plan.push((
                MountKind::Bind,
                self.ctx.config.aports.clone(),
                dir.join("mnt/pmaports"),
            ));
        }
        plan.push((MountKind::Bind, cache_apk, dir.join("var/cache/apk")));
        plan.push((
            MountKind::Bind,
            packages,
            dir.join("mnt/pmbootstrap/packages"),
        ));
        plan.push((
            MountKind::Bind,
            self.ctx.work.config_abuild(),
            dir.join("mnt/pmbootstrap/config_abuild"),
        ));

        if arch.is_foreign() {
            self.prepare_foreign(id, &mut plan)?;
        }

        {
            let mut mounts = self.ctx.mounts.lock().unwrap();
            for (kind, source, target) in plan {
                mounts.mount(
                    &self.ctx.runner,
                    MountRecord {
                        chroot: suffix.clone(),
                        source,
                        target,
                        kind,
                    },
                )?;
            }
            mounts.acquire(&suffix);
        }

        self.create_device_nodes(&dir)?;
        if arch.is_foreign() {
            binfmt::register(&self.ctx.runner, arch)?;
        }
        apk::write_repository_list(self.ctx, id)?;
        Ok(())
    }

    /// Foreign chroots get /native and the QEMU interpreter bound in
    fn prepare_foreign(
        &self,
        id: &ChrootId,
        plan: &mut Vec<(MountKind, PathBuf, PathBuf)>,
    ) -> Result<()> {
        let arch = id.arch();
        let dir = id.dir(&self.ctx.work);

        // The emulator and cross tools live in the native chroot
        self.mount(&ChrootId::Native)?;
        let native_dir = ChrootId::Native.dir(&self.ctx.work);
        let qemu_host = native_dir.join(
            binfmt::interpreter_path(arch).trim_start_matches('/'),
        );
        if !qemu_host.is_file() {
            apk::install(
                self.ctx,
                &ChrootId::Native,
                &[format!("qemu-{}", arch.qemu_name())],
                &Default::default(),
            )?;
        }
        if !qemu_host.is_file() {
            return Err(Error::Internal(format!(
                "QEMU binary missing after install: {}",
                qemu_host.display()
            )));
        }

        plan.push((MountKind::Bind, native_dir, dir.join("native")));

        // Bind the interpreter over its in-chroot path so the kernel can
        // resolve it when exec'ing foreign binaries inside the tree.
        let qemu_target = dir.join(binfmt::interpreter_path(arch).trim_start_matches('/'));
        self.root_host(["mkdir", "-p", &path_str(qemu_target.parent().unwrap())])?;
        self.root_host(["touch", &path_str(&qemu_target)])?;
        plan.push((MountKind::Bind, qemu_host, qemu_target));
        Ok(())
    }

    fn create_device_nodes(&self, dir: &Path) -> Result<()> {
        let dev = shell_path(&dir.join("dev"));
        let script = format!(
            "[ -e {dev}/null ] || mknod -m 666 {dev}/null c 1 3; \
             [ -e {dev}/zero ] || mknod -m 666 {dev}/zero c 1 5; \
             [ -e {dev}/random ] || mknod -m 666 {dev}/random c 1 8; \
             [ -e {dev}/urandom ] || mknod -m 666 {dev}/urandom c 1 9; \
             [ -e {dev}/ptmx ] || ln -s pts/ptmx {dev}/ptmx"
        );
        self.root_host(["sh", "-c", &script])?;
        Ok(())
    }

    /// Drop one acquisition; the last one releases every mount in reverse
    /// order (mounted -> ready).
    pub fn unmount(&self, id: &ChrootId) -> Result<()> {
        let suffix = id.suffix();
        let mut mounts = self.ctx.mounts.lock().unwrap();
        if !mounts.is_mounted(&suffix) {
            return Ok(());
        }
        if mounts.release_ref(&suffix) > 0 {
            return Ok(());
        }
        mounts.release_chroot(&self.ctx.runner, &suffix, &id.dir(&self.ctx.work))
    }

    /// Run a command as root inside a mounted chroot
    pub fn run(&self, id: &ChrootId, argv: &[&str], output: OutputMode) -> Result<CommandResult> {
        self.run_spec(id, CommandSpec::new(argv).output(output))
    }

    /// Lower-level entry: callers control env/timeout via the spec; the
    /// context field is overwritten after the mount check.
    pub fn run_spec(&self, id: &ChrootId, spec: CommandSpec) -> Result<CommandResult> {
        let context = ExecContext::Chroot {
            root: self.checked_root(id)?,
            suffix: id.suffix(),
        };
        self.ctx.runner.run(spec.context(context))
    }

    pub fn run_user_spec(&self, id: &ChrootId, spec: CommandSpec) -> Result<CommandResult> {
        let context = ExecContext::UserInChroot {
            root: self.checked_root(id)?,
            suffix: id.suffix(),
            user: sudo::chroot_user(),
        };
        self.ctx.runner.run(spec.context(context))
    }

    /// The §4.2 guarantee: a chroot command cannot start without its mounts
    /// live, and a foreign chroot cannot run without its binfmt interpreter.
    fn checked_root(&self, id: &ChrootId) -> Result<PathBuf> {
        if self.state(id) != ChrootState::Mounted {
            return Err(Error::Internal(format!(
                "chroot {id} is not mounted; cannot run commands in it"
            )));
        }
        let arch = id.arch();
        if arch.is_foreign() && !binfmt::is_registered(arch) {
            return Err(Error::Internal(format!(
                "chroot {id} is foreign ({arch}) but binfmt is not configured"
            )));
        }
        Ok(id.dir(&self.ctx.work))
    }

    /// Mark a chroot as contaminated after a failed build. The tree is
    /// preserved for inspection; only `zap` clears it.
    pub fn mark_contaminated(&self, id: &ChrootId) -> Result<()> {
        let marker = id.dir(&self.ctx.work).join(CONTAMINATED_MARKER);
        self.root_host(["touch", &path_str(&marker)])?;
        Ok(())
    }

    pub fn is_contaminated(&self, id: &ChrootId) -> bool {
        id.dir(&self.ctx.work).join(CONTAMINATED_MARKER).exists()
    }

    /// Destroy one chroot tree (ready -> zapping -> absent). Refuses while
    /// mounts are live, and double-checks the kernel before `rm -rf`: a
    /// stray bind mount inside the tree would make removal reach host data.
    pub fn zap(&self, id: &ChrootId) -> Result<()> {
        let suffix = id.suffix();
        if self.ctx.mounts.lock().unwrap().is_mounted(&suffix) {
            return Err(Error::Internal(format!(
                "refusing to zap {id} while its mounts are live; run shutdown first"
            )));
        }
        let dir = id.dir(&self.ctx.work);
        if !dir.is_dir() {
            return Ok(());
        }
        let leaked = mount::mounts_under(&dir)?;
        if !leaked.is_empty() {
            return Err(Error::MountLeak { paths: leaked });
        }

        info!("({id}) zapping chroot");
        self.root_host(["rm", "-rf", &path_str(&dir)])?;
        Ok(())
    }

    /// Destroy every chroot tree under the work dir
    pub fn zap_all(&self) -> Result<Vec<String>> {
        let mut zapped = Vec::new();
        for entry in fs::read_dir(self.ctx.work.root())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(suffix) = name.strip_prefix("chroot_") else {
                continue;
            };
            if self.ctx.mounts.lock().unwrap().is_mounted(suffix) {
                return Err(Error::Internal(format!(
                    "refusing to zap {suffix} while its mounts are live; run shutdown first"
                )));
            }
            let dir = entry.path();
            let leaked = mount::mounts_under(&dir)?;
            if !leaked.is_empty() {
                return Err(Error::MountLeak { paths: leaked });
            }
            self.root_host(["rm", "-rf", &path_str(&dir)])?;
            zapped.push(name);
        }
        Ok(zapped)
    }

    fn root_host<const N: usize>(&self, argv: [&str; N]) -> Result<CommandResult> {
        self.ctx.runner.run(
            CommandSpec::new(argv)
                .as_root(true)
                .output(OutputMode::StreamToLog),
        )
    }

    fn write_file_as_root(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.ctx.runner.run(
            CommandSpec::new(["tee".to_string(), path_str(path)])
                .stdin(StdinSource::Bytes(content.to_vec()))
                .as_root(true)
                .output(OutputMode::StreamToLog),
        )?;
        Ok(())
    }
}

/// Download (once) and extract the pinned static apk binary used to seed
/// chroots. The archive's checksum is verified before extraction.
pub fn ensure_apk_static(ctx: &Context) -> Result<PathBuf> {
    let dest = ctx.work.root().join("apk.static");
    if dest.is_file() {
        return Ok(dest);
    }

    let native = Arch::native();
    let (_, version, sha256) = APK_STATIC_PINS
        .iter()
        .find(|(arch, _, _)| *arch == native)
        .ok_or_else(|| {
            Error::Internal(format!("no pinned apk-tools-static for host arch {native}"))
        })?;

    let url = format!(
        "{}edge/main/{native}/apk-tools-static-{version}.apk",
        ensure_trailing_slash(&ctx.config.mirror_alpine)
    );
    let archive = ctx.work.root().join("apk-tools-static.apk");
    mirror::download_verified(&url, &archive, sha256)?;

    extract_apk_static(&archive, &dest)?;
    fs::remove_file(&archive)?;
    info!("extracted apk.static to {}", dest.display());
    Ok(dest)
}

/// Pull `sbin/apk.static` out of the apk-tools-static package (a gzipped
/// tar with concatenated signature/control/data streams).
fn extract_apk_static(archive: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive)?;
    let mut tar = tar::Archive::new(MultiGzDecoder::new(file));

    for entry in tar.entries().map_err(|e| Error::Internal(e.to_string()))? {
        let mut entry = entry.map_err(|e| Error::Internal(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| Error::Internal(e.to_string()))?
            .into_owned();
        if path == Path::new("sbin/apk.static") {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            fs::write(dest, content)?;
            let mut perms = fs::metadata(dest)?.permissions();
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o755);
            fs::set_permissions(dest, perms)?;
            return Ok(());
        }
    }
    Err(Error::Internal(format!(
        "{}: archive has no sbin/apk.static member",
        archive.display()
    )))
}

fn ensure_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{url}/")
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

fn shell_path(path: &Path) -> String {
    // Paths we construct are under the work dir and contain no quoting
    // hazards, but be explicit about the assumption.
    let s = path.display().to_string();
    debug_assert!(!s.contains('\''));
    s
}
