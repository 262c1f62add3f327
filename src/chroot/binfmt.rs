// src/chroot/binfmt.rs

//! binfmt_misc registration for foreign-architecture chroots
//!
//! Emulated execution works by registering a statically linked QEMU user
//! binary as the interpreter for the foreign arch's ELF magic. The QEMU
//! binary lives in the native chroot and is bind-mounted into the foreign
//! tree at `/usr/bin/qemu-<arch>-static`, which is the interpreter path the
//! kernel resolves at exec time. Registrations are installed at most once
//! per arch per host boot, detected by the presence of
//! `/proc/sys/fs/binfmt_misc/<tag>`. They are never uninstalled: the
//! binfmt table is kernel-global state shared with the host.

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::runner::{CommandSpec, OutputMode, Runner, StdinSource};
use std::path::Path;
use tracing::{debug, info};

const BINFMT_DIR: &str = "/proc/sys/fs/binfmt_misc";

/// Interpreter path as seen from inside the foreign chroot
pub fn interpreter_path(arch: Arch) -> String {
    format!("/usr/bin/qemu-{}-static", arch.qemu_name())
}

/// Registration tag for one arch
pub fn tag(arch: Arch) -> String {
    format!("qemu-{}", arch.qemu_name())
}

/// Whether the registration for `arch` is already live this boot
pub fn is_registered(arch: Arch) -> bool {
    Path::new(BINFMT_DIR).join(tag(arch)).exists()
}

/// ELF ident magic and mask for the binfmt registration of one arch.
/// Twenty bytes starting at the ELF header; the mask blanks out the
/// OS-ABI byte and the low bit of the type field.
fn elf_magic(arch: Arch) -> (Vec<u8>, Vec<u8>) {
    const MASK_LE: [u8; 20] = [
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xfe, 0xff, 0xff, 0xff,
    ];
    const MASK_BE: [u8; 20] = [
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xfe, 0xff, 0xff,
    ];

    // (class, data, e_machine); data 1 = little endian, 2 = big endian
    let (class, data, machine): (u8, u8, u16) = match arch {
        Arch::X86 => (1, 1, 0x03),
        Arch::X86_64 => (2, 1, 0x3e),
        Arch::Armhf | Arch::Armv7 => (1, 1, 0x28),
        Arch::Aarch64 => (2, 1, 0xb7),
        Arch::Riscv64 => (2, 1, 0xf3),
        Arch::Ppc64le => (2, 1, 0x15),
        Arch::S390x => (2, 2, 0x16),
        Arch::Mips64el => (2, 1, 0x08),
    };

    let mut magic = vec![0x7f, b'E', b'L', b'F', class, data, 0x01];
    magic.resize(16, 0x00);
    if data == 1 {
        magic.extend_from_slice(&[0x02, 0x00, (machine & 0xff) as u8, (machine >> 8) as u8]);
        (magic, MASK_LE.to_vec())
    } else {
        magic.extend_from_slice(&[0x00, 0x02, (machine >> 8) as u8, (machine & 0xff) as u8]);
        (magic, MASK_BE.to_vec())
    }
}

fn escape_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\x{b:02x}")).collect()
}

/// The line written to the binfmt_misc register file
fn registration_line(arch: Arch) -> String {
    let (magic, mask) = elf_magic(arch);
    format!(
        ":{}:M::{}:{}:{}:C",
        tag(arch),
        escape_bytes(&magic),
        escape_bytes(&mask),
        interpreter_path(arch)
    )
}

/// Install the binfmt registration for a foreign arch, once per boot.
///
/// A native arch is refused: registering the host's own ELF magic would
/// route every host binary through QEMU.
pub fn register(runner: &Runner, arch: Arch) -> Result<()> {
    if arch == Arch::native() {
        return Err(Error::Internal(format!(
            "refusing binfmt registration for native architecture {arch}"
        )));
    }

    if is_registered(arch) {
        debug!("binfmt for {arch} already registered this boot");
        return Ok(());
    }

    // The binfmt_misc filesystem may not be mounted yet on this host
    if !Path::new(BINFMT_DIR).join("register").exists() {
        runner.run(
            CommandSpec::new(["mount", "-t", "binfmt_misc", "binfmt_misc", BINFMT_DIR])
                .as_root(true)
                .output(OutputMode::StreamToLog),
        )?;
    }

    let line = registration_line(arch);
    info!("registering binfmt interpreter {}", tag(arch));
    runner.run(
        CommandSpec::new(["tee".to_string(), format!("{BINFMT_DIR}/register")])
            .stdin(StdinSource::Bytes(line.into_bytes()))
            .as_root(true)
            .output(OutputMode::StreamToLog),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_line_shape() {
        let line = registration_line(Arch::Aarch64);
        assert!(line.starts_with(":qemu-aarch64:M::"));
        assert!(line.ends_with(":/usr/bin/qemu-aarch64-static:C"));
        assert!(line.contains("\\x7f\\x45\\x4c\\x46"));
    }

    #[test]
    fn test_arm_machine_bytes() {
        let (magic, mask) = elf_magic(Arch::Armv7);
        assert_eq!(magic.len(), 20);
        assert_eq!(mask.len(), 20);
        // e_machine 0x28, little endian, at offset 18
        assert_eq!(&magic[16..20], &[0x02, 0x00, 0x28, 0x00]);
    }

    #[test]
    fn test_s390x_is_big_endian() {
        let (magic, _) = elf_magic(Arch::S390x);
        assert_eq!(magic[5], 2);
        assert_eq!(&magic[16..20], &[0x00, 0x02, 0x00, 0x16]);
    }

    #[test]
    fn test_armhf_armv7_share_interpreter() {
        assert_eq!(interpreter_path(Arch::Armhf), interpreter_path(Arch::Armv7));
        assert_eq!(tag(Arch::Armhf), "qemu-arm");
    }

    #[test]
    fn test_native_arch_refused() {
        // Refusal happens before any command is issued
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(&dir.path().join("log.txt")).unwrap();
        let err = register(&runner, Arch::native()).unwrap_err();
        assert!(err.to_string().contains("native"));
    }
}
