// tests/common/mod.rs

//! Shared fixtures for integration tests

// Not every test binary uses every fixture
#![allow(dead_code)]

use pmbootstrap::{Config, Context};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// A throwaway config rooted in a temp dir; work and aports live inside
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.work = dir.join("work");
    config.aports = dir.join("aports");
    fs::create_dir_all(&config.aports).unwrap();
    config
}

/// A full context over a fresh temp dir
pub fn test_context() -> (TempDir, Context) {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let ctx = Context::acquire(config, false).unwrap();
    (dir, ctx)
}

/// Drop an aport into the tree: `<aports>/<repo>/<name>/APKBUILD`
pub fn write_aport(aports: &Path, repo: &str, name: &str, content: &str) {
    let dir = aports.join(repo).join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("APKBUILD"), content).unwrap();
}

/// Minimal APKBUILD text for a package with the given depends line
pub fn apkbuild(name: &str, version: &str, rel: u64, depends: &str) -> String {
    format!(
        "pkgname={name}\npkgver={version}\npkgrel={rel}\narch=\"all\"\ndepends=\"{depends}\"\n"
    )
}
