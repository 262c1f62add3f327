// src/repo/aports.rs

//! Aports tree access
//!
//! The aports checkout is laid out as `<repo>/<pkgname>/APKBUILD` two
//! levels deep. Lookup by pkgname hits the directory name first; only when
//! that misses (subpackages, providers) does it fall back to scanning
//! every recipe. Scans are lazy so `repo_missing` over a large tree does
//! not parse everything up front unless it has to.

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::parse::apkbuild::{self, Apkbuild};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Iterate every aport directory (containing an APKBUILD), lazily
pub fn aport_dirs(aports: &Path) -> impl Iterator<Item = PathBuf> {
    let repos = fs::read_dir(aports)
        .map(|it| it.flatten().collect::<Vec<_>>())
        .unwrap_or_default();

    repos
        .into_iter()
        .filter(|entry| entry.path().is_dir())
        .flat_map(|repo| {
            fs::read_dir(repo.path())
                .map(|it| it.flatten().collect::<Vec<_>>())
                .unwrap_or_default()
        })
        .map(|entry| entry.path())
        .filter(|path| path.join("APKBUILD").is_file())
}

/// Iterate parsed recipes, skipping (and warning about) unparseable ones
pub fn iter_recipes(aports: &Path, carch: Arch) -> impl Iterator<Item = Apkbuild> {
    aport_dirs(aports).filter_map(move |dir| match apkbuild::parse(&dir, carch) {
        Ok(recipe) => Some(recipe),
        Err(e) => {
            warn!("skipping unparseable APKBUILD in {}: {e}", dir.display());
            None
        }
    })
}

/// Locate the recipe that builds `pkgname`, either as its main package, a
/// subpackage, or a provider. Returns `NoSuchAport` when nothing matches.
pub fn find(aports: &Path, pkgname: &str, carch: Arch) -> Result<Apkbuild> {
    match find_optional(aports, pkgname, carch)? {
        Some(recipe) => Ok(recipe),
        None => Err(Error::NoSuchAport(pkgname.to_string())),
    }
}

/// Like [`find`], but a miss is `None` instead of an error
pub fn find_optional(aports: &Path, pkgname: &str, carch: Arch) -> Result<Option<Apkbuild>> {
    if !aports.is_dir() {
        return Err(Error::ConfigInvalid(format!(
            "aports path does not exist: {}",
            aports.display()
        )));
    }

    // Fast path: directory named after the package
    for repo in fs::read_dir(aports)?.flatten() {
        let candidate = repo.path().join(pkgname);
        if candidate.join("APKBUILD").is_file() {
            let recipe = apkbuild::parse(&candidate, carch)?;
            // The directory name is authoritative only when it agrees
            if recipe.pkgname == pkgname {
                return Ok(Some(recipe));
            }
        }
    }

    // Slow path: subpackages and provides
    debug!("scanning aports for provider of {pkgname}");
    for recipe in iter_recipes(aports, carch) {
        if recipe.built_names().contains(&pkgname) {
            return Ok(Some(recipe));
        }
        if recipe.provides.iter().any(|p| p.name == pkgname) {
            return Ok(Some(recipe));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_aport(root: &Path, repo: &str, name: &str, content: &str) {
        let dir = root.join(repo).join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("APKBUILD"), content).unwrap();
    }

    fn sample_tree() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        write_aport(
            dir.path(),
            "main",
            "hello-world",
            "pkgname=hello-world\npkgver=1.0\npkgrel=3\narch=\"all\"\nsubpackages=\"$pkgname-doc\"\n",
        );
        write_aport(
            dir.path(),
            "community",
            "libfoo",
            "pkgname=libfoo\npkgver=2.1\npkgrel=0\narch=\"all\"\nprovides=\"foo-virtual=2.1\"\n",
        );
        dir
    }

    #[test]
    fn test_find_by_directory_name() {
        let tree = sample_tree();
        let recipe = find(tree.path(), "hello-world", Arch::X86_64).unwrap();
        assert_eq!(recipe.pkgname, "hello-world");
        assert_eq!(recipe.repo.as_deref(), Some("main"));
    }

    #[test]
    fn test_find_by_subpackage() {
        let tree = sample_tree();
        let recipe = find(tree.path(), "hello-world-doc", Arch::X86_64).unwrap();
        assert_eq!(recipe.pkgname, "hello-world");
    }

    #[test]
    fn test_find_by_provider() {
        let tree = sample_tree();
        let recipe = find(tree.path(), "foo-virtual", Arch::X86_64).unwrap();
        assert_eq!(recipe.pkgname, "libfoo");
    }

    #[test]
    fn test_find_missing_is_no_such_aport() {
        let tree = sample_tree();
        let err = find(tree.path(), "no-such-package", Arch::X86_64).unwrap_err();
        assert_eq!(err.tag(), "NoSuchAport");
    }

    #[test]
    fn test_iter_recipes_counts() {
        let tree = sample_tree();
        assert_eq!(iter_recipes(tree.path(), Arch::X86_64).count(), 2);
    }

    #[test]
    fn test_unparseable_recipe_skipped() {
        let tree = sample_tree();
        write_aport(tree.path(), "main", "broken", "depends=x\n");
        assert_eq!(iter_recipes(tree.path(), Arch::X86_64).count(), 2);
    }
}
