// src/repo/mod.rs

//! Package availability: aports, binary indexes, and providers
//!
//! Builds the unified view the resolver works against: every recipe in the
//! aports checkout plus every binary package known from the local
//! repository and the mirror indexes, indexed by the names they provide.
//! Also home to the index-driven maintenance operations: the
//! missing-binary scan and the pkgrel bump.

pub mod aports;
pub mod mirror;

use crate::arch::Arch;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::parse::apkbuild::Apkbuild;
use crate::parse::apkindex::{self, IndexEntry};
use crate::version::{ApkVersion, Dependency};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fs;
use tracing::{debug, info, warn};

/// Where a candidate package would come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageSource {
    /// Built locally from the aports checkout
    Aport,
    /// An existing binary from the local repository or a mirror index
    Index,
}

/// One installable package satisfying some requirement
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Name apk would install (a pkgname or subpackage name)
    pub pkgname: String,
    pub version: ApkVersion,
    pub source: PackageSource,
    pub depends: Vec<Dependency>,
    /// Names this package additionally provides
    pub provides: Vec<String>,
    /// Recipe pkgname for aports; `o:` field for index entries
    pub origin: Option<String>,
}

/// The resolver's combined view of recipes and indexes for one arch
pub struct PackageDb {
    pub arch: Arch,
    /// Recipes by their pkgname
    pub aports: HashMap<String, Apkbuild>,
    /// Binary entries by pkgname (local repository entries come first)
    pub index: HashMap<String, Vec<IndexEntry>>,
    /// Provided name -> candidates able to satisfy it
    providers: HashMap<String, Vec<Candidate>>,
}

impl PackageDb {
    /// Load the database: scan aports and read the local plus (optionally)
    /// mirror indexes for `arch`.
    pub fn load(ctx: &Context, arch: Arch, with_mirrors: bool) -> Result<PackageDb> {
        let recipes: Vec<Apkbuild> = aports::iter_recipes(&ctx.config.aports, arch).collect();

        let mut entries = local_index(ctx, arch)?;
        if with_mirrors {
            for path in mirror::fetch_indexes(ctx, arch)? {
                match apkindex::parse_archive(&path) {
                    Ok(mut parsed) => entries.append(&mut parsed),
                    Err(e) => warn!("unreadable index {}: {e}", path.display()),
                }
            }
        }

        Ok(Self::from_parts(arch, recipes, entries))
    }

    /// Assemble from already-parsed parts (the test seam)
    pub fn from_parts(arch: Arch, recipes: Vec<Apkbuild>, entries: Vec<IndexEntry>) -> PackageDb {
        let mut db = PackageDb {
            arch,
            aports: HashMap::new(),
            index: HashMap::new(),
            providers: HashMap::new(),
        };

        for recipe in recipes {
            if !recipe.supports_arch(arch) {
                continue;
            }
            let Ok(version) = recipe.version() else {
                warn!("{}: unparseable version, skipping", recipe.pkgname);
                continue;
            };
            let provide_names: Vec<String> =
                recipe.provides.iter().map(|p| p.name.clone()).collect();
            for name in recipe.built_names() {
                // Subpackage provides are only known once built; the main
                // package carries the recipe-level provides.
                let provides = if name == recipe.pkgname {
                    provide_names.clone()
                } else {
                    Vec::new()
                };
                db.push_provider(
                    name,
                    Candidate {
                        pkgname: name.to_string(),
                        version: version.clone(),
                        source: PackageSource::Aport,
                        depends: recipe.depends.clone(),
                        provides,
                        origin: Some(recipe.pkgname.clone()),
                    },
                );
            }
            for provide in &recipe.provides {
                db.push_provider(
                    &provide.name.clone(),
                    Candidate {
                        pkgname: recipe.pkgname.clone(),
                        version: version.clone(),
                        source: PackageSource::Aport,
                        depends: recipe.depends.clone(),
                        provides: provide_names.clone(),
                        origin: Some(recipe.pkgname.clone()),
                    },
                );
            }
            db.aports.insert(recipe.pkgname.clone(), recipe);
        }

        for entry in entries {
            if let Some(entry_arch) = &entry.arch {
                if entry_arch != arch.as_str() && entry_arch != "noarch" {
                    continue;
                }
            }
            let base = Candidate {
                pkgname: entry.pkgname.clone(),
                version: entry.version.clone(),
                source: PackageSource::Index,
                depends: entry.depends.clone(),
                provides: entry.provides.iter().map(|p| p.name.clone()).collect(),
                origin: entry.origin.clone(),
            };
            db.push_provider(&entry.pkgname.clone(), base.clone());
            for provide in &entry.provides {
                db.push_provider(&provide.name.clone(), base.clone());
            }
            db.index.entry(entry.pkgname.clone()).or_default().push(entry);
        }

        db
    }

    fn push_provider(&mut self, name: &str, candidate: Candidate) {
        self.providers
            .entry(name.to_string())
            .or_default()
            .push(candidate);
    }

    /// All candidates able to satisfy `name` (directly or via provides)
    pub fn providers(&self, name: &str) -> &[Candidate] {
        self.providers.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The recipe that builds `name`, if any (pkgname or subpackage)
    pub fn aport_for(&self, name: &str) -> Option<&Apkbuild> {
        if let Some(recipe) = self.aports.get(name) {
            return Some(recipe);
        }
        self.aports
            .values()
            .find(|recipe| recipe.built_names().contains(&name))
    }

    /// The best binary entry for `name`, preferring higher versions
    pub fn best_index_entry(&self, name: &str) -> Option<&IndexEntry> {
        self.index
            .get(name)
            .and_then(|entries| entries.iter().max_by(|a, b| a.version.cmp(&b.version)))
    }
}

/// Read the local repository's APKINDEX for one arch; empty when absent
pub fn local_index(ctx: &Context, arch: Arch) -> Result<Vec<IndexEntry>> {
    let path = ctx.work.packages(arch).join("APKINDEX.tar.gz");
    if !path.exists() {
        return Ok(Vec::new());
    }
    apkindex::parse_archive(&path)
}

/// List aports with no binary of matching version for `arch`. Walks the
/// tree lazily; only recipes supporting the arch are considered.
pub fn repo_missing(ctx: &Context, arch: Arch, with_mirrors: bool) -> Result<Vec<String>> {
    let mut known: HashMap<String, Vec<ApkVersion>> = HashMap::new();
    for entry in local_index(ctx, arch)? {
        known.entry(entry.pkgname.clone()).or_default().push(entry.version);
    }
    if with_mirrors {
        for path in mirror::fetch_indexes(ctx, arch)? {
            let content = apkindex::read_index_archive(&path)?;
            for entry in apkindex::IndexRecords::new(&content) {
                let entry = entry?;
                known.entry(entry.pkgname.clone()).or_default().push(entry.version);
            }
        }
    }

    let mut missing = Vec::new();
    for recipe in aports::iter_recipes(&ctx.config.aports, arch) {
        if !recipe.supports_arch(arch) {
            continue;
        }
        let Ok(version) = recipe.version() else {
            continue;
        };
        let built = known
            .get(&recipe.pkgname)
            .is_some_and(|versions| versions.iter().any(|v| *v == version));
        if !built {
            missing.push(recipe.pkgname);
        }
    }
    missing.sort();
    Ok(missing)
}

/// Bump `pkgrel` for the given aports, or with `auto` for every aport
/// whose binary became stale through a disappeared soname provider.
/// Returns the bumped pkgnames; with `dry` nothing is written.
pub fn pkgrel_bump(
    ctx: &Context,
    arch: Arch,
    packages: &[String],
    auto: bool,
    dry: bool,
) -> Result<Vec<String>> {
    if packages.is_empty() && !auto {
        return Err(Error::UsageError(
            "specify packages to bump, or use --auto".to_string(),
        ));
    }
    let mut to_bump: Vec<String> = if auto {
        find_soname_stale(ctx, arch)?
    } else {
        packages.to_vec()
    };
    to_bump.sort();
    to_bump.dedup();

    for pkgname in &to_bump {
        let recipe = aports::find(&ctx.config.aports, pkgname, arch)?;
        if dry {
            info!("would bump pkgrel of {pkgname} ({} -> {})", recipe.pkgrel, recipe.pkgrel + 1);
        } else {
            bump_recipe(&recipe)?;
            info!("bumped pkgrel of {pkgname} to {}", recipe.pkgrel + 1);
        }
    }
    Ok(to_bump)
}

/// Bound for the soname fixed-point iteration
const BUMP_MAX_ITERATIONS: u32 = 10;

/// Soname-staleness heuristic as a fixed point: a package is stale when
/// one of its `so:` depends has no surviving provider; marking it stale
/// withdraws its own `so:` provides, which can cascade. The iteration
/// count is bounded; packages with mutually dependent sonames that keep
/// flipping surface as an error instead of a guess.
fn find_soname_stale(ctx: &Context, arch: Arch) -> Result<Vec<String>> {
    let entries = local_index(ctx, arch)?;
    let recipes: HashMap<String, Apkbuild> = aports::iter_recipes(&ctx.config.aports, arch)
        .map(|r| (r.pkgname.clone(), r))
        .collect();

    // Entries already out of date rebuild anyway; they neither need a bump
    // nor count as soname providers.
    let current: Vec<&IndexEntry> = entries
        .iter()
        .filter(|entry| {
            recipes
                .get(entry.origin.as_deref().unwrap_or(&entry.pkgname))
                .and_then(|r| r.version().ok())
                .is_some_and(|v| v == entry.version)
        })
        .collect();

    let mut stale: HashSet<String> = HashSet::new();
    for iteration in 0.. {
        if iteration >= BUMP_MAX_ITERATIONS {
            return Err(Error::PkgrelBumpNonConverging(BUMP_MAX_ITERATIONS));
        }

        let provided: HashSet<&str> = current
            .iter()
            .filter(|entry| !stale.contains(&entry.pkgname))
            .flat_map(|entry| entry.provides.iter())
            .filter(|p| p.name.starts_with("so:"))
            .map(|p| p.name.as_str())
            .collect();

        let mut changed = false;
        for entry in &current {
            if stale.contains(&entry.pkgname) {
                continue;
            }
            let broken = entry
                .depends
                .iter()
                .filter(|d| d.name.starts_with("so:") && !d.conflict)
                .any(|d| !provided.contains(d.name.as_str()));
            if broken {
                debug!("{}: stale soname dependency", entry.pkgname);
                stale.insert(entry.pkgname.clone());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Bumps happen on origin recipes, not subpackages
    let mut origins: Vec<String> = stale
        .iter()
        .filter_map(|name| {
            entries
                .iter()
                .find(|e| &e.pkgname == name)
                .and_then(|e| e.origin.clone())
                .or_else(|| Some(name.clone()))
        })
        .collect();
    origins.sort();
    origins.dedup();
    Ok(origins)
}

/// Rewrite the recipe's `pkgrel=` line in place
fn bump_recipe(recipe: &Apkbuild) -> Result<()> {
    let path = recipe.apkbuild_path();
    let content = fs::read_to_string(&path)?;
    let re = Regex::new(r"(?m)^pkgrel=\d+\s*$").unwrap();
    if !re.is_match(&content) {
        return Err(Error::Internal(format!(
            "{}: no pkgrel line to bump",
            path.display()
        )));
    }
    let replaced = re.replace(&content, format!("pkgrel={}", recipe.pkgrel + 1));
    fs::write(&path, replaced.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::apkbuild::parse_str;
    use std::path::Path;

    fn recipe(name: &str, version: &str, rel: u64) -> Apkbuild {
        parse_str(
            &format!("pkgname={name}\npkgver={version}\npkgrel={rel}\narch=\"all\"\n"),
            Arch::X86_64,
            Path::new(&format!("/aports/main/{name}")),
        )
        .unwrap()
    }

    fn entry(name: &str, version: &str) -> IndexEntry {
        let text = format!("P:{name}\nV:{version}\nA:x86_64\n\n");
        apkindex::parse_text(&text).unwrap().remove(0)
    }

    #[test]
    fn test_db_providers_from_recipes_and_index() {
        let db = PackageDb::from_parts(
            Arch::X86_64,
            vec![recipe("hello", "1.0", 1)],
            vec![entry("busybox", "1.36.1-r2")],
        );
        assert_eq!(db.providers("hello").len(), 1);
        assert_eq!(db.providers("busybox").len(), 1);
        assert!(db.providers("nothing").is_empty());
    }

    #[test]
    fn test_db_filters_foreign_arch_entries() {
        let text = "P:armpkg\nV:1.0-r0\nA:armv7\n\n";
        let entries = apkindex::parse_text(text).unwrap();
        let db = PackageDb::from_parts(Arch::X86_64, Vec::new(), entries);
        assert!(db.providers("armpkg").is_empty());
    }

    #[test]
    fn test_db_noarch_entries_kept() {
        let text = "P:scripts\nV:1.0-r0\nA:noarch\n\n";
        let entries = apkindex::parse_text(text).unwrap();
        let db = PackageDb::from_parts(Arch::X86_64, Vec::new(), entries);
        assert_eq!(db.providers("scripts").len(), 1);
    }

    #[test]
    fn test_aport_for_subpackage() {
        let content = "pkgname=hello\npkgver=1.0\npkgrel=0\narch=\"all\"\nsubpackages=\"hello-doc\"\n";
        let recipe = parse_str(content, Arch::X86_64, Path::new("/a/main/hello")).unwrap();
        let db = PackageDb::from_parts(Arch::X86_64, vec![recipe], Vec::new());
        assert_eq!(db.aport_for("hello-doc").unwrap().pkgname, "hello");
        assert!(db.aport_for("unknown").is_none());
    }

    #[test]
    fn test_best_index_entry_prefers_newer() {
        let db = PackageDb::from_parts(
            Arch::X86_64,
            Vec::new(),
            vec![entry("pkg", "1.0-r0"), entry("pkg", "1.1-r0")],
        );
        assert_eq!(db.best_index_entry("pkg").unwrap().version.to_string(), "1.1-r0");
    }
}
