// tests/metadata.rs

//! Recipe and index metadata across module boundaries

mod common;

use common::{apkbuild, test_context, write_aport};
use pmbootstrap::parse::apkindex::{self, IndexEntry};
use pmbootstrap::repo::{self, aports};
use pmbootstrap::{Arch, ApkVersion};

#[test]
fn test_index_round_trip_preserves_dependencies() {
    let text = "P:hello-world\nV:1.0-r3\nA:x86_64\nS:3362\nt:1640995200\n\
                C:Q1abcdef=\no:hello-world\nD:musl>=1.2 !conflict-pkg so:libc.musl-x86_64.so.1\n\
                p:cmd:hello-world=1.0-r3\n\n";
    let entries = apkindex::parse_text(text).unwrap();
    assert_eq!(entries.len(), 1);

    let reparsed: Vec<IndexEntry> = apkindex::parse_text(&entries[0].emit()).unwrap();
    assert_eq!(reparsed, entries);

    let deps = &reparsed[0].depends;
    assert_eq!(deps.len(), 3);
    assert!(deps[1].conflict);
    assert_eq!(deps[2].name, "so:libc.musl-x86_64.so.1");
}

#[test]
fn test_repo_missing_reports_unbuilt_aports() {
    let (_dir, ctx) = test_context();
    write_aport(
        &ctx.config.aports,
        "main",
        "never-built",
        &apkbuild("never-built", "1.0", 0, ""),
    );
    write_aport(
        &ctx.config.aports,
        "main",
        "other-pkg",
        &apkbuild("other-pkg", "2.0", 1, ""),
    );

    let missing = repo::repo_missing(&ctx, Arch::X86_64, false).unwrap();
    assert_eq!(missing, vec!["never-built", "other-pkg"]);
}

#[test]
fn test_repo_missing_skips_unsupported_arch() {
    let (_dir, ctx) = test_context();
    write_aport(
        &ctx.config.aports,
        "main",
        "x86-only",
        "pkgname=x86-only\npkgver=1\npkgrel=0\narch=\"x86_64\"\n",
    );

    let missing = repo::repo_missing(&ctx, Arch::Aarch64, false).unwrap();
    assert!(missing.is_empty());
}

#[test]
fn test_aport_lookup_through_subpackage_and_version() {
    let (_dir, ctx) = test_context();
    write_aport(
        &ctx.config.aports,
        "device",
        "device-demo",
        "pkgname=device-demo\npkgver=3\npkgrel=2\narch=\"noarch\"\n\
         subpackages=\"device-demo-kernel-mainline\"\n",
    );

    let recipe = aports::find(&ctx.config.aports, "device-demo-kernel-mainline", Arch::Aarch64)
        .unwrap();
    assert_eq!(recipe.pkgname, "device-demo");
    assert_eq!(
        recipe.version().unwrap(),
        ApkVersion::parse("3-r2").unwrap()
    );
}

#[test]
fn test_pkgrel_bump_rewrites_recipe() {
    let (_dir, ctx) = test_context();
    write_aport(
        &ctx.config.aports,
        "main",
        "bumpme",
        &apkbuild("bumpme", "1.0", 4, ""),
    );

    let bumped =
        repo::pkgrel_bump(&ctx, Arch::X86_64, &["bumpme".to_string()], false, false).unwrap();
    assert_eq!(bumped, vec!["bumpme"]);

    let recipe = aports::find(&ctx.config.aports, "bumpme", Arch::X86_64).unwrap();
    assert_eq!(recipe.pkgrel, 5);
}

#[test]
fn test_pkgrel_bump_dry_leaves_recipe_alone() {
    let (_dir, ctx) = test_context();
    write_aport(
        &ctx.config.aports,
        "main",
        "bumpme",
        &apkbuild("bumpme", "1.0", 4, ""),
    );

    repo::pkgrel_bump(&ctx, Arch::X86_64, &["bumpme".to_string()], false, true).unwrap();
    let recipe = aports::find(&ctx.config.aports, "bumpme", Arch::X86_64).unwrap();
    assert_eq!(recipe.pkgrel, 4);
}

#[test]
fn test_pkgrel_bump_without_packages_or_auto_is_usage_error() {
    let (_dir, ctx) = test_context();

    let err = repo::pkgrel_bump(&ctx, Arch::X86_64, &[], false, false).unwrap_err();
    assert_eq!(err.tag(), "UsageError");
    assert_eq!(err.exit_code(), 2);

    // The dispatcher recovers the typed error through anyhow and exits 2
    let boxed: anyhow::Error = err.into();
    let recovered = boxed
        .downcast_ref::<pmbootstrap::Error>()
        .map(|e| e.exit_code());
    assert_eq!(recovered, Some(2));
}
