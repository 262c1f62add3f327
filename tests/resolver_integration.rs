// tests/resolver_integration.rs

//! End-to-end resolution over an aports tree plus binary indexes

mod common;

use common::{apkbuild, test_context, write_aport};
use pmbootstrap::parse::apkindex;
use pmbootstrap::repo::{aports, PackageDb, PackageSource};
use pmbootstrap::resolver;
use pmbootstrap::{Arch, Dependency, Error};

fn dep(s: &str) -> Dependency {
    Dependency::parse(s).unwrap()
}

#[test]
fn test_resolution_prefers_local_aport_changes() {
    let (dir, ctx) = test_context();
    write_aport(
        &ctx.config.aports,
        "main",
        "hello-world",
        &apkbuild("hello-world", "1.1", 0, "musl"),
    );

    // The mirror still carries the older 1.0
    let index = apkindex::parse_text(
        "P:hello-world\nV:1.0-r0\nA:x86_64\nD:musl\n\nP:musl\nV:1.2.4-r0\nA:x86_64\n\n",
    )
    .unwrap();

    let recipes = aports::iter_recipes(&ctx.config.aports, Arch::X86_64).collect();
    let db = PackageDb::from_parts(Arch::X86_64, recipes, index);

    let resolution = resolver::resolve(&db, &[dep("hello-world")]).unwrap();
    let chosen = resolution.chosen.get("hello-world").unwrap();
    assert_eq!(chosen.source, PackageSource::Aport);
    assert_eq!(chosen.version.to_string(), "1.1-r0");
    // The dependency came from the index
    assert_eq!(
        resolution.chosen.get("musl").unwrap().source,
        PackageSource::Index
    );
    drop(dir);
}

#[test]
fn test_dependency_conflict_names_both_constraints() {
    let index = apkindex::parse_text(
        "P:foo\nV:1.5-r0\nA:x86_64\n\nP:foo\nV:2.5-r0\nA:x86_64\n\n",
    )
    .unwrap();
    let db = PackageDb::from_parts(Arch::X86_64, Vec::new(), index);

    let err = resolver::resolve(&db, &[dep("foo>=2"), dep("foo<2")]).unwrap_err();
    assert_eq!(err.tag(), "DependencyConflict");
    let message = err.to_string();
    assert!(message.contains("foo>=2"), "missing first constraint: {message}");
    assert!(message.contains("foo<2"), "missing second constraint: {message}");
}

#[test]
fn test_transitive_closure_through_aports() {
    let (dir, ctx) = test_context();
    let aports_dir = &ctx.config.aports;
    write_aport(aports_dir, "main", "app", &apkbuild("app", "1.0", 0, "libmid"));
    write_aport(aports_dir, "main", "libmid", &apkbuild("libmid", "2.0", 0, "libbase"));
    write_aport(aports_dir, "main", "libbase", &apkbuild("libbase", "3.0", 0, ""));

    let recipes = aports::iter_recipes(aports_dir, Arch::X86_64).collect();
    let db = PackageDb::from_parts(Arch::X86_64, recipes, Vec::new());

    let resolution = resolver::resolve(&db, &[dep("app")]).unwrap();
    assert_eq!(resolution.names(), vec!["app", "libbase", "libmid"]);
    drop(dir);
}

#[test]
fn test_all_chosen_versions_satisfy_all_constraints() {
    // Two consumers constrain lib from both sides; 1.5 is the only fit
    let index = apkindex::parse_text(
        "P:a\nV:1.0-r0\nA:x86_64\nD:lib>=1.2\n\n\
         P:b\nV:1.0-r0\nA:x86_64\nD:lib<2\n\n\
         P:lib\nV:2.1-r0\nA:x86_64\n\n\
         P:lib\nV:1.5-r0\nA:x86_64\n\n",
    )
    .unwrap();
    let db = PackageDb::from_parts(Arch::X86_64, Vec::new(), index);

    let resolution = resolver::resolve(&db, &[dep("a"), dep("b")]).unwrap();
    let lib = resolution.chosen.get("lib").unwrap();
    assert_eq!(lib.version.to_string(), "1.5-r0");
}

#[test]
fn test_bootstrap_cycle_reported_with_members() {
    let (dir, ctx) = test_context();
    let aports_dir = &ctx.config.aports;
    write_aport(
        aports_dir,
        "main",
        "gcc",
        "pkgname=gcc\npkgver=13\npkgrel=0\narch=\"all\"\nmakedepends=\"libucontext\"\n",
    );
    write_aport(
        aports_dir,
        "main",
        "libucontext",
        "pkgname=libucontext\npkgver=1\npkgrel=0\narch=\"all\"\nmakedepends=\"gcc\"\n",
    );

    let recipes = aports::iter_recipes(aports_dir, Arch::X86_64).collect();
    let db = PackageDb::from_parts(Arch::X86_64, recipes, Vec::new());

    match resolver::makedepends_order(&db, "gcc").unwrap_err() {
        Error::BootstrapRequired { cycle } => {
            assert!(cycle.contains(&"gcc".to_string()));
            assert!(cycle.contains(&"libucontext".to_string()));
        }
        other => panic!("expected BootstrapRequired, got {other:?}"),
    }
    drop(dir);
}
