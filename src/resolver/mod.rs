// src/resolver/mod.rs

//! Dependency resolution over aports and binary indexes
//!
//! Given a set of root requirements and a `PackageDb`, the resolver picks
//! one provider per requirement such that every constraint holds
//! simultaneously. Preference order: an aport whose version is at least
//! the index's (local changes take effect), then higher pkgver, lower
//! pkgrel, aport over index, alphabetical pkgname. Failure is a structured
//! conflict naming the requirement chain; constraints are never silently
//! loosened.
//!
//! Runtime `depends` cycles are legal in Alpine and resolve to a set plus
//! edges, never a topological order. `makedepends` must be acyclic; a
//! cycle is reported as `BootstrapRequired` for the planner's bootstrap
//! ordering to break.

use crate::error::{Error, Result};
use crate::repo::{Candidate, PackageDb, PackageSource};
use crate::version::{ApkVersion, Dependency, VersionConstraint};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// One resolved assignment
#[derive(Debug, Clone)]
pub struct Selection {
    pub pkgname: String,
    pub version: ApkVersion,
    pub source: PackageSource,
    /// Recipe pkgname (aports) or index origin
    pub origin: Option<String>,
    /// Names this selection provides beyond its pkgname
    pub provides: Vec<String>,
}

/// A consistent assignment: all chosen versions satisfy all constraints
#[derive(Debug, Default)]
pub struct Resolution {
    /// Selections keyed by the installed pkgname
    pub chosen: HashMap<String, Selection>,
}

impl Resolution {
    /// The selection satisfying `name`, directly or through provides
    pub fn providing(&self, name: &str) -> Option<&Selection> {
        if let Some(sel) = self.chosen.get(name) {
            return Some(sel);
        }
        self.chosen
            .values()
            .find(|sel| sel.provides.iter().any(|p| p == name))
    }

    /// Installed package names, sorted for deterministic output
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.chosen.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

/// Resolve `roots` against the database. An empty root set yields an
/// empty assignment.
pub fn resolve(db: &PackageDb, roots: &[Dependency]) -> Result<Resolution> {
    let mut state = State {
        db,
        chosen: HashMap::new(),
        forbidden: HashMap::new(),
        constraints: HashMap::new(),
        in_progress: HashSet::new(),
        satisfied: HashSet::new(),
    };

    for root in roots {
        let mut chain = vec![root.to_string()];
        state.satisfy(root, &mut chain)?;
    }

    Ok(Resolution {
        chosen: state.chosen,
    })
}

struct State<'a> {
    db: &'a PackageDb,
    chosen: HashMap<String, Selection>,
    /// Package name -> requirement string that forbids it (`!name` deps)
    forbidden: HashMap<String, String>,
    /// Accumulated constraints per requirement name, with their consumers
    constraints: HashMap<String, Vec<(String, VersionConstraint)>>,
    /// Names currently being expanded; a re-entry is a runtime cycle
    in_progress: HashSet<String>,
    /// Memo of already-satisfied (name, constraint) pairs
    satisfied: HashSet<(String, String)>,
}

impl State<'_> {
    fn satisfy(&mut self, dep: &Dependency, chain: &mut Vec<String>) -> Result<()> {
        if dep.conflict {
            return self.forbid(dep, chain);
        }

        let memo_key = (dep.name.clone(), dep.constraint.to_string());
        if self.satisfied.contains(&memo_key) {
            return Ok(());
        }

        // A package already chosen for this name must satisfy the new
        // constraint too; a contradiction is a conflict, not a re-pick.
        if let Some(existing) = self.providing(&dep.name) {
            if dep.constraint.satisfies(&existing.version) {
                self.satisfied.insert(memo_key);
                return Ok(());
            }
            return Err(self.conflict(chain, &existing.pkgname, &existing.version));
        }

        if self.in_progress.contains(&dep.name) {
            // Runtime dependency cycle; legal, the set already covers it
            trace!("runtime cycle through {}", dep.name);
            return Ok(());
        }

        let mut candidates: Vec<Candidate> = self
            .db
            .providers(&dep.name)
            .iter()
            .filter(|c| dep.constraint.satisfies(&c.version))
            .cloned()
            .collect();

        if candidates.is_empty() {
            if self.db.providers(&dep.name).is_empty() {
                return Err(Error::MissingProvider(dep.name.clone()));
            }
            return Err(Error::DependencyConflict {
                chain: chain.clone(),
            });
        }
        candidates.sort_by(compare_preference);

        self.in_progress.insert(dep.name.clone());
        self.constraints
            .entry(dep.name.clone())
            .or_default()
            .push((chain_consumer(chain), dep.constraint.clone()));

        let mut last_error = None;
        for candidate in candidates {
            if let Some(forbidder) = self.forbidden.get(&candidate.pkgname) {
                last_error = Some(Error::DependencyConflict {
                    chain: vec![forbidder.clone(), candidate.pkgname.clone()],
                });
                continue;
            }
            if !self.meets_recorded_constraints(&candidate) {
                continue;
            }

            let snapshot = self.snapshot();
            self.choose(&candidate);

            let mut failed = None;
            for sub in &candidate.depends {
                chain.push(sub.to_string());
                let result = self.satisfy(sub, chain);
                chain.pop();
                if let Err(e) = result {
                    failed = Some(e);
                    break;
                }
            }

            match failed {
                None => {
                    self.in_progress.remove(&dep.name);
                    self.satisfied.insert(memo_key);
                    debug!(
                        "chose {}-{} ({:?}) for {}",
                        candidate.pkgname, candidate.version, candidate.source, dep.name
                    );
                    return Ok(());
                }
                Some(e) => {
                    self.restore(snapshot);
                    last_error = Some(e);
                }
            }
        }

        self.in_progress.remove(&dep.name);
        Err(last_error.unwrap_or(Error::DependencyConflict {
            chain: chain.clone(),
        }))
    }

    fn forbid(&mut self, dep: &Dependency, chain: &[String]) -> Result<()> {
        if let Some(existing) = self.providing(&dep.name) {
            if dep.constraint.satisfies(&existing.version) {
                let mut conflict_chain = chain.to_vec();
                conflict_chain.push(format!("{} (already selected)", existing.pkgname));
                return Err(Error::DependencyConflict {
                    chain: conflict_chain,
                });
            }
        }
        self.forbidden
            .insert(dep.name.clone(), chain_consumer(chain));
        Ok(())
    }

    fn providing(&self, name: &str) -> Option<&Selection> {
        if let Some(sel) = self.chosen.get(name) {
            return Some(sel);
        }
        self.chosen
            .values()
            .find(|sel| sel.provides.iter().any(|p| p == name))
    }

    /// Every constraint recorded so far for this candidate's names must
    /// hold for its version.
    fn meets_recorded_constraints(&self, candidate: &Candidate) -> bool {
        let mut names = vec![candidate.pkgname.as_str()];
        names.extend(candidate.provides.iter().map(String::as_str));
        names.iter().all(|name| {
            self.constraints
                .get(*name)
                .map(|list| {
                    list.iter()
                        .all(|(_, constraint)| constraint.satisfies(&candidate.version))
                })
                .unwrap_or(true)
        })
    }

    fn choose(&mut self, candidate: &Candidate) {
        self.chosen.insert(
            candidate.pkgname.clone(),
            Selection {
                pkgname: candidate.pkgname.clone(),
                version: candidate.version.clone(),
                source: candidate.source,
                origin: candidate.origin.clone(),
                provides: candidate.provides.clone(),
            },
        );
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            chosen: self.chosen.clone(),
            forbidden: self.forbidden.clone(),
            constraints: self.constraints.clone(),
            satisfied: self.satisfied.clone(),
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.chosen = snapshot.chosen;
        self.forbidden = snapshot.forbidden;
        self.constraints = snapshot.constraints;
        self.satisfied = snapshot.satisfied;
    }

    fn conflict(&self, chain: &[String], pkgname: &str, version: &ApkVersion) -> Error {
        let mut full = chain.to_vec();
        // Name the requirements that pinned the existing selection
        if let Some(list) = self.constraints.get(pkgname) {
            for (consumer, constraint) in list {
                full.push(format!("{consumer} requires {pkgname}{constraint}"));
            }
        }
        full.push(format!("{pkgname}-{version} (already selected)"));
        Error::DependencyConflict { chain: full }
    }
}

struct Snapshot {
    chosen: HashMap<String, Selection>,
    forbidden: HashMap<String, String>,
    constraints: HashMap<String, Vec<(String, VersionConstraint)>>,
    satisfied: HashSet<(String, String)>,
}

fn chain_consumer(chain: &[String]) -> String {
    if chain.len() < 2 {
        return "(root)".to_string();
    }
    chain[chain.len() - 2].clone()
}

/// Preference: higher pkgver, then lower pkgrel, then aport over index,
/// then alphabetical. Among equal versions an aport whose version is >=
/// the index's naturally wins through the source tie-break.
fn compare_preference(a: &Candidate, b: &Candidate) -> Ordering {
    b.version
        .compare_pkgver(&a.version)
        .then(a.version.rel.cmp(&b.version.rel))
        .then(source_rank(a.source).cmp(&source_rank(b.source)))
        .then(a.pkgname.cmp(&b.pkgname))
}

fn source_rank(source: PackageSource) -> u8 {
    match source {
        PackageSource::Aport => 0,
        PackageSource::Index => 1,
    }
}

/// Build order over `makedepends` edges between aports, root last.
/// Runtime cycles are fine; a cycle through makedepends is not and
/// surfaces as `BootstrapRequired` naming the cycle.
pub fn makedepends_order(db: &PackageDb, root: &str) -> Result<Vec<String>> {
    let mut order = Vec::new();
    let mut visiting = Vec::new();
    let mut done = HashSet::new();
    visit(db, root, &mut visiting, &mut done, &mut order)?;
    Ok(order)
}

fn visit(
    db: &PackageDb,
    name: &str,
    visiting: &mut Vec<String>,
    done: &mut HashSet<String>,
    order: &mut Vec<String>,
) -> Result<()> {
    let Some(recipe) = db.aport_for(name) else {
        // Satisfied from a binary index; no build edge
        return Ok(());
    };
    let pkgname = recipe.pkgname.clone();
    if done.contains(&pkgname) {
        return Ok(());
    }
    if let Some(pos) = visiting.iter().position(|n| n == &pkgname) {
        let mut cycle: Vec<String> = visiting[pos..].to_vec();
        cycle.push(pkgname);
        return Err(Error::BootstrapRequired { cycle });
    }

    visiting.push(pkgname.clone());
    let makedeps: Vec<String> = recipe.makedepends.iter().map(|d| d.name.clone()).collect();
    for dep in makedeps {
        visit(db, &dep, visiting, done, order)?;
    }
    visiting.pop();

    done.insert(pkgname.clone());
    order.push(pkgname);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::parse::apkbuild::parse_str;
    use crate::parse::apkindex::parse_text;
    use std::path::Path;

    fn db(recipes: &[&str], index: &str) -> PackageDb {
        let parsed = recipes
            .iter()
            .map(|content| {
                parse_str(content, Arch::X86_64, Path::new("/aports/main/x")).unwrap()
            })
            .collect();
        let entries = if index.is_empty() {
            Vec::new()
        } else {
            parse_text(index).unwrap()
        };
        PackageDb::from_parts(Arch::X86_64, parsed, entries)
    }

    fn dep(s: &str) -> Dependency {
        Dependency::parse(s).unwrap()
    }

    #[test]
    fn test_empty_roots_empty_assignment() {
        let db = db(&[], "");
        let resolution = resolve(&db, &[]).unwrap();
        assert!(resolution.chosen.is_empty());
    }

    #[test]
    fn test_simple_chain() {
        let db = db(
            &[
                "pkgname=app\npkgver=1.0\npkgrel=0\narch=\"all\"\ndepends=\"lib\"\n",
                "pkgname=lib\npkgver=2.0\npkgrel=0\narch=\"all\"\n",
            ],
            "",
        );
        let resolution = resolve(&db, &[dep("app")]).unwrap();
        assert_eq!(resolution.names(), vec!["app", "lib"]);
    }

    #[test]
    fn test_missing_provider() {
        let db = db(&["pkgname=app\npkgver=1\npkgrel=0\narch=\"all\"\ndepends=\"ghost\"\n"], "");
        let err = resolve(&db, &[dep("app")]).unwrap_err();
        assert_eq!(err.tag(), "MissingProvider");
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_conflicting_roots() {
        let db = db(&[], "P:foo\nV:1.0-r0\nA:x86_64\n\nP:foo\nV:2.0-r0\nA:x86_64\n\n");
        let err = resolve(&db, &[dep("foo>=2"), dep("foo<2")]).unwrap_err();
        assert_eq!(err.tag(), "DependencyConflict");
        let message = err.to_string();
        assert!(message.contains("foo<2"), "message was: {message}");
    }

    #[test]
    fn test_aport_preferred_when_newer_or_equal() {
        let db = db(
            &["pkgname=hello\npkgver=1.2\npkgrel=0\narch=\"all\"\n"],
            "P:hello\nV:1.1-r0\nA:x86_64\n\n",
        );
        let resolution = resolve(&db, &[dep("hello")]).unwrap();
        let sel = resolution.chosen.get("hello").unwrap();
        assert_eq!(sel.source, PackageSource::Aport);
        assert_eq!(sel.version.to_string(), "1.2-r0");
    }

    #[test]
    fn test_newer_index_preferred_over_older_aport() {
        let db = db(
            &["pkgname=hello\npkgver=1.0\npkgrel=0\narch=\"all\"\n"],
            "P:hello\nV:1.5-r0\nA:x86_64\n\n",
        );
        let resolution = resolve(&db, &[dep("hello")]).unwrap();
        let sel = resolution.chosen.get("hello").unwrap();
        assert_eq!(sel.source, PackageSource::Index);
    }

    #[test]
    fn test_virtual_provider_resolution() {
        let db = db(
            &[],
            "P:mesa-gl\nV:23.0-r0\nA:x86_64\np:opengl=1\n\n",
        );
        let resolution = resolve(&db, &[dep("opengl")]).unwrap();
        assert!(resolution.chosen.contains_key("mesa-gl"));
        assert!(resolution.providing("opengl").is_some());
    }

    #[test]
    fn test_runtime_cycle_allowed() {
        let db = db(
            &[
                "pkgname=a\npkgver=1\npkgrel=0\narch=\"all\"\ndepends=\"b\"\n",
                "pkgname=b\npkgver=1\npkgrel=0\narch=\"all\"\ndepends=\"a\"\n",
            ],
            "",
        );
        let resolution = resolve(&db, &[dep("a")]).unwrap();
        assert_eq!(resolution.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_constraint_backtracks_to_older_candidate() {
        // app wants lib<2; the newest lib is 2.0 but 1.9 also exists
        let db = db(
            &["pkgname=app\npkgver=1\npkgrel=0\narch=\"all\"\ndepends=\"lib<2\"\n"],
            "P:lib\nV:2.0-r0\nA:x86_64\n\nP:lib\nV:1.9-r0\nA:x86_64\n\n",
        );
        let resolution = resolve(&db, &[dep("app")]).unwrap();
        assert_eq!(resolution.chosen.get("lib").unwrap().version.to_string(), "1.9-r0");
    }

    #[test]
    fn test_conflict_dep_forbids_choice() {
        let db = db(
            &["pkgname=app\npkgver=1\npkgrel=0\narch=\"all\"\ndepends=\"!evil other\"\n"],
            "P:evil\nV:1.0-r0\nA:x86_64\n\nP:other\nV:1.0-r0\nA:x86_64\n\n",
        );
        let resolution = resolve(&db, &[dep("app")]).unwrap();
        assert!(!resolution.chosen.contains_key("evil"));
    }

    #[test]
    fn test_makedepends_order_linear() {
        let db = db(
            &[
                "pkgname=top\npkgver=1\npkgrel=0\narch=\"all\"\nmakedepends=\"mid\"\n",
                "pkgname=mid\npkgver=1\npkgrel=0\narch=\"all\"\nmakedepends=\"base\"\n",
                "pkgname=base\npkgver=1\npkgrel=0\narch=\"all\"\n",
            ],
            "",
        );
        let order = makedepends_order(&db, "top").unwrap();
        assert_eq!(order, vec!["base", "mid", "top"]);
    }

    #[test]
    fn test_makedepends_cycle_is_bootstrap_required() {
        let db = db(
            &[
                "pkgname=gcc\npkgver=13\npkgrel=0\narch=\"all\"\nmakedepends=\"gcc-doc\"\n",
                "pkgname=gcc-doc\npkgver=13\npkgrel=0\narch=\"all\"\nmakedepends=\"gcc\"\n",
            ],
            "",
        );
        let err = makedepends_order(&db, "gcc").unwrap_err();
        match err {
            Error::BootstrapRequired { cycle } => {
                assert!(cycle.contains(&"gcc".to_string()));
                assert!(cycle.contains(&"gcc-doc".to_string()));
            }
            other => panic!("expected BootstrapRequired, got {other:?}"),
        }
    }
}
