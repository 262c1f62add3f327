// src/version/mod.rs

//! Alpine-style version parsing, comparison, and constraints
//!
//! Versions are sequences of numeric and alphabetic components with an
//! optional suffix (`_alpha`, `_rc3`, `_git20220101`, ...) and an optional
//! `-r<N>` release bump. Comparison is component-wise and forms a total
//! order over all parseable versions. Malformed input is rejected with
//! `Error::VersionMalformed` rather than ordered arbitrarily.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Suffix kinds in ascending sort order. `Release` is the implicit kind of a
/// version with no suffix: pre-release suffixes sort below it, VCS snapshot
/// and patch suffixes above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SuffixKind {
    Alpha,
    Beta,
    Pre,
    Rc,
    Release,
    Cvs,
    Svn,
    Git,
    Hg,
    P,
}

impl SuffixKind {
    fn parse(name: &str) -> Option<SuffixKind> {
        match name {
            "alpha" => Some(SuffixKind::Alpha),
            "beta" => Some(SuffixKind::Beta),
            "pre" => Some(SuffixKind::Pre),
            "rc" => Some(SuffixKind::Rc),
            "cvs" => Some(SuffixKind::Cvs),
            "svn" => Some(SuffixKind::Svn),
            "git" => Some(SuffixKind::Git),
            "hg" => Some(SuffixKind::Hg),
            "p" => Some(SuffixKind::P),
            _ => None,
        }
    }
}

/// One parsed component of a version string
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Part {
    Num(u64),
    Letter(char),
    Suffix { kind: SuffixKind, num: u64 },
}

impl Part {
    /// Rank used when two versions diverge in component *kind* at the same
    /// position, or one version ran out of components. Pre-release suffixes
    /// sort below "nothing", trailing letters and post-release suffixes
    /// above it, and a further numeric component above everything.
    fn rank(&self) -> u8 {
        match self {
            Part::Suffix { kind, .. } if *kind < SuffixKind::Release => 0,
            Part::Letter(_) => 2,
            Part::Suffix { .. } => 3,
            Part::Num(_) => 4,
        }
    }
}

const END_RANK: u8 = 1;

/// A parsed Alpine package version: `pkgver` components plus `-r<pkgrel>`
///
/// Equality and hashing follow the comparison semantics, not the raw
/// spelling: `1.0` and `1.0-r0` are the same version.
#[derive(Debug, Clone)]
pub struct ApkVersion {
    parts: Vec<Part>,
    /// Release bump; 0 when the `-r` part is absent
    pub rel: u64,
    raw: String,
}

impl PartialEq for ApkVersion {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for ApkVersion {}

impl std::hash::Hash for ApkVersion {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.parts.hash(state);
        self.rel.hash(state);
    }
}

impl ApkVersion {
    /// Parse a version string
    ///
    /// Accepted shapes: `1`, `1.2`, `1.2.3a`, `1.2_rc3`, `1.2-r5`,
    /// `1.2.3_git20220101`. Rejected: empty, `1..2`, `1.2-`, unknown
    /// suffix names, or trailing garbage.
    pub fn parse(s: &str) -> Result<Self> {
        let malformed = || Error::VersionMalformed(s.to_string());
        let bytes = s.as_bytes();
        let mut parts = Vec::new();
        let mut rel = 0u64;
        let mut i = 0usize;

        // First component must be numeric
        let (num, used) = take_number(bytes).ok_or_else(malformed)?;
        parts.push(Part::Num(num));
        i += used;

        while i < bytes.len() {
            match bytes[i] {
                b'.' => {
                    i += 1;
                    let (num, used) = take_number(&bytes[i..]).ok_or_else(malformed)?;
                    parts.push(Part::Num(num));
                    i += used;
                }
                b'a'..=b'z' => {
                    parts.push(Part::Letter(bytes[i] as char));
                    i += 1;
                }
                b'_' => {
                    i += 1;
                    let start = i;
                    while i < bytes.len() && bytes[i].is_ascii_lowercase() {
                        i += 1;
                    }
                    let kind = SuffixKind::parse(&s[start..i]).ok_or_else(malformed)?;
                    let num = match take_number(&bytes[i..]) {
                        Some((n, used)) => {
                            i += used;
                            n
                        }
                        None => 0,
                    };
                    parts.push(Part::Suffix { kind, num });
                }
                b'-' => {
                    // Only "-r<digits>" at the very end is valid
                    if !bytes[i..].starts_with(b"-r") {
                        return Err(malformed());
                    }
                    i += 2;
                    let (num, used) = take_number(&bytes[i..]).ok_or_else(malformed)?;
                    rel = num;
                    i += used;
                    if i != bytes.len() {
                        return Err(malformed());
                    }
                }
                _ => return Err(malformed()),
            }
        }

        Ok(ApkVersion {
            parts,
            rel,
            raw: s.to_string(),
        })
    }

    /// Compare two versions. Forms a total order: antisymmetric, transitive.
    pub fn compare(&self, other: &ApkVersion) -> Ordering {
        self.compare_pkgver(other).then(self.rel.cmp(&other.rel))
    }

    /// Compare only the upstream components, ignoring the `-r` bump
    pub fn compare_pkgver(&self, other: &ApkVersion) -> Ordering {
        let max = self.parts.len().max(other.parts.len());
        for i in 0..max {
            let ord = match (self.parts.get(i), other.parts.get(i)) {
                (Some(Part::Num(a)), Some(Part::Num(b))) => a.cmp(b),
                (Some(Part::Letter(a)), Some(Part::Letter(b))) => a.cmp(b),
                (
                    Some(Part::Suffix { kind: ka, num: na }),
                    Some(Part::Suffix { kind: kb, num: nb }),
                ) => ka.cmp(kb).then(na.cmp(nb)),
                (a, b) => {
                    let ra = a.map_or(END_RANK, Part::rank);
                    let rb = b.map_or(END_RANK, Part::rank);
                    ra.cmp(&rb)
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// True when `self`'s components start with all of `prefix`'s components
    /// (the `~` fuzzy-match rule). `-r` on the prefix is ignored.
    pub fn has_prefix(&self, prefix: &ApkVersion) -> bool {
        if prefix.parts.len() > self.parts.len() {
            return false;
        }
        self.parts[..prefix.parts.len()] == prefix.parts[..]
    }
}

/// Parse a run of ASCII digits; returns (value, bytes consumed)
fn take_number(bytes: &[u8]) -> Option<(u64, usize)> {
    let end = bytes
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(bytes.len());
    if end == 0 {
        return None;
    }
    // Saturate rather than fail on date-style components like 20220101999
    let mut value: u64 = 0;
    for b in &bytes[..end] {
        value = value.saturating_mul(10).saturating_add((b - b'0') as u64);
    }
    Some((value, end))
}

impl Ord for ApkVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for ApkVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ApkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for ApkVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ApkVersion::parse(s)
    }
}

/// Version constraint operators as written in depends/provides lists
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionConstraint {
    /// Any version is acceptable (bare name)
    Any,
    Equal(ApkVersion),
    Less(ApkVersion),
    LessOrEqual(ApkVersion),
    Greater(ApkVersion),
    GreaterOrEqual(ApkVersion),
    /// `~`: candidate's components start with the given prefix
    Fuzzy(ApkVersion),
    /// `><`: fuzzy not-equal used by a few recipes; treated as inequality
    NotEqual(ApkVersion),
}

impl VersionConstraint {
    /// Check whether a version satisfies this constraint
    pub fn satisfies(&self, version: &ApkVersion) -> bool {
        match self {
            VersionConstraint::Any => true,
            VersionConstraint::Equal(v) => version.compare(v) == Ordering::Equal,
            VersionConstraint::Less(v) => version.compare(v) == Ordering::Less,
            VersionConstraint::LessOrEqual(v) => version.compare(v) != Ordering::Greater,
            VersionConstraint::Greater(v) => version.compare(v) == Ordering::Greater,
            VersionConstraint::GreaterOrEqual(v) => version.compare(v) != Ordering::Less,
            VersionConstraint::Fuzzy(v) => version.has_prefix(v),
            VersionConstraint::NotEqual(v) => version.compare(v) != Ordering::Equal,
        }
    }

    fn op_str(&self) -> &'static str {
        match self {
            VersionConstraint::Any => "",
            VersionConstraint::Equal(_) => "=",
            VersionConstraint::Less(_) => "<",
            VersionConstraint::LessOrEqual(_) => "<=",
            VersionConstraint::Greater(_) => ">",
            VersionConstraint::GreaterOrEqual(_) => ">=",
            VersionConstraint::Fuzzy(_) => "~",
            VersionConstraint::NotEqual(_) => "><",
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionConstraint::Any => write!(f, "*"),
            VersionConstraint::Equal(v)
            | VersionConstraint::Less(v)
            | VersionConstraint::LessOrEqual(v)
            | VersionConstraint::Greater(v)
            | VersionConstraint::GreaterOrEqual(v)
            | VersionConstraint::Fuzzy(v)
            | VersionConstraint::NotEqual(v) => write!(f, "{}{}", self.op_str(), v),
        }
    }
}

/// One dependency requirement: a package (or provider) name plus a constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub constraint: VersionConstraint,
    /// Leading `!`: the named package must NOT be installed
    pub conflict: bool,
}

impl Dependency {
    /// Parse a requirement as written in depends= lists:
    /// `busybox`, `musl>=1.2`, `so:libc.musl-x86_64.so.1`, `!conflicting-pkg`
    pub fn parse(s: &str) -> Result<Dependency> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::UsageError("empty dependency".to_string()));
        }
        let (s, conflict) = match s.strip_prefix('!') {
            Some(rest) => (rest, true),
            None => (s, false),
        };

        // Longest operators first so ">=" is not parsed as ">" plus "=..."
        for op in ["><", ">=", "<=", "=", ">", "<", "~"] {
            if let Some(pos) = s.find(op) {
                let name = s[..pos].to_string();
                let version = ApkVersion::parse(&s[pos + op.len()..])?;
                if name.is_empty() {
                    return Err(Error::UsageError(format!("dependency '{s}' has no name")));
                }
                let constraint = match op {
                    "><" => VersionConstraint::NotEqual(version),
                    ">=" => VersionConstraint::GreaterOrEqual(version),
                    "<=" => VersionConstraint::LessOrEqual(version),
                    "=" => VersionConstraint::Equal(version),
                    ">" => VersionConstraint::Greater(version),
                    "<" => VersionConstraint::Less(version),
                    "~" => VersionConstraint::Fuzzy(version),
                    _ => unreachable!(),
                };
                return Ok(Dependency {
                    name,
                    constraint,
                    conflict,
                });
            }
        }

        Ok(Dependency {
            name: s.to_string(),
            constraint: VersionConstraint::Any,
            conflict,
        })
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conflict {
            write!(f, "!")?;
        }
        match &self.constraint {
            VersionConstraint::Any => write!(f, "{}", self.name),
            c => write!(f, "{}{}", self.name, c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> ApkVersion {
        ApkVersion::parse(s).unwrap()
    }

    #[test]
    fn test_parse_accepted_shapes() {
        for s in ["1", "1.2", "1.2.3a", "1.2_rc3", "1.2-r5", "1.2.3_git20220101"] {
            assert!(ApkVersion::parse(s).is_ok(), "{s} should parse");
        }
    }

    #[test]
    fn test_parse_rejected_shapes() {
        for s in ["", "1..2", "1.2-", "abc", "1.2_frob", "1.2-r", "1.2-5", "1.2 "] {
            let err = ApkVersion::parse(s).unwrap_err();
            assert_eq!(err.tag(), "VersionMalformed", "{s} should be rejected");
        }
    }

    #[test]
    fn test_numeric_ordering() {
        assert!(v("1.2") < v("1.10"));
        assert!(v("2") > v("1.99.99"));
        assert!(v("1.2.3") == v("1.2.3"));
    }

    #[test]
    fn test_equality_ignores_spelling() {
        assert_eq!(v("1.0"), v("1.0-r0"));
        assert_ne!(v("1.0"), v("1.0-r1"));
    }

    #[test]
    fn test_trailing_letter_between_base_and_next() {
        assert!(v("1.2.3") < v("1.2.3a"));
        assert!(v("1.2.3a") < v("1.2.3b"));
        assert!(v("1.2.3b") < v("1.2.4"));
    }

    #[test]
    fn test_suffix_ordering() {
        assert!(v("1.0_alpha1") < v("1.0_beta1"));
        assert!(v("1.0_beta1") < v("1.0_pre1"));
        assert!(v("1.0_pre1") < v("1.0_rc1"));
        assert!(v("1.0_rc1") < v("1.0"));
        assert!(v("1.0") < v("1.0_git20220101"));
        assert!(v("1.0_git1") < v("1.0_p1"));
        assert!(v("1.0_rc1") < v("1.0_rc2"));
    }

    #[test]
    fn test_suffix_below_next_numeric() {
        assert!(v("1.2_p1") < v("1.2.1"));
        assert!(v("1.2_git20220101") < v("1.2.1"));
    }

    #[test]
    fn test_release_bump_ordering() {
        assert!(v("1.0-r1") < v("1.0-r2"));
        assert!(v("1.0") < v("1.0-r1"));
        assert!(v("1.0-r9") < v("1.0.1"));
    }

    #[test]
    fn test_compare_is_antisymmetric() {
        let samples = [
            "1", "1.2", "1.2a", "1.2.3", "1.2_rc3", "1.2_p1", "1.2-r5", "1.2.3_git20220101",
        ];
        for a in &samples {
            for b in &samples {
                assert_eq!(v(a).compare(&v(b)), v(b).compare(&v(a)).reverse());
            }
        }
    }

    #[test]
    fn test_constraint_satisfies() {
        let dep = Dependency::parse("musl>=1.2").unwrap();
        assert_eq!(dep.name, "musl");
        assert!(dep.constraint.satisfies(&v("1.2")));
        assert!(dep.constraint.satisfies(&v("1.3_rc1")));
        assert!(!dep.constraint.satisfies(&v("1.1.9")));
    }

    #[test]
    fn test_fuzzy_constraint() {
        let dep = Dependency::parse("hello~1.2").unwrap();
        assert!(dep.constraint.satisfies(&v("1.2")));
        assert!(dep.constraint.satisfies(&v("1.2.9")));
        assert!(!dep.constraint.satisfies(&v("1.20")));
        assert!(!dep.constraint.satisfies(&v("1.3")));
    }

    #[test]
    fn test_not_equal_constraint() {
        let dep = Dependency::parse("foo><1.0").unwrap();
        assert!(!dep.constraint.satisfies(&v("1.0")));
        assert!(dep.constraint.satisfies(&v("1.0.1")));
    }

    #[test]
    fn test_bare_name_is_any() {
        let dep = Dependency::parse("busybox").unwrap();
        assert_eq!(dep.constraint, VersionConstraint::Any);
        assert!(dep.constraint.satisfies(&v("0.0.1")));
    }

    #[test]
    fn test_provider_name_with_colons() {
        let dep = Dependency::parse("so:libc.musl-x86_64.so.1").unwrap();
        assert_eq!(dep.name, "so:libc.musl-x86_64.so.1");
        assert_eq!(dep.constraint, VersionConstraint::Any);
    }

    #[test]
    fn test_conflict_dependency() {
        let dep = Dependency::parse("!uclibc").unwrap();
        assert!(dep.conflict);
        assert_eq!(dep.name, "uclibc");

        let versioned = Dependency::parse("!foo<2").unwrap();
        assert!(versioned.conflict);
        assert_eq!(versioned.name, "foo");
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["musl>=1.2", "foo=1.0-r3", "bar~2", "baz", "!conflict-pkg"] {
            let dep = Dependency::parse(s).unwrap();
            assert_eq!(dep.to_string(), *s);
        }
    }
}
