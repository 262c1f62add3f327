// src/parse/apkbuild.rs

//! APKBUILD metadata evaluation
//!
//! APKBUILDs are shell scripts. The authoritative evaluation happens when
//! `abuild` sources the real file inside a chroot; this module is the
//! read-only fast path that extracts metadata (pkgname, version, arches,
//! depends, sources, ...) without spinning up a chroot. It evaluates the
//! constrained subset aports actually use at the top level:
//!
//! - variable assignments, including multi-line quoted values
//! - `$var` / `${var}` expansion and `${var%pat}`-style trims
//! - `case "$CARCH" in` blocks for arch-gated assignments
//! - `$(arch_to_hostspec ...)` command substitution
//!
//! Function bodies are skipped entirely. Anything outside the subset
//! degrades to an empty expansion rather than an error, mirroring how the
//! metadata is used: a wrong guess here is always corrected by abuild.

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::version::{ApkVersion, Dependency};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// One subpackage declaration: `name[:splitfunc[:arch]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subpackage {
    pub name: String,
    pub arch: Option<String>,
}

/// One entry of the `source=` list: `[rename::]url-or-filename`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub url: String,
    pub filename: String,
}

impl SourceEntry {
    fn parse(token: &str) -> SourceEntry {
        if let Some((rename, url)) = token.split_once("::") {
            return SourceEntry {
                url: url.to_string(),
                filename: rename.to_string(),
            };
        }
        let filename = token.rsplit('/').next().unwrap_or(token).to_string();
        SourceEntry {
            url: token.to_string(),
            filename,
        }
    }

    /// Local sources (patches, configs) sit next to the APKBUILD
    pub fn is_remote(&self) -> bool {
        self.url.contains("://")
    }
}

/// Parsed recipe metadata. Absent fields are `None`/empty, which is
/// distinct from present-but-empty in the original script.
#[derive(Debug, Clone)]
pub struct Apkbuild {
    pub pkgname: String,
    pub pkgver: String,
    pub pkgrel: u64,
    pub pkgdesc: Option<String>,
    pub url: Option<String>,
    /// Raw arch tokens: concrete tags, `all`, `noarch`, negations (`!armhf`)
    pub arch: Vec<String>,
    pub license: Option<String>,
    pub depends: Vec<Dependency>,
    pub makedepends: Vec<Dependency>,
    pub checkdepends: Vec<Dependency>,
    pub provides: Vec<Dependency>,
    pub subpackages: Vec<Subpackage>,
    pub source: Vec<SourceEntry>,
    /// (sha512 hex, filename) pairs from `sha512sums=`
    pub sha512sums: Vec<(String, String)>,
    pub options: Vec<String>,
    /// Origin repository: the directory above the aport (e.g. "main")
    pub repo: Option<String>,
    /// Directory containing the APKBUILD
    pub path: PathBuf,
}

impl Apkbuild {
    /// Full `pkgver-r<pkgrel>` as a comparable version
    pub fn version(&self) -> Result<ApkVersion> {
        ApkVersion::parse(&format!("{}-r{}", self.pkgver, self.pkgrel))
    }

    /// Whether this recipe can be built for `arch`
    pub fn supports_arch(&self, arch: Arch) -> bool {
        let tag = arch.as_str();
        if self.arch.iter().any(|a| a == &format!("!{tag}")) {
            return false;
        }
        self.arch
            .iter()
            .any(|a| a == "all" || a == "noarch" || a == tag)
    }

    /// Whether an options flag like `!check` is set
    pub fn has_option(&self, flag: &str) -> bool {
        self.options.iter().any(|o| o == flag)
    }

    /// All package names this recipe produces (pkgname + subpackages)
    pub fn built_names(&self) -> Vec<&str> {
        let mut names = vec![self.pkgname.as_str()];
        names.extend(self.subpackages.iter().map(|s| s.name.as_str()));
        names
    }

    pub fn apkbuild_path(&self) -> PathBuf {
        self.path.join("APKBUILD")
    }
}

/// Parse the APKBUILD inside `aport_dir`, evaluating arch gates for `carch`
pub fn parse(aport_dir: &Path, carch: Arch) -> Result<Apkbuild> {
    let path = aport_dir.join("APKBUILD");
    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::Internal(format!("{}: {e}", path.display())))?;
    parse_str(&content, carch, aport_dir)
}

/// Parse APKBUILD text. `aport_dir` is recorded for source staging and
/// used to derive the origin repository name.
pub fn parse_str(content: &str, carch: Arch, aport_dir: &Path) -> Result<Apkbuild> {
    let vars = evaluate(content, carch);
    let fail = |what: &str| {
        Error::Internal(format!(
            "{}: APKBUILD does not set {what}",
            aport_dir.display()
        ))
    };

    let pkgname = vars.get("pkgname").cloned().ok_or_else(|| fail("pkgname"))?;
    let pkgver = vars.get("pkgver").cloned().ok_or_else(|| fail("pkgver"))?;
    let pkgrel = vars
        .get("pkgrel")
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| Error::Internal(format!("{pkgname}: unreadable pkgrel '{v}'")))
        })
        .transpose()?
        .unwrap_or(0);

    let words = |key: &str| -> Vec<String> {
        vars.get(key)
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    };
    let deps = |key: &str| -> Result<Vec<Dependency>> {
        words(key).iter().map(|w| Dependency::parse(w)).collect()
    };

    let subpackages = words("subpackages")
        .iter()
        .map(|token| {
            let mut fields = token.split(':');
            let name = fields.next().unwrap_or(token).to_string();
            let arch = fields.nth(1).map(str::to_string);
            Subpackage { name, arch }
        })
        .collect();

    let source = words("source").iter().map(|t| SourceEntry::parse(t)).collect();

    let sha512sums = vars
        .get("sha512sums")
        .map(|v| {
            v.lines()
                .filter_map(|line| {
                    let mut fields = line.split_whitespace();
                    let hash = fields.next()?;
                    let file = fields.next()?;
                    Some((hash.to_string(), file.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    let repo = aport_dir
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned());

    Ok(Apkbuild {
        pkgname,
        pkgver,
        pkgrel,
        pkgdesc: vars.get("pkgdesc").cloned(),
        url: vars.get("url").cloned(),
        arch: words("arch"),
        license: vars.get("license").cloned(),
        depends: deps("depends")?,
        makedepends: deps("makedepends")?,
        checkdepends: deps("checkdepends")?,
        provides: deps("provides")?,
        subpackages,
        source,
        sha512sums,
        options: words("options"),
        repo,
        path: aport_dir.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Constrained shell evaluation
// ---------------------------------------------------------------------------

fn assign_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-zA-Z_][a-zA-Z0-9_]*)=(.*)$").unwrap())
}

fn function_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*\s*\(\)\s*\{?\s*$").unwrap())
}

/// Evaluate top-level assignments in order, skipping function bodies and
/// resolving `case "$CARCH"` blocks for the given architecture.
fn evaluate(content: &str, carch: Arch) -> HashMap<String, String> {
    let mut vars: HashMap<String, String> = HashMap::new();
    vars.insert("CARCH".to_string(), carch.as_str().to_string());
    vars.insert("CHOST".to_string(), carch.hostspec().to_string());
    vars.insert("CBUILD".to_string(), Arch::native().hostspec().to_string());

    let mut lines = content.lines().peekable();
    while let Some(line) = lines.next() {
        let trimmed = line.trim();

        if function_re().is_match(trimmed) {
            skip_function_body(&mut lines, trimmed.ends_with('{'));
            continue;
        }

        if let Some(subject) = case_subject(trimmed, &vars) {
            evaluate_case(&mut lines, &subject, &mut vars);
            continue;
        }

        apply_assignment(trimmed, &mut lines, &mut vars);
    }

    vars
}

/// Consume lines until the function's braces balance out
fn skip_function_body<'a, I: Iterator<Item = &'a str>>(
    lines: &mut std::iter::Peekable<I>,
    mut opened: bool,
) {
    let mut depth = if opened { 1 } else { 0 };
    for line in lines.by_ref() {
        for c in line.chars() {
            match c {
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        if opened && depth == 0 {
            return;
        }
    }
}

/// `case "$CARCH" in` -> the expanded subject, or None for other lines
fn case_subject(line: &str, vars: &HashMap<String, String>) -> Option<String> {
    let rest = line.strip_prefix("case ")?;
    let rest = rest.strip_suffix(" in")?;
    Some(expand(rest.trim_matches('"'), vars))
}

/// Evaluate a case block: assignments in the matching arm apply, all other
/// arms are skipped, nesting is not supported (aports do not nest these).
fn evaluate_case<'a, I: Iterator<Item = &'a str>>(
    lines: &mut std::iter::Peekable<I>,
    subject: &str,
    vars: &mut HashMap<String, String>,
) {
    let mut in_matching_arm = false;
    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        if trimmed == "esac" {
            return;
        }
        if let Some(patterns) = trimmed.strip_suffix(')') {
            // Arm label, e.g. `armhf|armv7)` or `*)`
            if !trimmed.contains('=') {
                in_matching_arm = patterns
                    .split('|')
                    .any(|p| glob_match(p.trim().trim_matches('"'), subject));
                continue;
            }
        }
        if trimmed == ";;" {
            in_matching_arm = false;
            continue;
        }
        if in_matching_arm {
            let body = trimmed.trim_end_matches(";;").trim();
            apply_assignment(body, lines, vars);
        }
    }
}

/// Shell glob match supporting only `*` wildcards (what arch arms use)
fn glob_match(pattern: &str, subject: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == subject;
    }
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{escaped}$"))
        .map(|re| re.is_match(subject))
        .unwrap_or(false)
}

/// Apply one assignment line; pulls continuation lines while a double or
/// single quote is left open (multi-line depends/sha512sums values).
fn apply_assignment<'a, I: Iterator<Item = &'a str>>(
    line: &str,
    lines: &mut std::iter::Peekable<I>,
    vars: &mut HashMap<String, String>,
) {
    let Some(caps) = assign_re().captures(line) else {
        return;
    };
    let name = caps.get(1).unwrap().as_str().to_string();
    let mut value = caps.get(2).unwrap().as_str().to_string();

    if let Some(quote) = open_quote(&value) {
        for next in lines.by_ref() {
            value.push('\n');
            value.push_str(next);
            if next.contains(quote) {
                break;
            }
        }
    }

    let unquoted = strip_quotes(value.trim());
    let expanded = expand(&unquoted, vars);
    vars.insert(name, expanded);
}

/// If the value starts a quoted string that does not close, return the quote
fn open_quote(value: &str) -> Option<char> {
    for quote in ['"', '\''] {
        if value.starts_with(quote) && value.matches(quote).count() == 1 {
            return Some(quote);
        }
    }
    None
}

fn strip_quotes(value: &str) -> String {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return value[1..value.len() - 1].to_string();
        }
    }
    // Unquoted values end at a trailing comment
    match value.split_once(" #") {
        Some((v, _)) => v.trim().to_string(),
        None => value.to_string(),
    }
}

/// Expand `$var`, `${var}`, `${var%pat}`-family trims, and the
/// `$(arch_to_hostspec ...)` substitution. Unknown substitutions expand to
/// the empty string.
fn expand(value: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let inner: String = take_until(&mut chars, '}');
                out.push_str(&expand_braced(&inner, vars));
            }
            Some((_, '(')) => {
                chars.next();
                let inner: String = take_until(&mut chars, ')');
                out.push_str(&expand_command(&inner, vars));
            }
            Some((_, c2)) if c2.is_ascii_alphanumeric() || *c2 == '_' => {
                let start = i + 1;
                let mut end = start;
                while let Some((j, c2)) = chars.peek() {
                    if c2.is_ascii_alphanumeric() || *c2 == '_' {
                        end = *j + c2.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let name = &value[start..end];
                out.push_str(vars.get(name).map(String::as_str).unwrap_or(""));
            }
            _ => out.push('$'),
        }
    }
    out
}

fn take_until<I: Iterator<Item = (usize, char)>>(
    chars: &mut std::iter::Peekable<I>,
    close: char,
) -> String {
    let mut inner = String::new();
    for (_, c) in chars.by_ref() {
        if c == close {
            break;
        }
        inner.push(c);
    }
    inner
}

/// `${var}`, `${var%pat}`, `${var%%pat}`, `${var#pat}`, `${var##pat}`
fn expand_braced(inner: &str, vars: &HashMap<String, String>) -> String {
    for (op, longest) in [("%%", true), ("%", false), ("##", true), ("#", false)] {
        if let Some(pos) = inner.find(op) {
            // Make sure "%%" is not matched as two "%" ops etc.
            if op.len() == 1 && inner[pos..].starts_with(&format!("{op}{op}")) {
                continue;
            }
            let name = &inner[..pos];
            let pattern = &inner[pos + op.len()..];
            let value = vars.get(name).cloned().unwrap_or_default();
            let from_end = op.starts_with('%');
            return trim_pattern(&value, pattern, from_end, longest);
        }
    }
    vars.get(inner).cloned().unwrap_or_default()
}

/// Strip a glob pattern from one end of the value (shell `%`/`#` trims)
fn trim_pattern(value: &str, pattern: &str, from_end: bool, longest: bool) -> String {
    let indices: Vec<usize> = (0..=value.len())
        .filter(|i| value.is_char_boundary(*i))
        .collect();

    let matches = |slice: &str| glob_match(pattern, slice);

    if from_end {
        // Remove a matching suffix: shortest keeps the most of the value
        let mut candidates = indices.iter().map(|&i| i);
        let found = if longest {
            candidates.find(|&i| matches(&value[i..]))
        } else {
            candidates.rev().find(|&i| matches(&value[i..]))
        };
        match found {
            Some(i) => value[..i].to_string(),
            None => value.to_string(),
        }
    } else {
        // Remove a matching prefix
        let mut candidates = indices.iter().map(|&i| i);
        let found = if longest {
            candidates.rev().find(|&i| matches(&value[..i]))
        } else {
            candidates.find(|&i| matches(&value[..i]))
        };
        match found {
            Some(i) => value[i..].to_string(),
            None => value.to_string(),
        }
    }
}

/// The one command substitution the metadata path understands
fn expand_command(inner: &str, vars: &HashMap<String, String>) -> String {
    let expanded = expand(inner, vars);
    let mut words = expanded.split_whitespace();
    if words.next() == Some("arch_to_hostspec") {
        if let Some(arg) = words.next() {
            if let Ok(arch) = arg.parse::<Arch>() {
                return arch.hostspec().to_string();
            }
        }
    }
    debug!("ignoring unsupported command substitution: $({inner})");
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = r#"
# Maintainer: Example Person <person@example.org>
pkgname=hello-world
pkgver=1.0
pkgrel=3
pkgdesc="A demo package"
url="https://example.org/hello"
arch="all"
license="MIT"
depends="musl"
makedepends="gcc make musl-dev"
subpackages="$pkgname-doc $pkgname-dbg:dbg:noarch"
source="hello-world-$pkgver.tar.gz::https://example.org/hello-$pkgver.tar.gz
	local.patch"
options="!check"
sha512sums="
abc123  hello-world-1.0.tar.gz
def456  local.patch
"

build() {
	make
}

package() {
	make DESTDIR="$pkgdir" install
}
"#;

    fn parse_hello() -> Apkbuild {
        parse_str(HELLO, Arch::X86_64, Path::new("/aports/main/hello-world")).unwrap()
    }

    #[test]
    fn test_basic_fields() {
        let pkg = parse_hello();
        assert_eq!(pkg.pkgname, "hello-world");
        assert_eq!(pkg.pkgver, "1.0");
        assert_eq!(pkg.pkgrel, 3);
        assert_eq!(pkg.version().unwrap().to_string(), "1.0-r3");
        assert_eq!(pkg.repo.as_deref(), Some("main"));
        assert_eq!(pkg.license.as_deref(), Some("MIT"));
    }

    #[test]
    fn test_depends_parsed() {
        let pkg = parse_hello();
        assert_eq!(pkg.depends.len(), 1);
        assert_eq!(pkg.makedepends.len(), 3);
        assert_eq!(pkg.makedepends[0].name, "gcc");
    }

    #[test]
    fn test_subpackage_expansion() {
        let pkg = parse_hello();
        assert_eq!(pkg.subpackages.len(), 2);
        assert_eq!(pkg.subpackages[0].name, "hello-world-doc");
        assert_eq!(pkg.subpackages[1].name, "hello-world-dbg");
        assert_eq!(pkg.subpackages[1].arch.as_deref(), Some("noarch"));
        assert!(pkg.built_names().contains(&"hello-world-doc"));
    }

    #[test]
    fn test_source_rename_and_local() {
        let pkg = parse_hello();
        assert_eq!(pkg.source.len(), 2);
        assert_eq!(pkg.source[0].filename, "hello-world-1.0.tar.gz");
        assert!(pkg.source[0].is_remote());
        assert_eq!(pkg.source[1].filename, "local.patch");
        assert!(!pkg.source[1].is_remote());
    }

    #[test]
    fn test_sha512sums_pairs() {
        let pkg = parse_hello();
        assert_eq!(pkg.sha512sums.len(), 2);
        assert_eq!(pkg.sha512sums[0].0, "abc123");
        assert_eq!(pkg.sha512sums[1].1, "local.patch");
    }

    #[test]
    fn test_function_bodies_skipped() {
        let pkg = parse_hello();
        // `make DESTDIR=...` inside package() must not become a variable
        assert!(pkg.has_option("!check"));
        assert_eq!(pkg.pkgver, "1.0");
    }

    #[test]
    fn test_arch_all_and_negation() {
        let pkg = parse_str(
            "pkgname=x\npkgver=1\npkgrel=0\narch=\"all !armhf\"\n",
            Arch::X86_64,
            Path::new("/aports/main/x"),
        )
        .unwrap();
        assert!(pkg.supports_arch(Arch::X86_64));
        assert!(pkg.supports_arch(Arch::Armv7));
        assert!(!pkg.supports_arch(Arch::Armhf));
    }

    #[test]
    fn test_arch_explicit_list() {
        let pkg = parse_str(
            "pkgname=x\npkgver=1\npkgrel=0\narch=\"x86_64 aarch64\"\n",
            Arch::X86_64,
            Path::new("/aports/main/x"),
        )
        .unwrap();
        assert!(pkg.supports_arch(Arch::X86_64));
        assert!(!pkg.supports_arch(Arch::Armv7));
    }

    #[test]
    fn test_case_arch_gating() {
        let content = r#"
pkgname=gated
pkgver=2.0
pkgrel=1
arch="all"
depends="base"
case "$CARCH" in
armhf|armv7)
	depends="$depends libarmextra"
	;;
x86_64)
	depends="$depends libsse"
	;;
esac
"#;
        let armv7 = parse_str(content, Arch::Armv7, Path::new("/a/main/gated")).unwrap();
        assert!(armv7.depends.iter().any(|d| d.name == "libarmextra"));
        assert!(!armv7.depends.iter().any(|d| d.name == "libsse"));

        let x86 = parse_str(content, Arch::X86_64, Path::new("/a/main/gated")).unwrap();
        assert!(x86.depends.iter().any(|d| d.name == "libsse"));
    }

    #[test]
    fn test_missing_pkgname_fails() {
        let err = parse_str("pkgver=1\n", Arch::X86_64, Path::new("/a/m/x")).unwrap_err();
        assert!(err.to_string().contains("pkgname"));
    }

    #[test]
    fn test_version_trim_expansion() {
        let content = "pkgname=t\npkgver=1.2.3\npkgrel=0\n_major=${pkgver%.*}\nurl=\"https://x.org/$_major\"\n";
        let pkg = parse_str(content, Arch::X86_64, Path::new("/a/m/t")).unwrap();
        assert_eq!(pkg.url.as_deref(), Some("https://x.org/1.2"));
    }

    #[test]
    fn test_hostspec_substitution() {
        let content = "pkgname=t\npkgver=1\npkgrel=0\n_target=$(arch_to_hostspec armv7)\nurl=\"$_target\"\n";
        let pkg = parse_str(content, Arch::X86_64, Path::new("/a/m/t")).unwrap();
        assert_eq!(pkg.url.as_deref(), Some("armv7-alpine-linux-musleabihf"));
    }
}
