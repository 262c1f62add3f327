// src/parse/apkindex.rs

//! APKINDEX parsing
//!
//! An `APKINDEX.tar.gz` is a signed archive containing a text file of
//! multi-line records keyed by single letters (`P:` pkgname, `V:` version,
//! `A:` arch, `D:` depends, `p:` provides, `o:` origin, `C:` checksum,
//! `S:` size, `t:` build time). Records are separated by blank lines. The
//! same format, minus the archive, is used by `/lib/apk/db/installed`
//! inside a chroot. Unknown keys are tolerated; a record without `P:` or
//! `V:` is corrupt. Records are surfaced as a lazy iterator so a very
//! large index never has to be materialized at once.

use crate::error::{Error, Result};
use crate::version::{ApkVersion, Dependency};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// One package record from an index or the installed database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub pkgname: String,
    pub version: ApkVersion,
    pub arch: Option<String>,
    pub depends: Vec<Dependency>,
    pub provides: Vec<Dependency>,
    pub origin: Option<String>,
    pub checksum: Option<String>,
    pub size: Option<u64>,
    pub build_time: Option<i64>,
}

impl IndexEntry {
    /// Serialize back into APKINDEX record form (trailing blank line
    /// included). parse(emit(e)) == e for every entry we can construct.
    pub fn emit(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("P:{}\n", self.pkgname));
        out.push_str(&format!("V:{}\n", self.version));
        if let Some(arch) = &self.arch {
            out.push_str(&format!("A:{arch}\n"));
        }
        if let Some(size) = self.size {
            out.push_str(&format!("S:{size}\n"));
        }
        if let Some(time) = self.build_time {
            out.push_str(&format!("t:{time}\n"));
        }
        if let Some(checksum) = &self.checksum {
            out.push_str(&format!("C:{checksum}\n"));
        }
        if let Some(origin) = &self.origin {
            out.push_str(&format!("o:{origin}\n"));
        }
        if !self.depends.is_empty() {
            let deps: Vec<String> = self.depends.iter().map(|d| d.to_string()).collect();
            out.push_str(&format!("D:{}\n", deps.join(" ")));
        }
        if !self.provides.is_empty() {
            let provides: Vec<String> = self.provides.iter().map(|d| d.to_string()).collect();
            out.push_str(&format!("p:{}\n", provides.join(" ")));
        }
        out.push('\n');
        out
    }

    fn from_fields(fields: Vec<(char, String)>) -> Result<IndexEntry> {
        let mut pkgname = None;
        let mut version = None;
        let mut entry = IndexEntry {
            pkgname: String::new(),
            version: ApkVersion::parse("0")?,
            arch: None,
            depends: Vec::new(),
            provides: Vec::new(),
            origin: None,
            checksum: None,
            size: None,
            build_time: None,
        };

        for (key, value) in fields {
            match key {
                'P' => pkgname = Some(value),
                'V' => version = Some(ApkVersion::parse(&value)?),
                'A' => entry.arch = Some(value),
                'D' => entry.depends = parse_dep_list(&value)?,
                'p' => entry.provides = parse_dep_list(&value)?,
                'o' => entry.origin = Some(value),
                'C' => entry.checksum = Some(value),
                'S' => {
                    entry.size = Some(value.parse().map_err(|_| {
                        Error::IndexCorrupt(format!("unreadable size field: {value}"))
                    })?)
                }
                't' => {
                    entry.build_time = Some(value.parse().map_err(|_| {
                        Error::IndexCorrupt(format!("unreadable build time: {value}"))
                    })?)
                }
                // Future-compat: unknown single-letter keys are skipped
                _ => {}
            }
        }

        entry.pkgname = pkgname.ok_or_else(|| {
            Error::IndexCorrupt("record is missing the P: (pkgname) field".to_string())
        })?;
        entry.version = version.ok_or_else(|| {
            Error::IndexCorrupt(format!("record for {} is missing V:", entry.pkgname))
        })?;
        Ok(entry)
    }
}

fn parse_dep_list(value: &str) -> Result<Vec<Dependency>> {
    value
        .split_whitespace()
        .map(Dependency::parse)
        .collect()
}

/// Lazy iterator over the records of one APKINDEX-format text.
///
/// Single pass, non-restartable; callers needing a second pass re-open.
pub struct IndexRecords<'a> {
    lines: std::str::Lines<'a>,
    done: bool,
}

impl<'a> IndexRecords<'a> {
    pub fn new(content: &'a str) -> IndexRecords<'a> {
        IndexRecords {
            lines: content.lines(),
            done: false,
        }
    }
}

impl Iterator for IndexRecords<'_> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut fields: Vec<(char, String)> = Vec::new();
        loop {
            match self.lines.next() {
                Some("") => {
                    if fields.is_empty() {
                        // Tolerate leading/extra blank lines between records
                        continue;
                    }
                    break;
                }
                Some(line) => {
                    let mut chars = line.chars();
                    let key = match chars.next() {
                        Some(k) => k,
                        None => continue,
                    };
                    if chars.next() != Some(':') {
                        return Some(Err(Error::IndexCorrupt(format!(
                            "malformed index line: {line}"
                        ))));
                    }
                    fields.push((key, chars.as_str().to_string()));
                }
                None => {
                    self.done = true;
                    if fields.is_empty() {
                        return None;
                    }
                    break;
                }
            }
        }

        Some(IndexEntry::from_fields(fields))
    }
}

/// Parse a whole APKINDEX-format text eagerly
pub fn parse_text(content: &str) -> Result<Vec<IndexEntry>> {
    IndexRecords::new(content).collect()
}

/// Parse an installed-package database (`/lib/apk/db/installed`)
pub fn parse_installed(path: &Path) -> Result<Vec<IndexEntry>> {
    let content = std::fs::read_to_string(path)?;
    parse_text(&content)
}

/// Read the `APKINDEX` member out of a signed `APKINDEX.tar.gz`.
///
/// The archive must contain exactly one signature member named
/// `.SIGN.RSA.<keyname>` and an `APKINDEX` member; other members
/// (`DESCRIPTION`) are tolerated.
pub fn read_index_archive(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut archive = tar::Archive::new(MultiGzDecoder::new(file));

    let mut signatures = 0;
    let mut index_content: Option<String> = None;

    for entry in archive
        .entries()
        .map_err(|e| Error::IndexCorrupt(format!("{}: {e}", path.display())))?
    {
        let mut entry = entry.map_err(|e| Error::IndexCorrupt(format!("{}: {e}", path.display())))?;
        let name = entry
            .path()
            .map_err(|e| Error::IndexCorrupt(e.to_string()))?
            .to_string_lossy()
            .into_owned();

        if name.starts_with(".SIGN.RSA.") {
            signatures += 1;
        } else if name == "APKINDEX" {
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .map_err(|e| Error::IndexCorrupt(format!("APKINDEX member: {e}")))?;
            index_content = Some(content);
        }
    }

    if signatures != 1 {
        return Err(Error::IndexCorrupt(format!(
            "{}: expected exactly one .SIGN.RSA signature, found {signatures}",
            path.display()
        )));
    }
    let content = index_content.ok_or_else(|| {
        Error::IndexCorrupt(format!("{}: no APKINDEX member", path.display()))
    })?;
    debug!("read index archive {} ({} bytes)", path.display(), content.len());
    Ok(content)
}

/// Parse a signed index archive into its entries
pub fn parse_archive(path: &Path) -> Result<Vec<IndexEntry>> {
    let content = read_index_archive(path)?;
    parse_text(&content)
}
