// src/parse/mod.rs

//! Package metadata parsers: APKBUILD recipes and APKINDEX records

pub mod apkbuild;
pub mod apkindex;

pub use apkbuild::{Apkbuild, Subpackage};
pub use apkindex::{IndexEntry, IndexRecords};
