//! On-disk persistence: directory layout, JSON records and operation markers.
//!
//! This module is split into three submodules:
//! - `paths`: where every site, article and public artifact lives.
//! - `repo`: load/save functions for the JSON records, always temp-then-rename.
//! - `ops`: the per-site cache of already-applied derived-output operations.
//!
//! Callers import from `planet_sync::store`; the repository API is re-exported.

pub mod ops;
pub mod paths;
pub mod repo;

pub use ops::{OpKind, OpsCache};
pub use paths::Layout;
pub use repo::*;
