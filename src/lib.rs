//! Keeps a full-text index synchronized with watched files and directories.
//!
//! The [`fs::Mirror`] maintains an in-memory tree of everything below the watch targets and
//! reports file creations, deletions and moves. The [`index::IndexFacade`] turns those
//! reports into indexing work for an [`index::IndexEngine`] and maps search hits back to
//! current paths.

pub mod background;
pub mod collections;
pub mod config;
pub mod fs;
pub mod index;
pub mod telemetry;
pub mod utils;
