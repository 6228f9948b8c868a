//! Library matching.
//!
//! Assigns each item zero or one custom library. Items without a custom
//! library go to the main library only.

mod config;
mod matcher;

pub use config::{FilterKind, LibraryConfig, LibraryFilter, LibraryFilters, LibraryProfile};
pub use matcher::{LibraryAssignment, LibraryError, LibraryMatcher, ProfileLibraryMatcher};
