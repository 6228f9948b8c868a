//! Metadata indexing.
//!
//! Resolves canonical titles, ids, release dates and the season/episode
//! tree for an item.

mod tmdb;
mod types;

pub use tmdb::{TmdbConfig, TmdbIndexer};
pub use types::{IndexedMetadata, MetadataError, MetadataIndexer};
