//! Library layout configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Main library plus custom library profiles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Root of the main library. Unset disables main-library placement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_path: Option<PathBuf>,

    /// Custom libraries, evaluated in order. The first match wins.
    #[serde(default)]
    pub profiles: Vec<LibraryProfile>,
}

impl LibraryConfig {
    pub fn profile(&self, name: &str) -> Option<&LibraryProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

/// A custom library with include/exclude filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryProfile {
    pub name: String,
    pub path: PathBuf,

    #[serde(default = "default_true")]
    pub active: bool,

    /// Also place matched items in the main library.
    #[serde(default)]
    pub duplicate_in_main_library: bool,

    #[serde(default)]
    pub filters: LibraryFilters,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibraryFilters {
    #[serde(default)]
    pub include: Vec<LibraryFilter>,
    #[serde(default)]
    pub exclude: Vec<LibraryFilter>,
}

/// One predicate. `value` may be a comma-separated list for every kind
/// except `category`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryFilter {
    #[serde(rename = "type")]
    pub kind: FilterKind,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Genre,
    Rating,
    Category,
    Resolution,
    Codec,
}
