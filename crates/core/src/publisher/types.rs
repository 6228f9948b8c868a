//! Types for publishers.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::item::{Candidate, Item};

/// A downloaded candidate ready to be placed.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub item: Item,
    pub candidate: Candidate,
    /// Season folder for series releases.
    pub season_number: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishResult {
    /// Links created or refreshed.
    pub links: Vec<PathBuf>,
}

/// Errors that can occur while publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Candidate {0} has no local path")]
    MissingLocalPath(String),

    #[error("Source not found: {path}")]
    SourceNotFound { path: PathBuf },

    #[error("Destination exists and is not a link: {path}")]
    DestinationExists { path: PathBuf },

    #[error("No library destination for item {0}")]
    NoDestination(String),

    #[error("Unknown library: {0}")]
    UnknownLibrary(String),

    #[error("Failed to create directory: {path}")]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to link {destination} -> {source_path}")]
    LinkFailed {
        source_path: PathBuf,
        destination: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Places downloaded files into libraries.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    /// Create the placements for one candidate. Repeating a publish for the
    /// same candidate refreshes the same links.
    async fn publish(&self, request: &PublishRequest) -> Result<PublishResult, PublishError>;
}
