//! Symlink publisher.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info};

use super::{PublishError, PublishRequest, PublishResult, Publisher};
use crate::item::{Item, MediaKind};
use crate::library::LibraryConfig;

/// Creates `<root>/<movies|shows>/<Title (Year) {imdb}>[/Season NN]/<file>`
/// links in the main library and/or the item's custom library.
pub struct SymlinkPublisher {
    libraries: LibraryConfig,
}

impl SymlinkPublisher {
    pub fn new(libraries: LibraryConfig) -> Self {
        Self { libraries }
    }

    /// Library roots the item belongs in.
    pub fn roots(&self, item: &Item) -> Result<Vec<PathBuf>, PublishError> {
        let mut roots = Vec::new();
        let custom = match item.assigned_library.as_deref() {
            Some(name) => Some(
                self.libraries
                    .profile(name)
                    .ok_or_else(|| PublishError::UnknownLibrary(name.to_string()))?,
            ),
            None => None,
        };

        let include_main = custom.is_none() || item.duplicate_in_main_library;
        if include_main {
            if let Some(ref main) = self.libraries.main_path {
                roots.push(main.clone());
            }
        }
        if let Some(profile) = custom {
            roots.push(profile.path.clone());
        }

        if roots.is_empty() {
            return Err(PublishError::NoDestination(item.id.clone()));
        }
        Ok(roots)
    }

    /// Folder for the item inside a library root.
    pub fn item_dir(root: &Path, item: &Item, season_number: Option<u32>) -> PathBuf {
        let kind_dir = match item.media_kind {
            MediaKind::Movie => "movies",
            MediaKind::Series => "shows",
        };
        let mut dir = root.join(kind_dir).join(folder_name(item));
        if let (MediaKind::Series, Some(season)) = (item.media_kind, season_number) {
            dir = dir.join(format!("Season {:02}", season));
        }
        dir
    }

    async fn link(source: &Path, destination: &Path) -> Result<(), PublishError> {
        if let Ok(existing) = fs::symlink_metadata(destination).await {
            if !existing.file_type().is_symlink() {
                return Err(PublishError::DestinationExists {
                    path: destination.to_path_buf(),
                });
            }
            if fs::read_link(destination).await? == source {
                debug!(destination = %destination.display(), "Link already in place");
                return Ok(());
            }
            fs::remove_file(destination).await?;
        }

        create_symlink(source, destination)
            .await
            .map_err(|error| PublishError::LinkFailed {
                source_path: source.to_path_buf(),
                destination: destination.to_path_buf(),
                error,
            })
    }
}

#[cfg(unix)]
async fn create_symlink(source: &Path, destination: &Path) -> std::io::Result<()> {
    fs::symlink(source, destination).await
}

#[cfg(not(unix))]
async fn create_symlink(_source: &Path, _destination: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are only supported on unix",
    ))
}

/// "Title (Year) {imdb}" with path separators removed.
pub fn folder_name(item: &Item) -> String {
    let mut name: String = item
        .title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            c => c,
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if let Some(year) = item.year {
        name.push_str(&format!(" ({})", year));
    }
    if let Some(ref imdb) = item.external_ids.imdb {
        name.push_str(&format!(" {{{}}}", imdb));
    }
    name
}

#[async_trait]
impl Publisher for SymlinkPublisher {
    fn name(&self) -> &str {
        "symlink"
    }

    async fn publish(&self, request: &PublishRequest) -> Result<PublishResult, PublishError> {
        let candidate = &request.candidate;
        let source = candidate
            .local_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| PublishError::MissingLocalPath(candidate.id.clone()))?;

        if fs::metadata(&source).await.is_err() {
            return Err(PublishError::SourceNotFound { path: source });
        }
        let file_name = source
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| PublishError::SourceNotFound {
                path: source.clone(),
            })?;

        let mut links = Vec::new();
        for root in self.roots(&request.item)? {
            let dir = Self::item_dir(&root, &request.item, request.season_number);
            fs::create_dir_all(&dir)
                .await
                .map_err(|source| PublishError::DirectoryCreationFailed {
                    path: dir.clone(),
                    source,
                })?;

            let destination = dir.join(&file_name);
            Self::link(&source, &destination).await?;
            info!(
                item_id = %request.item.id,
                source = %source.display(),
                destination = %destination.display(),
                "Published"
            );
            links.push(destination);
        }

        Ok(PublishResult { links })
    }
}
