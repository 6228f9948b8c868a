//! Library publishing.

mod symlink;
mod types;

pub use symlink::{folder_name, SymlinkPublisher};
pub use types::{PublishError, PublishRequest, PublishResult, Publisher};
