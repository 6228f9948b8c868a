//! Debrid download clients.

mod real_debrid;
mod types;

pub use real_debrid::{RealDebridClient, RealDebridConfig};
pub use types::{DownloadClient, DownloadError, DownloadRequest, DownloadStatus};
