//! Snapshot sources and the on-disk swap.

pub mod apply;
pub mod file;
pub mod http;

pub use apply::{apply_archive, recover_data_path, Recovery, TarApplier};
pub use file::{file_url_path, FileSource};
pub use http::HttpSource;

use async_trait::async_trait;

use crate::domain::SnapshotError;
use crate::ports::{SnapshotReader, SnapshotSource};

/// Picks the source by URL scheme.
#[derive(Debug, Clone)]
pub struct SchemeRouter {
    http: HttpSource,
    file: FileSource,
}

impl SchemeRouter {
    pub fn new(http: HttpSource) -> Self {
        Self {
            http,
            file: FileSource,
        }
    }
}

#[async_trait]
impl SnapshotSource for SchemeRouter {
    async fn open(&self, url: &str) -> Result<Box<dyn SnapshotReader>, SnapshotError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            self.http.open(url).await
        } else if url.starts_with("file://") {
            self.file.open(url).await
        } else {
            Err(SnapshotError::UnsupportedSource(url.to_string()))
        }
    }
}
