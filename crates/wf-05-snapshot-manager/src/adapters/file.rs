//! `file://` snapshot source, for archives already on disk.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::domain::SnapshotError;
use crate::ports::{SnapshotReader, SnapshotSource};

const CHUNK_SIZE: usize = 64 * 1024;

/// Reads a local archive in fixed-size chunks.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSource;

/// Path of a `file://` URL.
pub fn file_url_path(url: &str) -> Option<PathBuf> {
    url.strip_prefix("file://")
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}

struct FileReader {
    file: File,
    len: u64,
}

#[async_trait]
impl SnapshotReader for FileReader {
    fn total_bytes(&self) -> Option<u64> {
        Some(self.len)
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SnapshotError> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let read = self
            .file
            .read(&mut buf)
            .await
            .map_err(|e| SnapshotError::io("read snapshot file", e))?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        Ok(Some(buf))
    }
}

#[async_trait]
impl SnapshotSource for FileSource {
    async fn open(&self, url: &str) -> Result<Box<dyn SnapshotReader>, SnapshotError> {
        let path = file_url_path(url).ok_or_else(|| SnapshotError::UnsupportedSource(url.into()))?;
        let file = File::open(&path)
            .await
            .map_err(|e| SnapshotError::Download(format!("{}: {e}", path.display())))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| SnapshotError::io("stat snapshot file", e))?
            .len();
        Ok(Box::new(FileReader { file, len }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_url_path() {
        assert_eq!(file_url_path("file:///tmp/a.tar"), Some(PathBuf::from("/tmp/a.tar")));
        assert_eq!(file_url_path("file://"), None);
        assert_eq!(file_url_path("https://x/a.tar"), None);
    }

    #[tokio::test]
    async fn test_reads_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.tar");
        std::fs::write(&path, vec![7u8; CHUNK_SIZE + 10]).unwrap();

        let mut reader = FileSource
            .open(&format!("file://{}", path.display()))
            .await
            .unwrap();
        assert_eq!(reader.total_bytes(), Some(CHUNK_SIZE as u64 + 10));

        let mut total = 0;
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            total += chunk.len();
        }
        assert_eq!(total, CHUNK_SIZE + 10);
    }
}
