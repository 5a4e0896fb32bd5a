//! `http(s)://` snapshot source.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use tracing::debug;

use crate::domain::SnapshotError;
use crate::ports::{SnapshotReader, SnapshotSource};

/// Streams an archive over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    /// `connect_timeout` bounds connection setup only; transfers may take
    /// as long as they need.
    pub fn new(connect_timeout: Duration) -> Result<Self, SnapshotError> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { client })
    }
}

struct HttpReader {
    response: Response,
}

#[async_trait]
impl SnapshotReader for HttpReader {
    fn total_bytes(&self) -> Option<u64> {
        self.response.content_length()
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SnapshotError> {
        Ok(self.response.chunk().await?.map(|bytes| bytes.to_vec()))
    }
}

#[async_trait]
impl SnapshotSource for HttpSource {
    async fn open(&self, url: &str) -> Result<Box<dyn SnapshotReader>, SnapshotError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        debug!(url, length = ?response.content_length(), "snapshot transfer opened");
        Ok(Box::new(HttpReader { response }))
    }
}
