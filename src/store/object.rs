use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::StatusCode;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::debug;

use super::{unique_object_name, ByteReader, FileStore, StoreError};

const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Remote object store speaking plain HTTP: `PUT {endpoint}/{key}` to write,
/// `GET {endpoint}/{key}` to read back. Locators are bare object keys, which
/// is also how remote imports arrive (the import path stores the key without
/// ever writing through this store).
pub struct ObjectFileStore {
    client: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
}

impl ObjectFileStore {
    pub fn new(
        endpoint: impl Into<String>,
        access_token: Option<String>,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| StoreError::Remote(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            access_token,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint, key)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }
}

#[async_trait]
impl FileStore for ObjectFileStore {
    async fn save(&self, filename: &str, bytes: &[u8]) -> Result<String, StoreError> {
        let key = unique_object_name(filename);
        let url = self.object_url(&key);

        let response = self
            .authorize(self.client.put(&url))
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Remote(format!(
                "PUT {} returned {}",
                url,
                response.status()
            )));
        }

        debug!("Stored {} bytes at {}", bytes.len(), url);
        Ok(key)
    }

    async fn open_read_stream(&self, locator: &str) -> Result<ByteReader, StoreError> {
        let url = self.object_url(locator);

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| StoreError::Remote(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(locator.to_string())),
            status if status.is_success() => {
                let stream = response
                    .bytes_stream()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
                Ok(Box::new(StreamReader::new(stream)))
            }
            status => Err(StoreError::Remote(format!("GET {url} returned {status}"))),
        }
    }

    fn url_for(&self, locator: &str) -> String {
        self.object_url(locator)
    }
}
