use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

pub mod local;
pub mod object;

pub use local::LocalFileStore;
pub use object::ObjectFileStore;

/// Boxed byte stream handed back by [`FileStore::open_read_stream`].
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Errors from file store operations.
///
/// `NotFound` is deliberately distinct from the I/O variants so the worker
/// can classify a missing object as non-retryable.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The locator does not resolve to a stored object
    #[error("no stored object for locator {0}")]
    NotFound(String),

    /// Local filesystem failure
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote object storage failure
    #[error("object storage error: {0}")]
    Remote(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Persists raw recording bytes and hands back opaque locators for later
/// retrieval. Implementations are interchangeable: a locator is only
/// meaningful to the store that issued it.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Persist `bytes` under a collision-free name derived from `filename`,
    /// returning the locator to store on the recording row.
    async fn save(&self, filename: &str, bytes: &[u8]) -> Result<String, StoreError>;

    /// Open a lazy, forward-only byte stream over a previously stored object.
    async fn open_read_stream(&self, locator: &str) -> Result<ByteReader, StoreError>;

    /// Collaborator-facing download link for a stored object. Not used by the
    /// transcription pipeline itself.
    fn url_for(&self, locator: &str) -> String;
}

/// Strip path separators so an uploaded filename cannot escape the store's
/// namespace.
pub(crate) fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c => c,
        })
        .collect();

    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Millisecond-prefixed object name, unique per save even for repeated
/// filenames.
pub(crate) fn unique_object_name(filename: &str) -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().timestamp_millis(),
        sanitize_filename(filename)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("call.mp3"), "call.mp3");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("a\\b.wav"), "a_b.wav");
        assert_eq!(sanitize_filename(""), "unnamed");
    }

    #[test]
    fn test_unique_object_name_keeps_filename() {
        let name = unique_object_name("meeting.mp3");
        assert!(name.ends_with("-meeting.mp3"));

        let prefix = name.strip_suffix("-meeting.mp3").unwrap();
        assert!(prefix.parse::<i64>().is_ok());
    }
}
