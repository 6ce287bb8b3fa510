//! Storage collaborator contract (§6) and its filesystem-backed
//! implementation. Out of scope as a product, but a concrete
//! implementation ships so the pipeline runs end to end; any
//! blob-addressable store satisfying this trait is a drop-in
//! replacement.

use std::path::PathBuf;

use async_trait::async_trait;
use error_types::{ErrorContext, MailerResult};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[async_trait]
pub trait MailingStorage: Send + Sync {
    /// Persist the CSV bytes, returning an opaque pointer that
    /// `fetch_to_temp_file` can later resolve.
    async fn save(&self, mailing_id: Uuid, filename: &str, bytes: &[u8]) -> MailerResult<String>;

    /// Resolve a storage pointer to a local, sequentially readable path.
    async fn fetch_to_temp_file(&self, pointer: &str) -> MailerResult<PathBuf>;
}

/// Filesystem-backed implementation rooted at a configurable directory.
/// The pointer it returns is simply the path relative to that root.
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl MailingStorage for FilesystemStorage {
    async fn save(&self, mailing_id: Uuid, filename: &str, bytes: &[u8]) -> MailerResult<String> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .context("failed to create storage root directory")?;

        let safe_name = filename.replace(['/', '\\'], "_");
        let relative = format!("{mailing_id}-{safe_name}");
        let full_path = self.root.join(&relative);

        let mut file = tokio::fs::File::create(&full_path)
            .await
            .context("failed to create storage file")?;
        file.write_all(bytes).await.context("failed to write storage file")?;
        file.flush().await.context("failed to flush storage file")?;

        Ok(relative)
    }

    async fn fetch_to_temp_file(&self, pointer: &str) -> MailerResult<PathBuf> {
        let full_path = self.root.join(pointer);
        if !tokio::fs::try_exists(&full_path)
            .await
            .context("failed to check storage file existence")?
        {
            return Err(error_types::MailerError::StorageFailure {
                detail: format!("storage object not found: {pointer}"),
            });
        }
        Ok(full_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_bytes_through_the_filesystem() {
        let dir = std::env::temp_dir().join(format!("mailer-storage-test-{}", Uuid::new_v4()));
        let storage = FilesystemStorage::new(&dir);

        let mailing_id = Uuid::new_v4();
        let pointer = storage.save(mailing_id, "recipients.csv", b"email\na@x.com\n").await.unwrap();

        let path = storage.fetch_to_temp_file(&pointer).await.unwrap();
        let contents = tokio::fs::read(path).await.unwrap();
        assert_eq!(contents, b"email\na@x.com\n");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn missing_pointer_is_a_storage_failure() {
        let dir = std::env::temp_dir().join(format!("mailer-storage-test-{}", Uuid::new_v4()));
        let storage = FilesystemStorage::new(&dir);

        let result = storage.fetch_to_temp_file("does-not-exist").await;
        assert!(matches!(result, Err(error_types::MailerError::StorageFailure { .. })));
    }
}
