//! [`PieceProvider`] over a fully downloaded file on disk.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use super::traits::{PieceProvider, PieceProviderError};

/// Reads byte ranges from a local file.
pub struct FileProvider {
    path: PathBuf,
    file: Mutex<File>,
    size: u64,
}

impl FileProvider {
    /// Opens `path` and records its current size.
    ///
    /// # Errors
    ///
    /// - `std::io::Error` - File cannot be opened or inspected
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        let size = file.metadata().await?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl PieceProvider for FileProvider {
    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes, PieceProviderError> {
        if offset >= self.size {
            return Err(PieceProviderError::InvalidRange {
                offset,
                length,
                file_size: self.size,
            });
        }

        let wanted = (self.size - offset).min(length as u64) as usize;
        let mut buffer = BytesMut::zeroed(wanted);
        let mut filled = 0;

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| PieceProviderError::StorageError(e.to_string()))?;

        while filled < wanted {
            let read = file
                .read(&mut buffer[filled..])
                .await
                .map_err(|e| PieceProviderError::StorageError(e.to_string()))?;
            if read == 0 {
                break;
            }
            filled += read;
        }

        buffer.truncate(filled);
        Ok(buffer.freeze())
    }

    async fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_reads_requested_slice() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("movie.mp4");
        std::fs::write(&path, b"0123456789").unwrap();

        let provider = FileProvider::open(&path).await.unwrap();

        assert_eq!(provider.size().await, 10);
        assert_eq!(&provider.read_at(2, 3).await.unwrap()[..], b"234");
        assert_eq!(&provider.read_at(8, 100).await.unwrap()[..], b"89");
        assert!(matches!(
            provider.read_at(10, 1).await,
            Err(PieceProviderError::InvalidRange { .. })
        ));
    }
}
