use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Result, UploadError};

/// Reads a whole file into memory.
pub async fn read_file(path: &Path) -> Result<Vec<u8>> {
    Ok(tokio::fs::read(path).await?)
}

/// Reads the half-open byte range `[start, end)` of a file.
pub async fn read_range(path: &Path, start: u64, end: u64) -> Result<Vec<u8>> {
    if end <= start {
        return Err(UploadError::Range { start, end });
    }
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    if end > size {
        return Err(UploadError::ExceedsFileSize {
            path: path.display().to_string(),
            end,
            size,
        });
    }
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fixture(data: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(data).unwrap();
        f
    }

    #[tokio::test]
    async fn read_range_returns_exact_slice() {
        let f = fixture(b"0123456789");
        assert_eq!(read_range(f.path(), 2, 6).await.unwrap(), b"2345");
        assert_eq!(read_range(f.path(), 8, 10).await.unwrap(), b"89");
    }

    #[tokio::test]
    async fn read_range_rejects_empty_range() {
        let f = fixture(b"0123456789");
        let err = read_range(f.path(), 5, 5).await.unwrap_err();
        assert!(matches!(err, UploadError::Range { start: 5, end: 5 }));
    }

    #[tokio::test]
    async fn read_range_rejects_end_past_file() {
        let f = fixture(b"0123");
        let err = read_range(f.path(), 0, 5).await.unwrap_err();
        assert!(matches!(err, UploadError::ExceedsFileSize { size: 4, .. }));
    }

    #[tokio::test]
    async fn read_file_reads_everything() {
        let f = fixture(b"hello");
        assert_eq!(read_file(f.path()).await.unwrap(), b"hello");
    }
}
