/// File-tree archives (tar + gzip) and gzip helpers for single-stream artifacts.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use super::error::{OpsError, Result};

/// Captures and restores a set of paths relative to a base directory
#[async_trait]
pub trait FileTreeAdapter: Send + Sync {
    /// Archive `paths` (relative to `base`) into a compressed byte stream
    async fn archive(&self, base: &Path, paths: &[PathBuf]) -> Result<Vec<u8>>;

    /// Unpack an archive produced by `archive` into `dest`
    async fn extract(&self, data: &[u8], dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TarArchiver;

impl TarArchiver {
    pub fn new() -> Self {
        Self
    }

    fn archive_blocking(base: &Path, paths: &[PathBuf]) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        {
            let encoder = GzEncoder::new(&mut buffer, Compression::default());
            let mut tar = Builder::new(encoder);
            tar.follow_symlinks(false);

            for rel in paths {
                let abs = base.join(rel);
                if abs.is_dir() {
                    tar.append_dir_all(rel, &abs)?;
                } else if abs.exists() {
                    tar.append_path_with_name(&abs, rel)?;
                } else {
                    return Err(OpsError::PreconditionFailed(format!(
                        "{} does not exist",
                        abs.display()
                    )));
                }
            }

            tar.into_inner()?.finish()?;
        }
        Ok(buffer)
    }

    fn extract_blocking(data: &[u8], dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        let mut archive = Archive::new(GzDecoder::new(data));
        archive.set_preserve_permissions(true);
        // unpack refuses entries that escape `dest`
        archive.unpack(dest)?;
        Ok(())
    }
}

#[async_trait]
impl FileTreeAdapter for TarArchiver {
    async fn archive(&self, base: &Path, paths: &[PathBuf]) -> Result<Vec<u8>> {
        let base = base.to_path_buf();
        let paths = paths.to_vec();
        tokio::task::spawn_blocking(move || Self::archive_blocking(&base, &paths))
            .await
            .map_err(|e| OpsError::Io(std::io::Error::other(e)))?
    }

    async fn extract(&self, data: &[u8], dest: &Path) -> Result<()> {
        let data = data.to_vec();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || Self::extract_blocking(&data, &dest))
            .await
            .map_err(|e| OpsError::Io(std::io::Error::other(e)))?
    }
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoded = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| OpsError::PreconditionFailed(format!("artifact is not valid gzip: {}", e)))?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_archive_and_extract_tree() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("uploads/avatars")).unwrap();
        std::fs::write(src.path().join("uploads/avatars/1.png"), b"png").unwrap();
        std::fs::write(src.path().join(".env"), b"DEBUG=false").unwrap();
        std::fs::write(src.path().join("ignored.txt"), b"not archived").unwrap();

        let archiver = TarArchiver::new();
        let data = archiver
            .archive(src.path(), &[PathBuf::from("uploads"), PathBuf::from(".env")])
            .await
            .unwrap();

        let dest = TempDir::new().unwrap();
        archiver.extract(&data, dest.path()).await.unwrap();
        assert_eq!(
            std::fs::read(dest.path().join("uploads/avatars/1.png")).unwrap(),
            b"png"
        );
        assert_eq!(std::fs::read(dest.path().join(".env")).unwrap(), b"DEBUG=false");
        assert!(!dest.path().join("ignored.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_path_fails_archive() {
        let src = TempDir::new().unwrap();
        let result = TarArchiver::new()
            .archive(src.path(), &[PathBuf::from("missing")])
            .await;
        assert!(matches!(result, Err(OpsError::PreconditionFailed(_))));
    }

    #[test]
    fn test_gzip_helpers() {
        let compressed = gzip(b"CREATE TABLE t ();").unwrap();
        assert_eq!(gunzip(&compressed).unwrap(), b"CREATE TABLE t ();");
        assert!(gunzip(b"plain text").is_err());
    }
}
