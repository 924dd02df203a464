//! Local files: what this peer serves and where downloads land.

use std::io;
use std::path::{Path, PathBuf};

use seed_core::{ChunkReader, FileBitmap};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("bitmap claims file {file_id} but {} is missing", .path.display())]
    Missing { file_id: usize, path: PathBuf },
    #[error("creating download directory {}: {source}", .path.display())]
    DownloadDir { path: PathBuf, source: io::Error },
}

/// Files named `<fileId>.txt` under the share directory, one per set bit.
#[derive(Debug)]
pub struct Catalog {
    share_dir: PathBuf,
    download_dir: PathBuf,
    bitmap: FileBitmap,
}

impl Catalog {
    /// Check that every held file exists and create the download directory.
    pub fn new(
        share_dir: &Path,
        download_dir: &Path,
        bitmap: FileBitmap,
    ) -> Result<Self, CatalogError> {
        for file_id in bitmap.held_ids() {
            let path = file_path(share_dir, file_id);
            if !path.is_file() {
                return Err(CatalogError::Missing { file_id, path });
            }
        }
        std::fs::create_dir_all(download_dir).map_err(|source| CatalogError::DownloadDir {
            path: download_dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            share_dir: share_dir.to_path_buf(),
            download_dir: download_dir.to_path_buf(),
            bitmap,
        })
    }

    pub fn bitmap(&self) -> &FileBitmap {
        &self.bitmap
    }

    /// True if we announced `file_id` and its file is still on disk.
    pub fn contains(&self, file_id: u8) -> bool {
        let id = usize::from(file_id);
        self.bitmap.holds(id) && file_path(&self.share_dir, id).is_file()
    }

    pub fn source_path(&self, file_id: u8) -> PathBuf {
        file_path(&self.share_dir, usize::from(file_id))
    }

    /// Fresh single-use reader for one transfer.
    pub fn open_reader(&self, file_id: u8, chunk_size: usize) -> io::Result<ChunkReader> {
        ChunkReader::open(&self.source_path(file_id), chunk_size)
    }

    pub fn download_path(&self, file_id: u8) -> PathBuf {
        file_path(&self.download_dir, usize::from(file_id))
    }
}

fn file_path(dir: &Path, file_id: usize) -> PathBuf {
    dir.join(format!("{}.txt", file_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use seed_core::parse_bitmap;

    #[test]
    fn held_files_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = Catalog::new(
            dir.path(),
            &dir.path().join("downloads"),
            parse_bitmap("01").unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, CatalogError::Missing { file_id: 1, .. }));
    }

    #[test]
    fn contains_only_announced_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0.txt"), b"zero").unwrap();
        std::fs::write(dir.path().join("1.txt"), b"one").unwrap();
        let downloads = dir.path().join("downloads");
        let c = Catalog::new(dir.path(), &downloads, parse_bitmap("01").unwrap()).unwrap();
        assert!(c.contains(1));
        assert!(!c.contains(0));
        assert!(!c.contains(200));
        assert!(downloads.is_dir());
        assert_eq!(c.download_path(3), downloads.join("3.txt"));
    }

    #[test]
    fn contains_rechecks_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0.txt"), b"zero").unwrap();
        let c = Catalog::new(
            dir.path(),
            &dir.path().join("downloads"),
            parse_bitmap("1").unwrap(),
        )
        .unwrap();
        std::fs::remove_file(dir.path().join("0.txt")).unwrap();
        assert!(!c.contains(0));
    }
}
