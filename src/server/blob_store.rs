//! Filesystem-backed storage of snapshot bodies.
//!
//! Blobs live at `<storage_root>/<device>/<identity>/v<version>/<file_name>`
//! and are written with random-access writes at the offsets supplied by
//! the endpoint; nothing is deleted until an operator cleans up.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};

use crate::tools;

#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn blob_path(&self, device_id: &str, identity: &str, version: u32, file_name: &str) -> PathBuf {
        self.root
            .join(device_id)
            .join(identity)
            .join(format!("v{}", version))
            .join(tools::sanitize_file_name(file_name))
    }

    /// Write `data` at `offset`, creating the blob (and its directories)
    /// on first use.
    pub fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<(), Error> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|err| format_err!("unable to create {:?} - {}", dir, err))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|err| format_err!("open {:?} failed - {}", path, err))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Read up to `size` bytes at `offset`; short reads at EOF are fine.
    pub fn read_at(&self, path: &Path, offset: u64, size: u64) -> Result<Vec<u8>, Error> {
        let mut file = std::fs::File::open(path)
            .map_err(|err| format_err!("open {:?} failed - {}", path, err))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Full-body hash and size of a stored blob.
    pub fn verify(&self, path: &Path) -> Result<(String, u64), Error> {
        tools::sha256_file(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn random_access_writes_compose_a_body() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path());
        let path = blobs.blob_path("dev", "id", 1, "a.bin");

        blobs.write_at(&path, 0, b"hello ").unwrap();
        blobs.write_at(&path, 6, b"world").unwrap();

        assert_eq!(blobs.read_at(&path, 0, 64).unwrap(), b"hello world");
        assert_eq!(blobs.read_at(&path, 6, 2).unwrap(), b"wo");
        // short read at EOF
        assert_eq!(blobs.read_at(&path, 9, 64).unwrap(), b"ld");
    }

    #[test]
    fn blob_path_confines_file_names() {
        let blobs = BlobStore::new("/srv/blobs");
        let path = blobs.blob_path("dev", "id", 2, "../../escape");
        assert_eq!(path, PathBuf::from("/srv/blobs/dev/id/v2/escape"));
    }
}
