//! Small helpers shared by the endpoint and the server.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, format_err, Error};
use openssl::sha::{sha1, Sha256};

/// Seconds since the UNIX epoch.
pub fn epoch_i64() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Render a digest as lowercase hex.
pub fn digest_to_hex(digest: &[u8]) -> String {
    hex::encode(digest)
}

/// Deterministic identity for folders.
///
/// Folders cannot carry the attribute tag, so their identity is derived
/// from `device_id || ':' || absolute_path`. The server derives placeholder
/// folder nodes the same way, so the two sides converge on one node per
/// folder.
pub fn folder_identity(device_id: &str, path: &Path) -> String {
    let mut input = Vec::new();
    input.extend_from_slice(device_id.as_bytes());
    input.push(b':');
    input.extend_from_slice(path.to_string_lossy().as_bytes());
    format!("folder-{}", digest_to_hex(&sha1(&input)))
}

/// Streaming SHA-256 over a whole file. Returns the hex digest and the
/// number of bytes read.
pub fn sha256_file(path: &Path) -> Result<(String, u64), Error> {
    let mut file =
        File::open(path).map_err(|err| format_err!("open {:?} failed - {}", path, err))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((digest_to_hex(&hasher.finish()), total))
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `data` to `path` atomically: write a sibling temp file, then
/// rename over the destination.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let path = path.as_ref();
    let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut tmp_path = path.to_owned();
    tmp_path.set_extension(format!("tmp_{}_{}", process::id(), n));

    if let Err(err) = std::fs::write(&tmp_path, data) {
        let _ = std::fs::remove_file(&tmp_path);
        bail!("write {:?} failed - {}", tmp_path, err);
    }
    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        bail!("atomic rename to {:?} failed - {}", path, err);
    }
    Ok(())
}

/// The last path component, or a placeholder when there is none. Keeps
/// client-supplied file names inside the blob tree.
pub fn sanitize_file_name(name: &str) -> String {
    match Path::new(name).file_name() {
        Some(base) => base.to_string_lossy().into_owned(),
        None => "unnamed".to_string(),
    }
}
