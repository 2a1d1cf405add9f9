//! Resumable backup engine, endpoint side.
//!
//! The dispatcher scans for files whose last modification is newer than
//! their last successful backup and admits at most `WORKER_SLOTS`
//! concurrent workers, keyed by identity so the same file is never driven
//! twice at once. Each worker probes the server for a resumable session,
//! streams 16 MiB chunks from the current offset and finishes with an
//! end-to-end SHA-256.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use log::{debug, info, warn};
use openssl::sha::Sha256;
use tokio::sync::{watch, Semaphore};

use crate::client::Client;
use crate::protocol::msg;
use crate::protocol::wire::{
    BackupCancel, BackupChunk, BackupChunkResp, BackupFinish, BackupFinishResp, BackupInit,
    BackupInitResp, BackupResumeProbe, BackupResumeResp, RESUME_FOUND,
};
use crate::store::{Item, LocalStore};
use crate::tools;

const DISPATCH_INTERVAL: Duration = Duration::from_secs(10);
const CANDIDATE_BATCH: usize = 10;
const WORKER_SLOTS: usize = 3;

/// Transfer buffer; the server is prepared to receive frames of this
/// order of magnitude.
const CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Prefix length of the cheap resume fingerprint.
const HEAD_SIZE: u64 = 64 * 1024;

pub async fn run_dispatcher(
    client: Arc<Client>,
    db_path: PathBuf,
    device_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let store = LocalStore::open(&db_path)?;
    let admitted: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let slots = Arc::new(Semaphore::new(WORKER_SLOTS));
    let mut ticker = tokio::time::interval(DISPATCH_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let candidates =
            tokio::task::block_in_place(|| store.backup_candidates(CANDIDATE_BATCH));
        let candidates = match candidates {
            Ok(items) => items,
            Err(err) => {
                warn!("backup dispatcher: {}", err);
                continue;
            }
        };

        for item in candidates {
            // insert-if-absent admission: at most one worker per identity
            if !admitted.lock().unwrap().insert(item.identity.clone()) {
                continue;
            }
            let permit = match slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    admitted.lock().unwrap().remove(&item.identity);
                    break; // pool exhausted, wait for the next tick
                }
            };

            let client = client.clone();
            let db_path = db_path.clone();
            let device_id = device_id.clone();
            let admitted = admitted.clone();
            tokio::spawn(async move {
                let identity = item.identity.clone();
                match backup_file(&client, &db_path, &device_id, &item).await {
                    Ok(version) => {
                        info!("backed up {} as version {}", item.current_path, version)
                    }
                    // a failed run leaves last_backup_at untouched; the
                    // next tick retries
                    Err(err) => warn!("backup of {} failed - {}", item.current_path, err),
                }
                admitted.lock().unwrap().remove(&identity);
                drop(permit);
            });
        }
    }
    debug!("backup dispatcher stopped");
    Ok(())
}

/// Drive one file through probe/init, chunk upload and finish.
async fn backup_file(
    client: &Client,
    db_path: &Path,
    device_id: &str,
    item: &Item,
) -> Result<u32, Error> {
    let path = PathBuf::from(&item.current_path);

    let (mut file, total_size, head_hash) = tokio::task::block_in_place(|| {
        let mut file = std::fs::File::open(&path)
            .map_err(|err| format_err!("open {:?} failed - {}", path, err))?;
        let total_size = file.metadata()?.len();
        let head_hash = hash_prefix(&mut file, total_size.min(HEAD_SIZE))?;
        file.seek(SeekFrom::Start(0))?;
        Ok::<_, Error>((file, total_size, head_hash))
    })?;

    // probe for a resumable session before initiating a fresh one
    let probe = BackupResumeProbe {
        device_id: device_id.to_string(),
        identity: item.identity.clone(),
        head_hash: head_hash.clone(),
        total_size,
    };
    let probe_resp: BackupResumeResp = client.call(msg::BACKUP_RESUME, &probe).await?;

    let (transfer_id, mut offset, version) = if probe_resp.status == RESUME_FOUND {
        let transfer_id = probe_resp
            .transfer_id
            .ok_or_else(|| format_err!("resume response lacks transfer_id"))?;
        let offset = probe_resp.offset.unwrap_or(0);
        info!("resuming backup of {:?} at offset {}", path, offset);
        (transfer_id, offset, None)
    } else {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let init = BackupInit {
            device_id: device_id.to_string(),
            identity: item.identity.clone(),
            file_name,
            total_size,
            head_hash,
        };
        let resp: BackupInitResp = client.call(msg::BACKUP_INIT, &init).await?;
        (resp.transfer_id, 0, Some(resp.version))
    };

    let mut hasher = Sha256::new();
    if offset > 0 {
        // advance the running hash over the prefix the server already
        // holds, without retransmitting it
        tokio::task::block_in_place(|| hash_exact(&mut file, offset, &mut hasher))?;
    }

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = tokio::task::block_in_place(|| read_fully(&mut file, &mut buf))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);

        let chunk = BackupChunk {
            transfer_id: transfer_id.clone(),
            offset,
            data_len: n as u64,
            data: hex::encode(&buf[..n]),
        };
        let sent: Result<BackupChunkResp, Error> = client.call(msg::BACKUP_CHUNK, &chunk).await;
        if let Err(err) = sent {
            let cancel = BackupCancel { transfer_id: transfer_id.clone() };
            let _ = client.send_only(msg::BACKUP_CANCEL, &cancel).await;
            return Err(format_err!("chunk at offset {} failed - {}", offset, err));
        }
        offset += n as u64;
    }
    drop(buf);

    let full_hash = tools::digest_to_hex(&hasher.finish());
    let finish = BackupFinish { transfer_id: transfer_id.clone(), full_hash };
    let finished: Result<BackupFinishResp, Error> = client.call(msg::BACKUP_FINISH, &finish).await;
    let finished = match finished {
        Ok(resp) => resp,
        Err(err) => {
            let cancel = BackupCancel { transfer_id };
            let _ = client.send_only(msg::BACKUP_CANCEL, &cancel).await;
            return Err(err);
        }
    };

    tokio::task::block_in_place(|| {
        let store = LocalStore::open(db_path)?;
        store.mark_backed_up(&item.identity, tools::epoch_i64())
    })?;

    Ok(version.unwrap_or(finished.version))
}

/// SHA-256 of the first `len` bytes.
fn hash_prefix(file: &mut std::fs::File, len: u64) -> Result<String, Error> {
    let mut hasher = Sha256::new();
    hash_exact(file, len, &mut hasher)?;
    Ok(tools::digest_to_hex(&hasher.finish()))
}

/// Feed exactly `len` bytes from the current position into `hasher`.
fn hash_exact(file: &mut std::fs::File, len: u64, hasher: &mut Sha256) -> Result<(), Error> {
    let mut remaining = len;
    let mut buf = vec![0u8; 1024 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            bail!("file shrank below the expected {} bytes", len);
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(())
}

/// Fill `buf` as far as the file allows; 0 only at EOF.
fn read_fully(file: &mut std::fs::File, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
