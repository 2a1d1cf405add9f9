//! Resumable restore engine, endpoint side.
//!
//! Jobs arrive from the server's command channel or from recovery of
//! interrupted local sessions. A worker stages the body into a `.part`
//! file, persists its progress after every chunk and atomically renames
//! onto the destination once the end-to-end hash verifies.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use log::{debug, info, warn};
use openssl::sha::Sha256;
use tokio::sync::{mpsc, watch, Semaphore};

use crate::client::Client;
use crate::error::GuardError;
use crate::protocol::msg;
use crate::protocol::wire::{
    RestoreChunkReq, RestoreChunkResp, RestoreCommand, RestoreFinish, RestoreFinishResp,
    RestoreInit, RestoreInitResp, RestoreResume,
};
use crate::store::{LocalRestoreSession, LocalStore, RestoreStatus};
use crate::tools;

const RECOVERY_INTERVAL: Duration = Duration::from_secs(30);
const WORKER_SLOTS: usize = 2;
const CHUNK_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Clone, Debug)]
enum RestoreJob {
    Fresh { identity: String, version: u32 },
    Recover { session: LocalRestoreSession },
}

impl RestoreJob {
    fn identity(&self) -> &str {
        match self {
            RestoreJob::Fresh { identity, .. } => identity,
            RestoreJob::Recover { session } => &session.identity,
        }
    }
}

pub async fn run_dispatcher(
    client: Arc<Client>,
    db_path: PathBuf,
    device_id: String,
    fallback_dir: PathBuf,
    mut commands: mpsc::Receiver<RestoreCommand>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let store = LocalStore::open(&db_path)?;
    let admitted: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let slots = Arc::new(Semaphore::new(WORKER_SLOTS));
    let mut ticker = tokio::time::interval(RECOVERY_INTERVAL);

    loop {
        let job = tokio::select! {
            _ = shutdown.changed() => break,
            cmd = commands.recv() => match cmd {
                Some(cmd) => Some(RestoreJob::Fresh {
                    identity: cmd.identity,
                    version: cmd.version,
                }),
                None => break,
            },
            _ = ticker.tick() => {
                // recover sessions interrupted by a crash
                match tokio::task::block_in_place(|| store.open_restore_sessions()) {
                    Ok(sessions) => {
                        for session in sessions {
                            spawn_job(
                                RestoreJob::Recover { session },
                                &client, &db_path, &device_id, &fallback_dir,
                                &admitted, &slots,
                            );
                        }
                    }
                    Err(err) => warn!("restore recovery: {}", err),
                }
                None
            }
        };

        if let Some(job) = job {
            spawn_job(job, &client, &db_path, &device_id, &fallback_dir, &admitted, &slots);
        }
    }
    debug!("restore dispatcher stopped");
    Ok(())
}

fn spawn_job(
    job: RestoreJob,
    client: &Arc<Client>,
    db_path: &Path,
    device_id: &str,
    fallback_dir: &Path,
    admitted: &Arc<Mutex<HashSet<String>>>,
    slots: &Arc<Semaphore>,
) {
    let identity = job.identity().to_string();
    if !admitted.lock().unwrap().insert(identity.clone()) {
        return; // already being restored
    }
    let permit = match slots.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            admitted.lock().unwrap().remove(&identity);
            return; // pool exhausted; recovery re-queues later
        }
    };

    let client = client.clone();
    let db_path = db_path.to_owned();
    let device_id = device_id.to_string();
    let fallback_dir = fallback_dir.to_owned();
    let admitted = admitted.clone();
    tokio::spawn(async move {
        if let Err(err) = restore_file(&client, &db_path, &device_id, &fallback_dir, job).await {
            warn!("restore of {} failed - {}", identity, err);
        }
        admitted.lock().unwrap().remove(&identity);
        drop(permit);
    });
}

async fn restore_file(
    client: &Client,
    db_path: &Path,
    device_id: &str,
    fallback_dir: &Path,
    job: RestoreJob,
) -> Result<(), Error> {
    let store = tokio::task::block_in_place(|| LocalStore::open(db_path))?;

    let session = match job {
        RestoreJob::Recover { session } => {
            info!("resuming restore session {}", session.transfer_id);
            let resume = RestoreResume { transfer_id: session.transfer_id.clone() };
            match client.call::<_, RestoreInitResp>(msg::RESTORE_RESUME, &resume).await {
                Ok(_) => session,
                Err(err)
                    if matches!(
                        err.downcast_ref::<GuardError>(),
                        Some(GuardError::TransientNetwork(_))
                    ) =>
                {
                    // network trouble: keep the session for the next tick
                    return Err(err);
                }
                Err(err) => {
                    // the server no longer carries the session: abandon
                    // it and start over
                    warn!(
                        "{}",
                        GuardError::SessionMismatch(format!(
                            "restore {} - {}",
                            session.transfer_id, err
                        ))
                    );
                    store.set_restore_status(&session.transfer_id, RestoreStatus::Failed)?;
                    init_session(client, &store, device_id, fallback_dir,
                                 &session.identity, session.version).await?
                }
            }
        }
        RestoreJob::Fresh { identity, version } => {
            init_session(client, &store, device_id, fallback_dir, &identity, version).await?
        }
    };

    pull_chunks(client, &store, session).await
}

/// Initialize a fresh server session and persist the local record.
async fn init_session(
    client: &Client,
    store: &LocalStore,
    device_id: &str,
    fallback_dir: &Path,
    identity: &str,
    version: u32,
) -> Result<LocalRestoreSession, Error> {
    let init = RestoreInit {
        device_id: device_id.to_string(),
        identity: identity.to_string(),
        version,
    };
    let resp: RestoreInitResp = client.call(msg::RESTORE_INIT, &init).await?;

    // restore to the original location when the item is still known
    let destination = match store.item_by_identity(identity)? {
        Some(item) => PathBuf::from(item.current_path),
        None => {
            std::fs::create_dir_all(fallback_dir)?;
            fallback_dir.join(tools::sanitize_file_name(&resp.file_name))
        }
    };
    let mut local_path = destination.into_os_string();
    local_path.push(".part");

    let session = LocalRestoreSession {
        transfer_id: resp.transfer_id,
        identity: identity.to_string(),
        version: resp.version,
        local_path: PathBuf::from(local_path),
        current_offset: 0,
        total_size: resp.total_size,
        expected_hash: resp.full_hash,
        status: RestoreStatus::InProgress,
        updated_at: tools::epoch_i64(),
    };
    store.create_restore_session(&session)?;
    Ok(session)
}

async fn pull_chunks(
    client: &Client,
    store: &LocalStore,
    session: LocalRestoreSession,
) -> Result<(), Error> {
    let (mut file, mut offset, mut hasher) = tokio::task::block_in_place(|| {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&session.local_path)
            .map_err(|err| format_err!("open {:?} failed - {}", session.local_path, err))?;

        // trust what is actually staged on disk over the recorded offset
        let staged = file.metadata()?.len();
        let offset = session.current_offset.min(staged);

        let mut hasher = Sha256::new();
        if offset > 0 {
            file.seek(SeekFrom::Start(0))?;
            let mut remaining = offset;
            let mut buf = vec![0u8; 1024 * 1024];
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let n = file.read(&mut buf[..want])?;
                if n == 0 {
                    bail!("staging file shrank below offset {}", offset);
                }
                hasher.update(&buf[..n]);
                remaining -= n as u64;
            }
        }
        file.seek(SeekFrom::Start(offset))?;
        Ok::<_, Error>((file, offset, hasher))
    })?;

    if offset != session.current_offset {
        store.update_restore_offset(&session.transfer_id, offset)?;
    }

    while offset < session.total_size {
        let size = CHUNK_SIZE.min(session.total_size - offset);
        let req = RestoreChunkReq {
            transfer_id: session.transfer_id.clone(),
            offset,
            size,
        };
        let resp: RestoreChunkResp = client.call(msg::RESTORE_CHUNK, &req).await?;
        let data = hex::decode(&resp.data)
            .map_err(|err| format_err!("chunk at offset {} is not valid hex - {}", offset, err))?;
        if data.is_empty() {
            return Err(GuardError::Fatal(format!(
                "server returned an empty chunk at offset {} of {}",
                offset, session.total_size
            ))
            .into());
        }

        tokio::task::block_in_place(|| file.write_all(&data))?;
        hasher.update(&data);
        offset += data.len() as u64;
        store.update_restore_offset(&session.transfer_id, offset)?;
        debug!(
            "restore {}: {}/{} bytes",
            session.transfer_id, offset, session.total_size
        );
    }

    let finish = RestoreFinish { transfer_id: session.transfer_id.clone() };
    if let Err(err) = client.call::<_, RestoreFinishResp>(msg::RESTORE_FINISH, &finish).await {
        // the body is complete; verification decides the outcome
        warn!("restore finish for {} - {}", session.transfer_id, err);
    }

    tokio::task::block_in_place(|| file.sync_all())?;
    drop(file);

    let actual = tools::digest_to_hex(&hasher.finish());
    if actual != session.expected_hash {
        store.set_restore_status(&session.transfer_id, RestoreStatus::Failed)?;
        // keep the .part file for inspection
        return Err(GuardError::HashMismatch {
            expected: session.expected_hash,
            actual,
        }
        .into());
    }

    let destination = strip_part_suffix(&session.local_path);
    tokio::task::block_in_place(|| {
        if destination.exists() {
            std::fs::remove_file(&destination)?;
        }
        std::fs::rename(&session.local_path, &destination)
            .map_err(|err| format_err!("rename to {:?} failed - {}", destination, err))
    })?;
    store.set_restore_status(&session.transfer_id, RestoreStatus::Done)?;
    info!("restored {:?} (version {})", destination, session.version);
    Ok(())
}

fn strip_part_suffix(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_suffix(".part") {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_owned(),
    }
}
