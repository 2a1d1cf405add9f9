//! Backup session handlers: resume probe, init, chunk, finish, cancel.

use anyhow::{bail, Error};
use log::{info, warn};
use uuid::Uuid;

use crate::error::GuardError;
use crate::protocol::wire::{
    BackupCancel, BackupChunk, BackupChunkResp, BackupFinish, BackupFinishResp, BackupInit,
    BackupInitResp, BackupResumeProbe, BackupResumeResp, RESUME_FOUND, RESUME_MISMATCH,
    RESUME_NOT_FOUND,
};
use crate::protocol::{msg, Frame};
use crate::server::store::{BackupSession, SessionStatus, Snapshot};
use crate::server::ServerState;
use crate::tools;

/// `found` iff an `in_progress` session for the item carries the same
/// head fingerprint and size; a session with different parameters is a
/// `mismatch` and forces a fresh init.
pub fn handle_resume(state: &ServerState, frame: &Frame) -> Result<Frame, Error> {
    let probe: BackupResumeProbe = frame.parse()?;

    let store = state.store.lock().unwrap();
    let resp = match store.active_backup_session(&probe.device_id, &probe.identity)? {
        Some(session)
            if session.head_hash == probe.head_hash && session.total_size == probe.total_size =>
        {
            BackupResumeResp {
                status: RESUME_FOUND.to_string(),
                transfer_id: Some(session.transfer_id),
                offset: Some(session.current_offset),
            }
        }
        Some(_) => BackupResumeResp {
            status: RESUME_MISMATCH.to_string(),
            transfer_id: None,
            offset: None,
        },
        None => BackupResumeResp {
            status: RESUME_NOT_FOUND.to_string(),
            transfer_id: None,
            offset: None,
        },
    };
    Frame::response(msg::BACKUP_RESUME_RESP, &resp)
}

/// Allocate the next dense version and a fresh transfer, superseding any
/// session still in flight for the item.
pub fn handle_init(state: &ServerState, frame: &Frame) -> Result<Frame, Error> {
    let init: BackupInit = frame.parse()?;

    let store = state.store.lock().unwrap();
    let version = store.latest_snapshot_version(&init.device_id, &init.identity)? + 1;
    let transfer_id = Uuid::new_v4().to_string();
    let blob_path =
        state.blobs.blob_path(&init.device_id, &init.identity, version, &init.file_name);

    store.create_backup_session(&BackupSession {
        transfer_id: transfer_id.clone(),
        device_id: init.device_id.clone(),
        identity: init.identity.clone(),
        file_name: tools::sanitize_file_name(&init.file_name),
        version,
        current_offset: 0,
        total_size: init.total_size,
        head_hash: init.head_hash,
        blob_path,
        status: SessionStatus::InProgress,
        updated_at: tools::epoch_i64(),
    })?;
    info!(
        "backup session {} opened for {}/{} (version {}, {} bytes)",
        transfer_id, init.device_id, init.identity, version, init.total_size
    );

    Frame::response(msg::BACKUP_INIT_RESP, &BackupInitResp { transfer_id, version })
}

pub fn handle_chunk(state: &ServerState, frame: &Frame) -> Result<Frame, Error> {
    let chunk: BackupChunk = frame.parse()?;

    let session = {
        let store = state.store.lock().unwrap();
        store
            .backup_session(&chunk.transfer_id)?
            .ok_or_else(|| GuardError::SessionMismatch(chunk.transfer_id.clone()))?
    };
    if session.status != SessionStatus::InProgress {
        bail!(GuardError::SessionMismatch(format!(
            "session {} is {}",
            session.transfer_id,
            session.status.as_str()
        )));
    }

    let data = hex::decode(&chunk.data)?;
    if data.len() as u64 != chunk.data_len {
        bail!(
            "chunk length mismatch ({} declared, {} received)",
            chunk.data_len,
            data.len()
        );
    }

    // the endpoint writes sequentially, but out-of-order offsets are
    // accepted; the end-to-end hash catches corruption
    state.blobs.write_at(&session.blob_path, chunk.offset, &data)?;

    let store = state.store.lock().unwrap();
    let current_offset =
        store.update_backup_offset(&chunk.transfer_id, chunk.offset + data.len() as u64)?;

    Frame::response(msg::BACKUP_CHUNK_RESP, &BackupChunkResp { current_offset })
}

/// Verify the stored blob against the client hash before committing the
/// snapshot; recording an unverified client hash would let a corrupted
/// transfer masquerade as a snapshot.
pub fn handle_finish(state: &ServerState, frame: &Frame) -> Result<Frame, Error> {
    let finish: BackupFinish = frame.parse()?;

    let session = {
        let store = state.store.lock().unwrap();
        store
            .backup_session(&finish.transfer_id)?
            .ok_or_else(|| GuardError::SessionMismatch(finish.transfer_id.clone()))?
    };
    if session.status != SessionStatus::InProgress {
        bail!(GuardError::SessionMismatch(format!(
            "session {} is {}",
            session.transfer_id,
            session.status.as_str()
        )));
    }

    let (stored_hash, stored_size) = state.blobs.verify(&session.blob_path)?;
    if stored_size != session.total_size || stored_hash != finish.full_hash {
        let store = state.store.lock().unwrap();
        store.set_backup_status(&finish.transfer_id, SessionStatus::Failed)?;
        warn!(
            "backup session {} failed verification ({} bytes, hash {})",
            finish.transfer_id, stored_size, stored_hash
        );
        bail!(GuardError::HashMismatch {
            expected: finish.full_hash,
            actual: stored_hash,
        });
    }

    let store = state.store.lock().unwrap();
    store.insert_snapshot(&Snapshot {
        device_id: session.device_id.clone(),
        identity: session.identity.clone(),
        version: session.version,
        blob_path: session.blob_path.clone(),
        size: stored_size,
        full_hash: stored_hash,
        created_at: tools::epoch_i64(),
    })?;
    store.set_backup_status(&finish.transfer_id, SessionStatus::Done)?;
    info!(
        "snapshot {}/{} version {} committed ({} bytes)",
        session.device_id, session.identity, session.version, stored_size
    );

    Frame::response(msg::BACKUP_FINISH_RESP, &BackupFinishResp { version: session.version })
}

/// Mark the session canceled but keep the partial blob: a later probe
/// with matching head hash and size may still resume it forensically.
pub fn handle_cancel(state: &ServerState, frame: &Frame) -> Result<(), Error> {
    let cancel: BackupCancel = frame.parse()?;

    let store = state.store.lock().unwrap();
    if let Some(session) = store.backup_session(&cancel.transfer_id)? {
        if session.status == SessionStatus::InProgress {
            store.set_backup_status(&cancel.transfer_id, SessionStatus::Canceled)?;
            info!("backup session {} canceled", cancel.transfer_id);
        }
    }
    Ok(())
}
