//! Restore session handlers and the administrator trigger.

use anyhow::{bail, format_err, Error};
use log::info;
use uuid::Uuid;

use crate::error::GuardError;
use crate::protocol::wire::{
    AdminRestore, AdminRestoreResp, RestoreChunkReq, RestoreChunkResp, RestoreCommand,
    RestoreFinish, RestoreFinishResp, RestoreInit, RestoreInitResp, RestoreResume,
};
use crate::protocol::{msg, Frame};
use crate::server::store::{RestoreSession, SessionStatus};
use crate::server::{command_bus, ServerState};

/// Administrator-triggered restore: queue a command for the device and
/// push it immediately when its command channel is online.
pub fn handle_admin_trigger(state: &ServerState, frame: &Frame) -> Result<Frame, Error> {
    let req: AdminRestore = frame.parse()?;

    {
        let store = state.store.lock().unwrap();
        if store.snapshot(&req.device_id, &req.identity, req.version)?.is_none() {
            bail!(
                "no snapshot for {}/{} version {}",
                req.device_id,
                req.identity,
                req.version
            );
        }
    }

    let command = RestoreCommand { identity: req.identity, version: req.version };
    let payload = serde_json::to_string(&command)?;
    let pushed = command_bus::issue(state, &req.device_id, msg::RESTORE_COMMAND, &payload)?;

    let message = if pushed {
        "restore command sent to device"
    } else {
        "device offline, command queued"
    };
    Frame::response(
        msg::ADMIN_RESTORE_RESP,
        &AdminRestoreResp { status: "ok".to_string(), message: message.to_string() },
    )
}

pub fn handle_init(state: &ServerState, frame: &Frame) -> Result<Frame, Error> {
    let req: RestoreInit = frame.parse()?;

    let store = state.store.lock().unwrap();
    let snapshot = store
        .snapshot(&req.device_id, &req.identity, req.version)?
        .ok_or_else(|| {
            format_err!(
                "no snapshot for {}/{} version {}",
                req.device_id,
                req.identity,
                req.version
            )
        })?;
    if !snapshot.blob_path.is_file() {
        // snapshot row without blob: surface, leave the item alone
        bail!(GuardError::Fatal(format!(
            "snapshot blob {:?} is missing",
            snapshot.blob_path
        )));
    }

    let file_name = snapshot
        .blob_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "restored_file".to_string());

    let session = RestoreSession {
        transfer_id: Uuid::new_v4().to_string(),
        device_id: req.device_id,
        identity: req.identity,
        file_name: file_name.clone(),
        version: snapshot.version,
        blob_path: snapshot.blob_path,
        total_size: snapshot.size,
        full_hash: snapshot.full_hash,
        status: SessionStatus::InProgress,
    };
    store.create_restore_session(&session)?;
    info!(
        "restore session {} opened for {}/{} version {}",
        session.transfer_id, session.device_id, session.identity, session.version
    );

    Frame::response(
        msg::RESTORE_INIT_RESP,
        &RestoreInitResp {
            transfer_id: session.transfer_id,
            file_name,
            version: session.version,
            total_size: session.total_size,
            full_hash: session.full_hash,
        },
    )
}

pub fn handle_chunk(state: &ServerState, frame: &Frame) -> Result<Frame, Error> {
    let req: RestoreChunkReq = frame.parse()?;

    let session = {
        let store = state.store.lock().unwrap();
        store
            .restore_session(&req.transfer_id)?
            .ok_or_else(|| GuardError::SessionMismatch(req.transfer_id.clone()))?
    };
    if session.status != SessionStatus::InProgress {
        bail!(GuardError::SessionMismatch(format!(
            "session {} is {}",
            session.transfer_id,
            session.status.as_str()
        )));
    }

    let data = state.blobs.read_at(&session.blob_path, req.offset, req.size)?;
    Frame::response(
        msg::RESTORE_CHUNK_RESP,
        &RestoreChunkResp { data_len: data.len() as u64, data: hex::encode(data) },
    )
}

pub fn handle_finish(state: &ServerState, frame: &Frame) -> Result<Frame, Error> {
    let req: RestoreFinish = frame.parse()?;

    let store = state.store.lock().unwrap();
    store.set_restore_status(&req.transfer_id, SessionStatus::Done)?;
    Frame::response(
        msg::RESTORE_FINISH_RESP,
        &RestoreFinishResp { status: "ok".to_string() },
    )
}

/// A session resumes if and only if it is still `in_progress`.
pub fn handle_resume(state: &ServerState, frame: &Frame) -> Result<Frame, Error> {
    let req: RestoreResume = frame.parse()?;

    let store = state.store.lock().unwrap();
    let session = store
        .restore_session(&req.transfer_id)?
        .ok_or_else(|| GuardError::SessionMismatch(req.transfer_id.clone()))?;
    if session.status != SessionStatus::InProgress {
        bail!(GuardError::SessionMismatch(format!(
            "session {} is {}",
            session.transfer_id,
            session.status.as_str()
        )));
    }

    Frame::response(
        msg::RESTORE_RESUME_RESP,
        &RestoreInitResp {
            transfer_id: session.transfer_id,
            file_name: session.file_name,
            version: session.version,
            total_size: session.total_size,
            full_hash: session.full_hash,
        },
    )
}
