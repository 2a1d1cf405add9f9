//! Asynchronous commands to devices: `pending → sent → (completed |
//! failed)`. Delivery is attempted immediately; a device that is offline
//! gets the queue drained in insertion order on its next reconnect.

use anyhow::Error;
use bytes::Bytes;
use log::{info, warn};

use crate::protocol::{Frame, STATUS_REQUEST};
use crate::server::store::CommandStatus;
use crate::server::ServerState;

/// Queue a command and try to push it. Returns whether it went out now.
pub fn issue(
    state: &ServerState,
    device_id: &str,
    command_type: u8,
    payload: &str,
) -> Result<bool, Error> {
    let id = {
        let store = state.store.lock().unwrap();
        store.insert_command(device_id, command_type, payload)?
    };

    let pushed = try_push(state, device_id, command_type, payload);
    if pushed {
        let store = state.store.lock().unwrap();
        store.set_command_status(id, CommandStatus::Sent)?;
    } else {
        info!("device {} offline, command {} stays pending", device_id, id);
    }
    Ok(pushed)
}

/// Drain all pending commands for a freshly connected device.
pub fn flush_pending(state: &ServerState, device_id: &str) {
    let pending = {
        let store = state.store.lock().unwrap();
        match store.pending_commands(device_id) {
            Ok(pending) => pending,
            Err(err) => {
                warn!("command queue for {}: {}", device_id, err);
                return;
            }
        }
    };
    if pending.is_empty() {
        return;
    }
    info!("flushing {} pending commands to {}", pending.len(), device_id);

    for command in pending {
        if try_push(state, device_id, command.command_type, &command.payload) {
            let store = state.store.lock().unwrap();
            if let Err(err) = store.set_command_status(command.id, CommandStatus::Sent) {
                warn!("command {} status update failed - {}", command.id, err);
            }
        } else {
            // channel went away mid-drain; the rest stays pending
            break;
        }
    }
}

/// Hand the frame to the device's command channel, if one is attached.
fn try_push(state: &ServerState, device_id: &str, command_type: u8, payload: &str) -> bool {
    let online = state.online.lock().unwrap();
    match online.get(device_id) {
        Some(sender) => sender
            .send(Frame {
                mtype: command_type,
                status: STATUS_REQUEST,
                payload: Bytes::from(payload.as_bytes().to_vec()),
            })
            .is_ok(),
        None => false,
    }
}
