//! TCP accept loop, frame router and the online-device registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;

use crate::config::ServerConfig;
use crate::protocol::wire::{DeviceRegister, DeviceRegisterResp, CHANNEL_COMMAND};
use crate::protocol::{msg, response_type, Frame, FrameCodec, STATUS_ERROR};
use crate::server::blob_store::BlobStore;
use crate::server::store::ServerStore;
use crate::server::{backup_api, command_bus, event_api, restore_api};

/// Shared service state: the store, the blob tree and the registry of
/// attached command channels.
pub struct ServerState {
    pub store: Mutex<ServerStore>,
    pub blobs: BlobStore,
    pub online: Mutex<HashMap<String, mpsc::UnboundedSender<Frame>>>,
}

impl ServerState {
    pub fn new(config: &ServerConfig) -> Result<Self, Error> {
        std::fs::create_dir_all(&config.storage_root)
            .map_err(|err| format_err!("unable to create {:?} - {}", config.storage_root, err))?;
        Ok(Self {
            store: Mutex::new(ServerStore::open(&config.store_path())?),
            blobs: BlobStore::new(&config.storage_root),
            online: Mutex::new(HashMap::new()),
        })
    }
}

pub async fn run(config: ServerConfig, shutdown: watch::Receiver<bool>) -> Result<(), Error> {
    let state = Arc::new(ServerState::new(&config)?);
    let listener = TcpListener::bind(&config.bind)
        .await
        .map_err(|err| format_err!("unable to bind {} - {}", config.bind, err))?;
    info!("listening on {}", config.bind);
    run_with_listener(state, listener, shutdown).await
}

/// Serve on an already-bound listener (lets callers pick port 0).
pub async fn run_with_listener(
    state: Arc<ServerState>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        handle_connection(state, stream, peer).await;
                    });
                }
                Err(err) => warn!("accept failed - {}", err),
            },
        }
    }
    info!("service loop stopped");
    Ok(())
}

async fn handle_connection(state: Arc<ServerState>, stream: TcpStream, peer: SocketAddr) {
    debug!("connection from {}", peer);
    let mut framed = Framed::new(stream, FrameCodec);
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Frame>();
    // set once the peer attaches as a command channel
    let mut attached_device: Option<String> = None;

    loop {
        tokio::select! {
            Some(push) = push_rx.recv(), if attached_device.is_some() => {
                if let Err(err) = framed.send(push).await {
                    warn!("push to {} failed - {}", peer, err);
                    break;
                }
            }
            incoming = framed.next() => {
                let frame = match incoming {
                    Some(Ok(frame)) => frame,
                    Some(Err(err)) => {
                        warn!("bad frame from {} - {}", peer, err);
                        break;
                    }
                    None => break,
                };
                let reply = tokio::task::block_in_place(|| {
                    dispatch(&state, &frame, &mut attached_device, &push_tx)
                });
                match reply {
                    Some(reply) => {
                        if framed.send(reply).await.is_err() {
                            break;
                        }
                    }
                    None => {}
                }
            }
        }
    }

    if let Some(device_id) = attached_device {
        state.online.lock().unwrap().remove(&device_id);
        info!("command channel for {} detached", device_id);
    }
    debug!("connection from {} closed", peer);
}

fn dispatch(
    state: &ServerState,
    frame: &Frame,
    attached_device: &mut Option<String>,
    push_tx: &mpsc::UnboundedSender<Frame>,
) -> Option<Frame> {
    let resp_type = response_type(frame.mtype);

    let result: Result<Option<Frame>, Error> = match frame.mtype {
        msg::DEVICE_REGISTER => {
            handle_register(state, frame, attached_device, push_tx).map(Some)
        }
        msg::EVENT_SYNC => event_api::handle_sync(state, frame).map(Some),
        msg::FILE_TREE => event_api::handle_tree(state, frame).map(Some),

        msg::BACKUP_RESUME => backup_api::handle_resume(state, frame).map(Some),
        msg::BACKUP_INIT => backup_api::handle_init(state, frame).map(Some),
        msg::BACKUP_CHUNK => backup_api::handle_chunk(state, frame).map(Some),
        msg::BACKUP_FINISH => backup_api::handle_finish(state, frame).map(Some),
        // cancel is fire-and-forget: never answer it, even on failure,
        // or the reply would desync the client's next round-trip
        msg::BACKUP_CANCEL => {
            if let Err(err) = backup_api::handle_cancel(state, frame) {
                debug!("backup cancel failed - {}", err);
            }
            Ok(None)
        }

        msg::ADMIN_RESTORE => restore_api::handle_admin_trigger(state, frame).map(Some),
        msg::RESTORE_INIT => restore_api::handle_init(state, frame).map(Some),
        msg::RESTORE_CHUNK => restore_api::handle_chunk(state, frame).map(Some),
        msg::RESTORE_FINISH => restore_api::handle_finish(state, frame).map(Some),
        msg::RESTORE_RESUME => restore_api::handle_resume(state, frame).map(Some),

        other => Err(format_err!("unknown message type 0x{:02X}", other)),
    };

    match result {
        Ok(reply) => reply,
        Err(err) => {
            debug!("request 0x{:02X} failed - {}", frame.mtype, err);
            Some(Frame::error(resp_type, STATUS_ERROR, &err.to_string()))
        }
    }
}

/// Register (or refresh) a device row. A registration carrying
/// `channel: command` additionally attaches this connection to the
/// online registry and flushes the pending command queue.
fn handle_register(
    state: &ServerState,
    frame: &Frame,
    attached_device: &mut Option<String>,
    push_tx: &mpsc::UnboundedSender<Frame>,
) -> Result<Frame, Error> {
    let reg: DeviceRegister = frame.parse()?;

    {
        let store = state.store.lock().unwrap();
        store.upsert_device(&reg)?;
    }

    if reg.channel.as_deref() == Some(CHANNEL_COMMAND) {
        state
            .online
            .lock()
            .unwrap()
            .insert(reg.device_id.clone(), push_tx.clone());
        *attached_device = Some(reg.device_id.clone());
        info!("device {} attached its command channel", reg.device_id);
        command_bus::flush_pending(state, &reg.device_id);
    } else {
        info!("device {} registered", reg.device_id);
    }

    Frame::response(
        msg::DEVICE_REGISTER_RESP,
        &DeviceRegisterResp { device_id: reg.device_id },
    )
}
