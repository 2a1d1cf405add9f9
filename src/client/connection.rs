//! Framed TCP client: one request/response connection shared by the
//! workers, plus the server-push command channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;

use crate::error::GuardError;
use crate::protocol::wire::{DeviceRegister, DeviceRegisterResp, RestoreCommand, CHANNEL_COMMAND};
use crate::protocol::{msg, Frame, FrameCodec};

const COMMAND_CHANNEL_RETRY: Duration = Duration::from_secs(10);

fn transient(err: impl std::fmt::Display) -> Error {
    GuardError::TransientNetwork(err.to_string()).into()
}

type FramedStream = Framed<TcpStream, FrameCodec>;

/// Request/response client. Requests are serialized over one connection;
/// a broken connection is dropped and re-established on the next call.
pub struct Client {
    addr: String,
    conn: tokio::sync::Mutex<Option<FramedStream>>,
}

impl Client {
    pub fn new(addr: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.into(),
            conn: tokio::sync::Mutex::new(None),
        })
    }

    /// One request/response round-trip. Any I/O failure drops the
    /// connection and surfaces as `TransientNetwork`.
    pub async fn request<T: Serialize>(&self, mtype: u8, payload: &T) -> Result<Frame, Error> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.addr).await.map_err(transient)?;
            debug!("connected to {}", self.addr);
            *guard = Some(Framed::new(stream, FrameCodec));
        }
        let framed = guard.as_mut().unwrap();

        let frame = Frame::request(mtype, payload)?;
        if let Err(err) = framed.send(frame).await {
            *guard = None;
            return Err(transient(err));
        }
        match framed.next().await {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(err)) => {
                *guard = None;
                Err(transient(err))
            }
            None => {
                *guard = None;
                Err(transient("connection closed by peer"))
            }
        }
    }

    /// Round-trip expecting a status-200 response; the parsed body is
    /// returned, anything else becomes an error with the server message.
    pub async fn call<T: Serialize, R: DeserializeOwned>(
        &self,
        mtype: u8,
        payload: &T,
    ) -> Result<R, Error> {
        let resp = self.request(mtype, payload).await?;
        if !resp.is_ok() {
            bail!(
                "request 0x{:02X} failed - {}",
                mtype,
                resp.error_message()
            );
        }
        resp.parse()
    }

    /// Fire-and-forget message (backup cancel has no response).
    pub async fn send_only<T: Serialize>(&self, mtype: u8, payload: &T) -> Result<(), Error> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.addr).await.map_err(transient)?;
            *guard = Some(Framed::new(stream, FrameCodec));
        }
        let framed = guard.as_mut().unwrap();
        if let Err(err) = framed.send(Frame::request(mtype, payload)?).await {
            *guard = None;
            return Err(transient(err));
        }
        Ok(())
    }

    pub async fn register(&self, info: &DeviceRegister) -> Result<(), Error> {
        let resp: DeviceRegisterResp = self.call(msg::DEVICE_REGISTER, info).await?;
        if resp.device_id != info.device_id {
            bail!("server echoed unexpected device id {}", resp.device_id);
        }
        Ok(())
    }
}

/// Basic system facts sent along with device registration.
pub fn device_register_info(device_id: &str, channel: &str) -> DeviceRegister {
    let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string());
    let os_version = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    DeviceRegister {
        device_id: device_id.to_string(),
        hostname,
        os_name: std::env::consts::OS.to_string(),
        os_version,
        arch: std::env::consts::ARCH.to_string(),
        channel: Some(channel.to_string()),
    }
}

/// Maintain the notification channel: register with `channel: command`,
/// then forward pushed restore commands to the dispatcher. Reconnects
/// with a fixed delay; other command types are acknowledged in the log
/// only (their executors live outside this crate).
pub async fn run_command_channel(
    addr: String,
    device_id: String,
    commands: mpsc::Sender<RestoreCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match command_channel_session(&addr, &device_id, &commands, &mut shutdown).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => warn!("command channel: {}", err),
        }
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(COMMAND_CHANNEL_RETRY) => {}
        }
    }
}

/// Returns `Ok(true)` on shutdown, `Ok(false)` when the connection was
/// lost and should be re-established.
async fn command_channel_session(
    addr: &str,
    device_id: &str,
    commands: &mpsc::Sender<RestoreCommand>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool, Error> {
    let stream = TcpStream::connect(addr).await.map_err(transient)?;
    let mut framed = Framed::new(stream, FrameCodec);

    let hello = device_register_info(device_id, CHANNEL_COMMAND);
    framed
        .send(Frame::request(msg::DEVICE_REGISTER, &hello)?)
        .await
        .map_err(transient)?;
    match framed.next().await {
        Some(Ok(resp)) if resp.is_ok() => {}
        Some(Ok(resp)) => bail!("channel registration refused - {}", resp.error_message()),
        Some(Err(err)) => return Err(transient(err)),
        None => return Err(transient("connection closed by peer")),
    }
    info!("command channel attached");

    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(true),
            frame = framed.next() => match frame {
                Some(Ok(frame)) if frame.mtype == msg::RESTORE_COMMAND => {
                    let cmd: RestoreCommand = frame.parse()?;
                    info!("restore command for {} (version {})", cmd.identity, cmd.version);
                    commands
                        .send(cmd)
                        .await
                        .map_err(|_| format_err!("restore dispatcher gone"))?;
                }
                Some(Ok(frame)) => {
                    // log pulls, firewall refreshes and the like are
                    // executed by collaborators outside this crate
                    info!("ignoring pushed command 0x{:02X}", frame.mtype);
                }
                Some(Err(err)) => return Err(transient(err)),
                None => return Ok(false),
            },
        }
    }
}
