//! Framed request/response protocol between endpoint, server and admin.
//!
//! Each message is `| type: u8 | status: u8 | length: u32 BE | payload |`
//! where the payload is UTF-8 JSON. Requests carry status 0; a response
//! with status 200 is a logical success, anything else is a failure whose
//! body is `{"error": "..."}`.

use anyhow::{bail, format_err, Error};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

pub mod wire;

/// A 16 MiB chunk hex-encodes to 32 MiB plus JSON overhead; cap frames
/// well above that.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const FRAME_HEADER_SIZE: usize = 6;

pub const STATUS_REQUEST: u8 = 0;
pub const STATUS_OK: u8 = 200;
pub const STATUS_BAD_REQUEST: u8 = 40;
pub const STATUS_ERROR: u8 = 50;

/// Message type codes.
pub mod msg {
    pub const DEVICE_REGISTER: u8 = 0xC1;
    pub const DEVICE_REGISTER_RESP: u8 = 0xC2;

    pub const EVENT_SYNC: u8 = 0xE6;
    pub const EVENT_SYNC_RESP: u8 = 0xE7;

    pub const FILE_TREE: u8 = 0xE8;
    pub const FILE_TREE_RESP: u8 = 0xE9;

    pub const BACKUP_INIT: u8 = 0xF1;
    pub const BACKUP_INIT_RESP: u8 = 0xF2;
    pub const BACKUP_CHUNK: u8 = 0xF3;
    pub const BACKUP_CHUNK_RESP: u8 = 0xF4;
    pub const BACKUP_FINISH: u8 = 0xF5;
    pub const BACKUP_FINISH_RESP: u8 = 0xF6;
    pub const BACKUP_CANCEL: u8 = 0xF7;
    pub const BACKUP_RESUME: u8 = 0xF8;
    pub const BACKUP_RESUME_RESP: u8 = 0xF9;

    pub const ADMIN_RESTORE: u8 = 0x70;
    pub const ADMIN_RESTORE_RESP: u8 = 0x71;
    pub const RESTORE_COMMAND: u8 = 0x72;
    pub const RESTORE_INIT: u8 = 0x73;
    pub const RESTORE_INIT_RESP: u8 = 0x74;
    pub const RESTORE_CHUNK: u8 = 0x75;
    pub const RESTORE_CHUNK_RESP: u8 = 0x76;
    pub const RESTORE_FINISH: u8 = 0x77;
    pub const RESTORE_FINISH_RESP: u8 = 0x78;
    pub const RESTORE_RESUME: u8 = 0x79;
    pub const RESTORE_RESUME_RESP: u8 = 0x7A;
}

/// The response type paired with a request type. Cancel has no response
/// and maps to itself for error reporting.
pub fn response_type(request: u8) -> u8 {
    match request {
        msg::BACKUP_CANCEL => msg::BACKUP_CANCEL,
        other => other.wrapping_add(1),
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub mtype: u8,
    pub status: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn request<T: Serialize>(mtype: u8, payload: &T) -> Result<Self, Error> {
        Ok(Self {
            mtype,
            status: STATUS_REQUEST,
            payload: Bytes::from(serde_json::to_vec(payload)?),
        })
    }

    pub fn response<T: Serialize>(mtype: u8, payload: &T) -> Result<Self, Error> {
        Ok(Self {
            mtype,
            status: STATUS_OK,
            payload: Bytes::from(serde_json::to_vec(payload)?),
        })
    }

    pub fn error(mtype: u8, status: u8, message: &str) -> Self {
        let body = serde_json::json!({ "error": message });
        Self {
            mtype,
            status,
            payload: Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
        }
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.payload)
            .map_err(|err| format_err!("invalid payload for type 0x{:02X} - {}", self.mtype, err))
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// The error message of a failure response.
    pub fn error_message(&self) -> String {
        match self.parse::<wire::ErrorBody>() {
            Ok(body) => body.error,
            Err(_) => format!("status {}", self.status),
        }
    }
}

/// Length-delimited codec for [`Frame`].
#[derive(Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if len > MAX_FRAME_SIZE {
            bail!("frame too large ({} bytes)", len);
        }
        if src.len() < FRAME_HEADER_SIZE + len {
            src.reserve(FRAME_HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        let mtype = src[0];
        let status = src[1];
        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Ok(Some(Frame { mtype, status, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        if frame.payload.len() > MAX_FRAME_SIZE {
            bail!("frame too large ({} bytes)", frame.payload.len());
        }
        dst.reserve(FRAME_HEADER_SIZE + frame.payload.len());
        dst.put_u8(frame.mtype);
        dst.put_u8(frame.status);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_handles_partial_frames() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();

        let frame = Frame::request(msg::BACKUP_INIT, &serde_json::json!({"x": 1})).unwrap();
        codec.encode(frame.clone(), &mut buf).unwrap();
        let encoded = buf.clone().freeze();

        // feed one byte at a time; the frame appears only once complete
        let mut partial = BytesMut::new();
        let mut decoded = None;
        for b in encoded.iter() {
            partial.put_u8(*b);
            if let Some(f) = codec.decode(&mut partial).unwrap() {
                decoded = Some(f);
            }
        }
        let decoded = decoded.expect("frame not decoded");
        assert_eq!(decoded.mtype, msg::BACKUP_INIT);
        assert_eq!(decoded.status, STATUS_REQUEST);
        assert_eq!(&decoded.payload[..], &frame.payload[..]);
        assert!(partial.is_empty());
    }

    #[test]
    fn decode_rejects_oversized_frames() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(msg::BACKUP_CHUNK);
        buf.put_u8(STATUS_REQUEST);
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn error_frames_carry_a_message() {
        let frame = Frame::error(msg::BACKUP_INIT_RESP, STATUS_ERROR, "no such session");
        assert!(!frame.is_ok());
        assert_eq!(frame.error_message(), "no such session");
    }
}
