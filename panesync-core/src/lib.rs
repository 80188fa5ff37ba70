use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod path;

pub use path::{FieldPath, Segment, apply_patch, extract_patch, get_path, set_path};

pub const STATE_SYNC_TOPIC: &str = "state-sync";
pub const STATE_SYNC_REQUEST_TOPIC: &str = "state-sync-request";
pub const WINDOW_READY_TOPIC: &str = "window-ready";
pub const CALL_READY_TOPIC: &str = "call-ready";

pub const DEFAULT_DEBOUNCE_MS: u64 = 50;
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 3_000;

pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const MAX_WINDOWS_PER_SESSION: usize = 32;
pub const MAX_LABEL_LEN: usize = 128;

/// Well-known window labels used by the desktop client.
pub mod labels {
    pub const MAIN: &str = "main";
    pub const LOGIN: &str = "login";
    pub const CALL: &str = "call";
    pub const CALL_ACCEPT: &str = "callaccept";
    pub const NOTIFY: &str = "notify";
    pub const PREVIEW_MEDIA: &str = "preview_media";
    pub const PREVIEW_FILE: &str = "preview_file";
    pub const SCREEN: &str = "screen";
    pub const RECORD: &str = "record";
}

pub type WindowLabel = String;
pub type StoreId = String;
pub type SessionId = String;

/// Field path -> value. Ordered so that encoded messages are stable.
pub type StatePatch = BTreeMap<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub store_id: StoreId,
    pub state: StatePatch,
    pub from: WindowLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<WindowLabel>>,
}

impl SyncMessage {
    /// An empty recipient list means "every window" and is encoded as an
    /// absent `to`.
    pub fn new(
        store_id: impl Into<StoreId>,
        state: StatePatch,
        from: impl Into<WindowLabel>,
        to: &[WindowLabel],
    ) -> Self {
        Self {
            store_id: store_id.into(),
            state,
            from: from.into(),
            to: (!to.is_empty()).then(|| to.to_vec()),
        }
    }

    pub fn is_addressed_to(&self, label: &str) -> bool {
        match &self.to {
            Some(recipients) if !recipients.is_empty() => {
                recipients.iter().any(|recipient| recipient == label)
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestMessage {
    pub store_id: StoreId,
    pub from: WindowLabel,
    pub to: WindowLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadyPayload {
    pub label: WindowLabel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    pub session_id: SessionId,
    pub label: WindowLabel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Welcome {
    pub session_id: SessionId,
    pub windows: Vec<WindowLabel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowList {
    pub session_id: SessionId,
    pub windows: Vec<WindowLabel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ControlMessage {
    Hello(Hello),
    Welcome(Welcome),
    WindowList(WindowList),
    Error { message: String },
}

/// An event routed between windows. `target: None` is a broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    pub topic: String,
    pub source: WindowLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<WindowLabel>,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Control(ControlMessage),
    Event(EventFrame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Control = 0,
    Event = 1,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid field path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("field path {path:?} runs through a value that is not an object or array")]
    PathConflict { path: String },
    #[error("window label must be non-empty and <= 128 chars")]
    InvalidLabel,
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub fn validate_label(label: &str) -> Result<(), CoreError> {
    let trimmed = label.trim();
    if trimmed.is_empty() || trimmed.len() != label.len() || label.len() > MAX_LABEL_LEN {
        return Err(CoreError::InvalidLabel);
    }
    Ok(())
}

pub fn encode_frame(message: &WireMessage) -> Result<Vec<u8>, CoreError> {
    let (message_type, payload) = match message {
        WireMessage::Control(control) => (MessageType::Control as u8, serde_json::to_vec(control)),
        WireMessage::Event(event) => (MessageType::Event as u8, serde_json::to_vec(event)),
    };
    let payload = payload.map_err(|err| CoreError::Serialization(err.to_string()))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(CoreError::FrameTooLarge {
            max: MAX_FRAME_BYTES,
        });
    }

    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(message_type);
    out.extend_from_slice(&payload);
    Ok(out.to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<WireMessage, CoreError> {
    if frame.len() < 5 {
        return Err(CoreError::InvalidFrameLength);
    }
    if frame.len() > MAX_FRAME_BYTES + 5 {
        return Err(CoreError::FrameTooLarge {
            max: MAX_FRAME_BYTES,
        });
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    let message_type = cursor.get_u8();
    let payload = cursor;

    match message_type {
        x if x == MessageType::Control as u8 => {
            let control: ControlMessage = serde_json::from_slice(payload)
                .map_err(|err| CoreError::Serialization(err.to_string()))?;
            Ok(WireMessage::Control(control))
        }
        x if x == MessageType::Event as u8 => {
            let event: EventFrame = serde_json::from_slice(payload)
                .map_err(|err| CoreError::Serialization(err.to_string()))?;
            Ok(WireMessage::Event(event))
        }
        other => Err(CoreError::UnsupportedMessageType(other)),
    }
}
