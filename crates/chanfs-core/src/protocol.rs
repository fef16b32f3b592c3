//! Wire protocol definitions
//!
//! Every control message is a JSON document wrapped in a frame: a 4-byte
//! little-endian length followed by exactly that many bytes of UTF-8 JSON.
//! Raw file bytes (the data plane) are never framed; their length is the
//! `size` announced in the preceding `Data` message.
//!
//! ```text
//! {"state":"Start","payload":{"action":"Upload","fileInfo":{"relPath":"a.txt","size":3}}}
//! {"state":"Data","payload":{"fileInfo":{"relPath":"a.txt","size":3}}}
//! {"state":"Eof"}
//! {"state":"Ok"}
//! {"state":"Error","payload":{"code":"not_found","message":"..."}}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ProtocolError};
use crate::{FRAME_HEADER_LEN, MAX_CONTROL_FRAME};

/// Protocol phase markers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Start,
    Data,
    Eof,
    Ok,
    Error,
}

impl State {
    /// `Ok` and `Error` end a connection
    pub const fn is_terminal(self) -> bool {
        matches!(self, State::Ok | State::Error)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Start => "Start",
            State::Data => "Data",
            State::Eof => "Eof",
            State::Ok => "Ok",
            State::Error => "Error",
        };
        f.write_str(name)
    }
}

/// The client's declared intent, fixed for the lifetime of a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Upload,
    Download,
    /// Any action name this server does not implement
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Upload => f.write_str("upload"),
            Action::Download => f.write_str("download"),
            Action::Unknown => f.write_str("unknown"),
        }
    }
}

/// Descriptor of the file being transferred.
///
/// `size` is the sender's declaration during upload negotiation and the
/// on-disk size during download.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub rel_path: String,
    pub size: u64,
}

impl FileInfo {
    pub fn new(rel_path: impl Into<String>, size: u64) -> Self {
        Self {
            rel_path: rel_path.into(),
            size,
        }
    }
}

/// Payload of the `Start` message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    pub action: Action,
    pub file_info: FileInfo,
    /// Target channel (server default when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

/// Payload of the `Data` message: the authoritative span descriptor
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPayload {
    pub file_info: FileInfo,
}

/// Payload of the `Error` message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Control envelope, tagged by state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "payload")]
pub enum Message {
    Start(StartPayload),
    Data(DataPayload),
    Eof,
    Ok,
    Error(ErrorPayload),
}

impl Message {
    /// Create a `Start` message for the default channel
    pub fn start(action: Action, file_info: FileInfo) -> Self {
        Self::Start(StartPayload {
            action,
            file_info,
            channel: None,
        })
    }

    /// Create a `Data` message
    pub fn data(file_info: FileInfo) -> Self {
        Self::Data(DataPayload { file_info })
    }

    /// Create an `Error` message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }

    pub fn state(&self) -> State {
        match self {
            Message::Start(_) => State::Start,
            Message::Data(_) => State::Data,
            Message::Eof => State::Eof,
            Message::Ok => State::Ok,
            Message::Error(_) => State::Error,
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(json)?)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

// === Framing ===

/// Serialize a message with length prefix
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = msg.to_json()?;
    if payload.len() > MAX_CONTROL_FRAME {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_CONTROL_FRAME,
        });
    }

    let len = payload.len() as u32;
    let mut result = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    result.extend_from_slice(&len.to_le_bytes());
    result.extend_from_slice(&payload);

    Ok(result)
}

/// Decode and bound-check a frame header
pub fn decode_frame_len(header: [u8; FRAME_HEADER_LEN]) -> Result<usize, ProtocolError> {
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_CONTROL_FRAME {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_CONTROL_FRAME,
        });
    }
    Ok(len)
}

/// Deserialize a message (without length prefix)
pub fn decode_frame(payload: &[u8]) -> Result<Message, ProtocolError> {
    Message::from_json(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_wire_shape() {
        let msg = Message::start(Action::Upload, FileInfo::new("dir/file.txt", 42));
        let json: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["state"], "Start");
        assert_eq!(json["payload"]["action"], "Upload");
        assert_eq!(json["payload"]["fileInfo"]["relPath"], "dir/file.txt");
        assert_eq!(json["payload"]["fileInfo"]["size"], 42);
        assert!(json["payload"].get("channel").is_none());
    }

    #[test]
    fn test_unit_states_have_no_payload() {
        assert_eq!(Message::Eof.to_json().unwrap(), br#"{"state":"Eof"}"#);
        assert_eq!(Message::Ok.to_json().unwrap(), br#"{"state":"Ok"}"#);
    }

    #[test]
    fn test_decode_from_foreign_client() {
        let json = br#"{"state":"Start","payload":{"action":"Download","fileInfo":{"relPath":"a.pdf","size":0},"channel":"docs"}}"#;
        match Message::from_json(json).unwrap() {
            Message::Start(p) => {
                assert_eq!(p.action, Action::Download);
                assert_eq!(p.file_info, FileInfo::new("a.pdf", 0));
                assert_eq!(p.channel.as_deref(), Some("docs"));
            }
            other => panic!("wrong message: {:?}", other),
        }

        let eof = Message::from_json(br#"{"state":"Eof","payload":null}"#).unwrap();
        assert_eq!(eof.state(), State::Eof);
    }

    #[test]
    fn test_unknown_state_is_protocol_error() {
        let err = Message::from_json(br#"{"state":"Resume"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));

        assert!(Message::from_json(br#"{"state":"Start","payload":{"action":"Upload","fileInfo":{"relPath":"a","size":-1}}}"#).is_err());
        assert!(Message::from_json(b"not json").is_err());
    }

    #[test]
    fn test_unknown_action_still_decodes() {
        let msg = Message::from_json(br#"{"state":"Start","payload":{"action":"Delete","fileInfo":{"relPath":"a","size":1}}}"#)
            .unwrap();
        match msg {
            Message::Start(p) => {
                assert_eq!(p.action, Action::Unknown);
                assert_eq!(p.file_info.rel_path, "a");
            }
            other => panic!("expected Start, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let msg = Message::error(ErrorCode::NotFound, "file not found: a.txt");
        let frame = encode_frame(&msg).unwrap();

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&frame[..FRAME_HEADER_LEN]);
        let len = decode_frame_len(header).unwrap();
        assert_eq!(len, frame.len() - FRAME_HEADER_LEN);

        let decoded = decode_frame(&frame[FRAME_HEADER_LEN..]).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.state().is_terminal());
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let header = ((MAX_CONTROL_FRAME + 1) as u32).to_le_bytes();
        assert!(matches!(
            decode_frame_len(header),
            Err(ProtocolError::FrameTooLarge { .. })
        ));

        let msg = Message::start(
            Action::Upload,
            FileInfo::new("a".repeat(MAX_CONTROL_FRAME), 1),
        );
        assert!(matches!(
            encode_frame(&msg),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_state_terminal() {
        assert!(State::Ok.is_terminal());
        assert!(State::Error.is_terminal());
        assert!(!State::Start.is_terminal());
        assert!(!State::Data.is_terminal());
        assert!(!State::Eof.is_terminal());
    }
}
