//! The service protocol: message variants, stable type tags, and the
//! factory that builds messages from received frames.
//!
//! Dispatch is a `match` over [`SvcMessage`] — the variant tag travels
//! with the value from the factory step on, so no runtime type
//! inspection is ever needed.

pub mod types;

use bytes::BytesMut;

use crate::error::TetherError;
use crate::msg::wire::{self, WireReader};
use crate::msg::{MessageFactory, WireMessage};
use types::{DirEntry, FileChunk, FileRequest};

// ── Type tags ────────────────────────────────────────────────────

/// Stable wire tags, one per message variant.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Identity = 1,
    RequestDir = 2,
    ResponseDir = 3,
    RequestFile = 4,
    ResponseFile = 5,
    RequestSysInfo = 6,
    ResponseSysInfo = 7,
    UploadFile = 8,
    UploadFileReply = 9,
    Generic = 10,
}

impl TryFrom<u32> for MessageTag {
    type Error = TetherError;

    fn try_from(value: u32) -> Result<Self, TetherError> {
        match value {
            1 => Ok(MessageTag::Identity),
            2 => Ok(MessageTag::RequestDir),
            3 => Ok(MessageTag::ResponseDir),
            4 => Ok(MessageTag::RequestFile),
            5 => Ok(MessageTag::ResponseFile),
            6 => Ok(MessageTag::RequestSysInfo),
            7 => Ok(MessageTag::ResponseSysInfo),
            8 => Ok(MessageTag::UploadFile),
            9 => Ok(MessageTag::UploadFileReply),
            10 => Ok(MessageTag::Generic),
            other => Err(TetherError::UnknownMessageType(other)),
        }
    }
}

// ── Generic command tags ─────────────────────────────────────────

/// Commands carried by [`SvcMessage::Generic`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenericCommand {
    ReqSysInfo = 0,
    ReqFileExec = 1,
}

impl TryFrom<u32> for GenericCommand {
    type Error = TetherError;

    fn try_from(value: u32) -> Result<Self, TetherError> {
        match value {
            0 => Ok(GenericCommand::ReqSysInfo),
            1 => Ok(GenericCommand::ReqFileExec),
            other => Err(TetherError::UnknownMessageType(other)),
        }
    }
}

// ── SvcMessage ───────────────────────────────────────────────────

/// Every message the service protocol speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SvcMessage {
    /// A peer announces its endpoint identity, once, after connecting.
    Identity { endpoint_id: String },

    /// Ask for the contents of a directory.
    RequestDir { dir: String },

    /// Directory contents.
    ResponseDir { entries: Vec<DirEntry> },

    /// Ask for one chunk of a file.
    RequestFile(FileRequest),

    /// One chunk of a downloaded file.
    ResponseFile(FileChunk),

    /// Ask for system information.
    RequestSysInfo { query: String },

    /// System information, one string per line.
    ResponseSysInfo { info: Vec<String> },

    /// One chunk of an uploaded file.
    UploadFile(FileChunk),

    /// Outcome of writing one uploaded chunk.
    UploadFileReply { ok: bool },

    /// An open-ended command with string parameters. The command value
    /// is kept raw on the wire; see [`GenericCommand`] for the values
    /// this implementation understands.
    Generic { command: u32, params: Vec<String> },
}

impl SvcMessage {
    pub fn tag(&self) -> MessageTag {
        match self {
            SvcMessage::Identity { .. } => MessageTag::Identity,
            SvcMessage::RequestDir { .. } => MessageTag::RequestDir,
            SvcMessage::ResponseDir { .. } => MessageTag::ResponseDir,
            SvcMessage::RequestFile(_) => MessageTag::RequestFile,
            SvcMessage::ResponseFile(_) => MessageTag::ResponseFile,
            SvcMessage::RequestSysInfo { .. } => MessageTag::RequestSysInfo,
            SvcMessage::ResponseSysInfo { .. } => MessageTag::ResponseSysInfo,
            SvcMessage::UploadFile(_) => MessageTag::UploadFile,
            SvcMessage::UploadFileReply { .. } => MessageTag::UploadFileReply,
            SvcMessage::Generic { .. } => MessageTag::Generic,
        }
    }

    /// Decodes the payload of a frame carrying `tag`.
    pub fn decode(tag: MessageTag, payload: &[u8]) -> Result<Self, TetherError> {
        let mut reader = WireReader::new(payload);
        let message = match tag {
            MessageTag::Identity => SvcMessage::Identity {
                endpoint_id: reader.get_string()?,
            },
            MessageTag::RequestDir => SvcMessage::RequestDir {
                dir: reader.get_string()?,
            },
            MessageTag::ResponseDir => {
                let count = reader.get_count()?;
                let mut entries = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    entries.push(DirEntry::decode(&mut reader)?);
                }
                SvcMessage::ResponseDir { entries }
            }
            MessageTag::RequestFile => SvcMessage::RequestFile(FileRequest::decode(&mut reader)?),
            MessageTag::ResponseFile => SvcMessage::ResponseFile(FileChunk::decode(&mut reader)?),
            MessageTag::RequestSysInfo => SvcMessage::RequestSysInfo {
                query: reader.get_string()?,
            },
            MessageTag::ResponseSysInfo => {
                let count = reader.get_count()?;
                let mut info = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    info.push(reader.get_string()?);
                }
                SvcMessage::ResponseSysInfo { info }
            }
            MessageTag::UploadFile => SvcMessage::UploadFile(FileChunk::decode(&mut reader)?),
            MessageTag::UploadFileReply => SvcMessage::UploadFileReply {
                ok: reader.get_bool()?,
            },
            MessageTag::Generic => {
                let command = reader.get_u32()?;
                let count = reader.get_count()?;
                let mut params = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    params.push(reader.get_string()?);
                }
                SvcMessage::Generic { command, params }
            }
        };
        Ok(message)
    }
}

impl WireMessage for SvcMessage {
    fn type_tag(&self) -> u32 {
        self.tag() as u32
    }

    fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), TetherError> {
        match self {
            SvcMessage::Identity { endpoint_id } => wire::put_string(buf, endpoint_id)?,
            SvcMessage::RequestDir { dir } => wire::put_string(buf, dir)?,
            SvcMessage::ResponseDir { entries } => {
                wire::put_count(buf, entries.len())?;
                for entry in entries {
                    entry.encode(buf)?;
                }
            }
            SvcMessage::RequestFile(request) => request.encode(buf)?,
            SvcMessage::ResponseFile(chunk) => chunk.encode(buf)?,
            SvcMessage::RequestSysInfo { query } => wire::put_string(buf, query)?,
            SvcMessage::ResponseSysInfo { info } => {
                wire::put_count(buf, info.len())?;
                for line in info {
                    wire::put_string(buf, line)?;
                }
            }
            SvcMessage::UploadFile(chunk) => chunk.encode(buf)?,
            SvcMessage::UploadFileReply { ok } => wire::put_bool(buf, *ok),
            SvcMessage::Generic { command, params } => {
                wire::put_u32(buf, *command);
                wire::put_count(buf, params.len())?;
                for param in params {
                    wire::put_string(buf, param)?;
                }
            }
        }
        Ok(())
    }
}

// ── Factory ──────────────────────────────────────────────────────

/// The service message factory: numeric tag + payload → [`SvcMessage`].
#[derive(Debug, Default)]
pub struct SvcMessageFactory;

impl MessageFactory for SvcMessageFactory {
    type Message = SvcMessage;

    fn create_message(&self, type_tag: u32, payload: &[u8]) -> Result<SvcMessage, TetherError> {
        let tag = MessageTag::try_from(type_tag)?;
        SvcMessage::decode(tag, payload)
    }
}

// ── Tests ────────────────────────────────────────────────────────
