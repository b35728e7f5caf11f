//! Composite payload records shared by several messages.

use bytes::BytesMut;

use crate::error::TetherError;
use crate::msg::wire::{self, WireReader};

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

impl DirEntry {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), TetherError> {
        wire::put_string(buf, &self.name)?;
        wire::put_bool(buf, self.is_dir);
        Ok(())
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, TetherError> {
        Ok(Self {
            name: reader.get_string()?,
            is_dir: reader.get_bool()?,
        })
    }
}

/// A request for one chunk of a remote file, starting at `start_from`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileRequest {
    pub file_name: String,
    pub start_from: i64,
}

impl FileRequest {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), TetherError> {
        wire::put_string(buf, &self.file_name)?;
        wire::put_i64(buf, self.start_from);
        Ok(())
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, TetherError> {
        Ok(Self {
            file_name: reader.get_string()?,
            start_from: reader.get_i64()?,
        })
    }
}

/// One chunk of file content, carried by both downloads and uploads.
///
/// `valid == false` marks a failed read on the serving side, or an
/// upload abort.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileChunk {
    pub file_name: String,
    pub file_size: i64,
    pub position: i64,
    pub data: Vec<u8>,
    pub valid: bool,
}

impl FileChunk {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), TetherError> {
        wire::put_string(buf, &self.file_name)?;
        wire::put_i64(buf, self.file_size);
        wire::put_i64(buf, self.position);
        wire::put_blob(buf, &self.data)?;
        wire::put_bool(buf, self.valid);
        Ok(())
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, TetherError> {
        Ok(Self {
            file_name: reader.get_string()?,
            file_size: reader.get_i64()?,
            position: reader.get_i64()?,
            data: reader.get_blob()?,
            valid: reader.get_bool()?,
        })
    }
}
