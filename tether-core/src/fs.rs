//! File collaborators for chunked transfers.
//!
//! Both types deliberately hold the file open across calls: a transfer
//! is a sequence of chunk operations against the same path, and
//! re-opening per chunk would lose the position cheaply tracked here.

use std::io::SeekFrom;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::TetherError;

fn file_err(context: &str, e: std::io::Error) -> TetherError {
    TetherError::FileError(format!("{context}: {e}"))
}

// ── FileReader ───────────────────────────────────────────────────

/// Chunked reader. `open` is a no-op when the same path is already
/// open; the reader closes itself once a read reaches end of file.
#[derive(Debug, Default)]
pub struct FileReader {
    file: Option<File>,
    name: String,
    size: i64,
}

impl FileReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `name` for reading and records its size. Keeps the
    /// current handle when `name` is the file already open.
    pub async fn open(&mut self, name: &str) -> Result<(), TetherError> {
        if name.is_empty() {
            return Err(TetherError::FileError("empty file name".to_string()));
        }
        if self.file.is_some() && self.name == name {
            return Ok(());
        }

        self.close();

        let file = File::open(name).await.map_err(|e| file_err(name, e))?;
        let meta = file.metadata().await.map_err(|e| file_err(name, e))?;

        self.size = meta.len() as i64;
        self.name = name.to_string();
        self.file = Some(file);
        Ok(())
    }

    /// Size of the currently (or most recently) open file.
    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Reads exactly `len` bytes starting at `start_from`. Fails when
    /// the range does not fit in the file. Closes the reader when the
    /// read ends at end of file.
    pub async fn read(&mut self, start_from: i64, len: usize) -> Result<Vec<u8>, TetherError> {
        let end = start_from + len as i64;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TetherError::FileError("no file open".to_string()))?;
        if start_from < 0 || end > self.size {
            return Err(TetherError::FileError(format!(
                "range {start_from}..{end} outside file of {} bytes",
                self.size
            )));
        }

        file.seek(SeekFrom::Start(start_from as u64))
            .await
            .map_err(|e| file_err(&self.name, e))?;

        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| file_err(&self.name, e))?;

        if end == self.size {
            self.close();
        }
        Ok(buf)
    }

    pub fn close(&mut self) {
        self.file = None;
        self.name.clear();
    }
}

// ── FileWriter ───────────────────────────────────────────────────

/// Sequential chunk writer. `open` truncates; writes append in call
/// order; `size` is the number of bytes written since open.
#[derive(Debug, Default)]
pub struct FileWriter {
    file: Option<File>,
    name: String,
    written: i64,
}

impl FileWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or truncates) `name` for writing. Keeps the current
    /// handle when `name` is the file already open.
    pub async fn open(&mut self, name: &str) -> Result<(), TetherError> {
        if name.is_empty() {
            return Err(TetherError::FileError("empty file name".to_string()));
        }
        if self.file.is_some() && self.name == name {
            return Ok(());
        }

        self.close();

        let file = File::create(name).await.map_err(|e| file_err(name, e))?;
        self.name = name.to_string();
        self.written = 0;
        self.file = Some(file);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Bytes written since the file was opened.
    pub fn size(&self) -> i64 {
        self.written
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), TetherError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| TetherError::FileError("no file open".to_string()))?;

        file.write_all(data)
            .await
            .map_err(|e| file_err(&self.name, e))?;
        // tokio files buffer internally; a reply referencing this
        // chunk must not outrun the bytes.
        file.flush().await.map_err(|e| file_err(&self.name, e))?;
        self.written += data.len() as i64;
        Ok(())
    }

    pub fn close(&mut self) {
        self.file = None;
        self.name.clear();
    }
}
