//! Sender-side file source, read one chunk at a time.

use super::chunk::expected_chunk_len;
use crate::core::config::DEFAULT_MIME_TYPE;
use crate::core::error::Result;
use bytes::Bytes;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;

/// A file selected for sending.
///
/// Content is pulled sequentially, so a file on disk is never held in
/// memory as a whole.
pub struct OutgoingFile {
    name: String,
    mime_type: String,
    size: u64,
    source: Box<dyn Read + Send>,
}

impl OutgoingFile {
    /// An in-memory file. The MIME type is guessed from `name`.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let data = data.into();
        Self {
            mime_type: guess_mime_type(&name),
            size: data.len() as u64,
            source: Box::new(Cursor::new(data)),
            name,
        }
    }

    /// Open a file on disk.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        Ok(Self {
            mime_type: guess_mime_type(&name),
            size,
            source: Box::new(BufReader::new(file)),
            name,
        })
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the payload of chunk `index`. Chunks must be read in order.
    pub(crate) fn read_chunk(&mut self, index: u32) -> Result<Bytes> {
        let mut buf = vec![0u8; expected_chunk_len(self.size, index)];
        self.source.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

impl fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

fn guess_mime_type(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or(DEFAULT_MIME_TYPE)
        .to_string()
}
