//! Random access to upload bytes for chunking and re-slicing after reconciliation.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::UploadBody;
use crate::error::FetchError;

const READ_BUF: usize = 64 * 1024;

/// A non-seekable reader plus the bytes read from it that the server has not confirmed yet.
pub(crate) struct StreamWindow {
    reader: Option<Box<dyn Read + Send>>,
    /// Offset of `buf[0]`.
    start: u64,
    buf: Vec<u8>,
    eof: bool,
}

pub(crate) enum ChunkSource {
    Memory(Arc<[u8]>),
    File { path: PathBuf, len: u64 },
    Stream(StreamWindow),
}

fn body_error(what: &str, e: impl std::fmt::Display) -> FetchError {
    FetchError::Body(format!("{what}: {e}"))
}

impl ChunkSource {
    pub(crate) async fn open(body: UploadBody) -> Result<Self, FetchError> {
        match body {
            UploadBody::Bytes(b) => Ok(ChunkSource::Memory(b)),
            UploadBody::File(path) => {
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| body_error(&format!("stat {}", path.display()), e))?;
                Ok(ChunkSource::File {
                    path,
                    len: meta.len(),
                })
            }
            UploadBody::Stream(reader) => Ok(ChunkSource::Stream(StreamWindow {
                reader: Some(reader),
                start: 0,
                buf: Vec::new(),
                eof: false,
            })),
        }
    }

    /// Total length when it is known before the upload starts.
    pub(crate) fn declared_total(&self) -> Option<u64> {
        match self {
            ChunkSource::Memory(b) => Some(b.len() as u64),
            ChunkSource::File { len, .. } => Some(*len),
            ChunkSource::Stream(_) => None,
        }
    }

    /// Lowest offset that can still be sent.
    pub(crate) fn lowest_offset(&self) -> u64 {
        match self {
            ChunkSource::Stream(w) => w.start,
            _ => 0,
        }
    }

    /// Bytes `[offset, offset + max)`, shorter at the end of the source, empty past it.
    pub(crate) async fn chunk(&mut self, offset: u64, max: u64) -> Result<Vec<u8>, FetchError> {
        match self {
            ChunkSource::Memory(b) => {
                let len = b.len() as u64;
                let start = offset.min(len) as usize;
                let end = offset.saturating_add(max).min(len) as usize;
                Ok(b[start..end].to_vec())
            }
            ChunkSource::File { path, len } => {
                let want = max.min(len.saturating_sub(offset));
                if want == 0 {
                    return Ok(Vec::new());
                }
                let path = path.clone();
                tokio::task::spawn_blocking(move || read_file_range(&path, offset, want))
                    .await
                    .map_err(|e| body_error("file read task", e))?
            }
            ChunkSource::Stream(w) => w.chunk(offset, max).await,
        }
    }

    /// Forget bytes the server has confirmed. Only streams hold on to anything.
    pub(crate) fn release_before(&mut self, offset: u64) {
        if let ChunkSource::Stream(w) = self {
            w.release_before(offset);
        }
    }
}

fn read_file_range(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>, FetchError> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| body_error(&format!("open {}", path.display()), e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| body_error("seek upload file", e))?;
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len)
        .read_to_end(&mut buf)
        .map_err(|e| body_error("read upload file", e))?;
    Ok(buf)
}

impl StreamWindow {
    fn end(&self) -> u64 {
        self.start + self.buf.len() as u64
    }

    async fn chunk(&mut self, offset: u64, max: u64) -> Result<Vec<u8>, FetchError> {
        if offset < self.start {
            return Err(FetchError::UploadReconciliation(Box::new(
                FetchError::UploadOffsetMismatch {
                    server: offset,
                    sent: self.end(),
                },
            )));
        }
        let want_end = offset.saturating_add(max);
        if !self.eof && self.end() < want_end {
            self.fill(want_end - self.end()).await?;
        }
        // Skipped prefix when resuming a stream at a server-held offset.
        if offset > self.start {
            self.release_before(offset.min(self.end()));
        }
        let from = (offset.saturating_sub(self.start) as usize).min(self.buf.len());
        let to = (want_end.saturating_sub(self.start) as usize).min(self.buf.len());
        Ok(self.buf[from..to].to_vec())
    }

    async fn fill(&mut self, need: u64) -> Result<(), FetchError> {
        let Some(mut reader) = self.reader.take() else {
            self.eof = true;
            return Ok(());
        };
        let (reader, read) = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            let mut tmp = vec![0u8; READ_BUF];
            let mut eof = false;
            while (out.len() as u64) < need {
                let room = (need - out.len() as u64).min(READ_BUF as u64) as usize;
                match reader.read(&mut tmp[..room]) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => out.extend_from_slice(&tmp[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return (reader, Err(e)),
                }
            }
            (reader, Ok((out, eof)))
        })
        .await
        .map_err(|e| body_error("stream read task", e))?;

        let (data, eof) = read.map_err(|e| body_error("read upload stream", e))?;
        self.buf.extend_from_slice(&data);
        self.eof = eof;
        if !eof {
            self.reader = Some(reader);
        }
        Ok(())
    }

    fn release_before(&mut self, offset: u64) {
        if offset <= self.start {
            return;
        }
        let n = ((offset - self.start) as usize).min(self.buf.len());
        self.buf.drain(..n);
        self.start += n as u64;
    }
}
