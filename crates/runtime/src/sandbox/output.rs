//! Bounded stream capture
//!
//! Provides `OutputCapture`, a per-stream reader that keeps the first
//! `max_bytes` bytes of a child's output and discards the rest. The stream is
//! drained to EOF regardless, so a chatty child never blocks on a full pipe.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::types::CapturedOutput;

const CHUNK_SIZE: usize = 8 * 1024;

/// Head-truncating reader for one output stream.
#[derive(Debug, Clone, Copy)]
pub struct OutputCapture {
    max_bytes: usize,
}

impl OutputCapture {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    /// Read `reader` to EOF, retaining at most `max_bytes`.
    ///
    /// A read error ends the capture with whatever was collected so far.
    pub async fn capture<R: AsyncRead + Unpin>(&self, reader: &mut R) -> CapturedOutput {
        let mut kept = Vec::with_capacity(self.max_bytes.min(CHUNK_SIZE));
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut total = 0usize;

        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    total = total.saturating_add(n);
                    let room = self.max_bytes.saturating_sub(kept.len());
                    if room > 0 {
                        kept.extend_from_slice(&chunk[..n.min(room)]);
                    }
                }
                Err(e) => {
                    tracing::debug!("Output stream read failed: {}", e);
                    break;
                }
            }
        }

        CapturedOutput {
            truncated: total > kept.len(),
            bytes: kept,
            total_bytes: total,
        }
    }

    /// Capture an optional child pipe; a missing pipe yields empty output.
    pub async fn capture_opt<R: AsyncRead + Unpin>(
        &self,
        reader: Option<&mut R>,
    ) -> CapturedOutput {
        match reader {
            Some(reader) => self.capture(reader).await,
            None => CapturedOutput::default(),
        }
    }
}

/// Last `max_chars` characters of `text`, trimmed, for error messages.
pub fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        return trimmed.to_string();
    }
    let skipped: String = trimmed.chars().skip(count - max_chars).collect();
    format!("...{}", skipped)
}
