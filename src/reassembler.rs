//! # Stage: Line Reassembler
//!
//! ## Responsibility
//! Turn transport chunks, split wherever the transport chose, into complete
//! newline-terminated records.
//!
//! ## Guarantees
//! - Splitting is done on raw bytes, so a multi-byte character cut at a chunk
//!   boundary is held back until its remaining bytes arrive. `\n` never occurs
//!   inside a UTF-8 sequence, which makes byte-level framing lossless.
//! - Concatenating the chunks differently yields the same ordered lines.
//! - A trailing `\r` is stripped (CRLF framing).
//!
//! ## NOT Responsible For
//! - Interpreting the lines (that is the decoder)

/// Bytes left over when the transport closed without a final newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnterminatedRecord {
    pub bytes: Vec<u8>,
}

impl UnterminatedRecord {
    pub fn lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug, Default)]
pub struct LineReassembler {
    pending: Vec<u8>,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every line it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        // Buffered bytes hold no newline, so only the new chunk is scanned.
        let Some(last) = chunk.iter().rposition(|b| *b == b'\n') else {
            self.pending.extend_from_slice(chunk);
            return Vec::new();
        };
        self.pending.extend_from_slice(&chunk[..=last]);
        let complete = std::mem::replace(&mut self.pending, chunk[last + 1..].to_vec());
        complete[..complete.len() - 1]
            .split(|b| *b == b'\n')
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect()
    }

    /// Number of buffered bytes still waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// End of stream. Whatever is left never became a record; it is handed
    /// back so the caller can report it, not decode it.
    pub fn finish(&mut self) -> Option<UnterminatedRecord> {
        let rest = std::mem::take(&mut self.pending);
        if rest.iter().all(|b| b.is_ascii_whitespace()) {
            None
        } else {
            Some(UnterminatedRecord { bytes: rest })
        }
    }
}
