//! Incremental framing of a raw byte stream into line-oriented
//! [`TraceRecord`]s. The emitted lines are independent of how the byte
//! stream was chunked by the transport.
use crate::record::{TraceRecord, TraceSource};

use std::time::Instant;

/// Converts transport bytes into line records.
///
/// Recognized terminators are `\n`, `\r\n` and a lone `\r`. A `\r`
/// flushes the pending line immediately; a directly following `\n` is
/// swallowed so that CRLF input does not produce empty records. Invalid
/// UTF-8 sequences are replaced with U+FFFD and framing continues.
pub struct LineFramer {
    source: TraceSource,
    epoch: Instant,
    buf: Vec<u8>,
    swallow_lf: bool,
}

impl LineFramer {
    pub fn new(source: TraceSource, epoch: Instant) -> Self {
        Self {
            source,
            epoch,
            buf: Vec::new(),
            swallow_lf: false,
        }
    }

    /// Feeds a chunk of bytes, returning every line completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<TraceRecord> {
        let mut records = Vec::new();
        for &b in bytes {
            match b {
                b'\n' if self.swallow_lf => self.swallow_lf = false,
                b'\n' => records.push(self.take_line()),
                b'\r' => {
                    records.push(self.take_line());
                    self.swallow_lf = true;
                }
                _ => {
                    self.swallow_lf = false;
                    self.buf.push(b);
                }
            }
        }
        records
    }

    /// Flushes the residual buffer as a final record, if non-empty.
    /// Called when the transport closes.
    pub fn finish(&mut self) -> Option<TraceRecord> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> TraceRecord {
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        // The terminator was observed just now, not when the first byte
        // of the line arrived.
        let timestamp = self.epoch.elapsed().as_nanos() as u64;
        TraceRecord::new(text, timestamp, self.source)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn lines_of(framer: &mut LineFramer, chunks: &[&[u8]]) -> Vec<String> {
        let mut out: Vec<String> = vec![];
        for chunk in chunks {
            out.extend(framer.push(chunk).into_iter().map(|r| r.text));
        }
        out.extend(framer.finish().map(|r| r.text));
        out
    }

    #[test]
    fn mixed_terminators() {
        let mut framer = LineFramer::new(TraceSource::Device, Instant::now());
        assert_eq!(
            lines_of(&mut framer, &[b"a\r\nb\nc\rd"]),
            vec!["a", "b", "c", "d"]
        );
    }

    #[test]
    fn crlf_does_not_produce_empty_records() {
        let mut framer = LineFramer::new(TraceSource::Device, Instant::now());
        assert_eq!(lines_of(&mut framer, &[b"x\r\ny\r\n"]), vec!["x", "y"]);
    }

    #[test]
    fn crlf_split_across_chunks() {
        let mut framer = LineFramer::new(TraceSource::Device, Instant::now());
        assert_eq!(lines_of(&mut framer, &[b"x\r", b"\ny\n"]), vec!["x", "y"]);
    }

    #[test]
    fn bare_empty_lines_are_kept() {
        let mut framer = LineFramer::new(TraceSource::Device, Instant::now());
        assert_eq!(lines_of(&mut framer, &[b"\n\na\n"]), vec!["", "", "a"]);
    }

    /// The emitted line sequence must not depend on how the byte stream
    /// was split into read chunks.
    #[test]
    fn chunking_invariance() {
        let input = b"foo1\r\nbar2\nbaz3\rqux\xff4\n tail";
        let reference = {
            let mut framer = LineFramer::new(TraceSource::Device, Instant::now());
            lines_of(&mut framer, &[input])
        };
        for split in 1..input.len() {
            let (head, tail) = input.split_at(split);
            let mut framer = LineFramer::new(TraceSource::Device, Instant::now());
            assert_eq!(
                lines_of(&mut framer, &[head, tail]),
                reference,
                "split at {} diverged",
                split
            );
        }
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut framer = LineFramer::new(TraceSource::Device, Instant::now());
        assert_eq!(lines_of(&mut framer, &[b"a\xffb\n"]), vec!["a\u{fffd}b"]);
    }

    #[test]
    fn finish_flushes_residue() {
        let mut framer = LineFramer::new(TraceSource::Device, Instant::now());
        assert!(framer.push(b"partial").is_empty());
        assert_eq!(framer.finish().unwrap().text, "partial");
        assert!(framer.finish().is_none());
    }
}
