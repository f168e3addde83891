//! The unit of trace: one framed line observed from a transport,
//! timestamped when its terminator was seen and sequenced by the bus.
use std::fmt;

use serde::{Deserialize, Serialize};

/// The stream a record was framed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceSource {
    Stdout,
    Stderr,
    Device,
    Rtt,
    Ws,
}

impl fmt::Display for TraceSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            TraceSource::Stdout => "stdout",
            TraceSource::Stderr => "stderr",
            TraceSource::Device => "device",
            TraceSource::Rtt => "rtt",
            TraceSource::Ws => "ws",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// The decoded line, trailing terminators stripped. Never contains
    /// an internal newline.
    pub text: String,
    /// Monotonic nanoseconds since the owning session's clock epoch,
    /// taken when the line terminator was observed.
    pub timestamp: u64,
    pub source: TraceSource,
    /// Strictly increasing and gap-free per session; assigned by the
    /// bus at append time.
    pub sequence: u64,
}

impl TraceRecord {
    pub fn new(text: String, timestamp: u64, source: TraceSource) -> Self {
        Self {
            text,
            timestamp,
            source,
            sequence: 0,
        }
    }
}
