//! Byte-duplex channels a [`Session`](crate::session::Session) reads
//! traces from and writes commands to. Each adapter has one reader (the
//! session's producer thread); writes may come from any thread and are
//! serialized by the session.
use crate::diag;
use crate::record::TraceSource;

use std::time::Duration;

use thiserror::Error;

/// Upper bound on one blocking read, so the producer can observe its
/// stop flag and writers can interleave.
pub const READ_POLL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub enum ReadStatus {
    /// `n` bytes were placed at the start of the buffer.
    Data(usize),
    /// No bytes arrived within the poll interval.
    TimedOut,
    /// The peer closed the channel; no further bytes will arrive.
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open transport: {0}")]
    Open(String),
    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port operation failed: {0}")]
    Serial(#[from] serialport::Error),
    #[error("probe operation failed: {0}")]
    Probe(#[from] probe_rs::Error),
    #[error("debug probe operation failed: {0}")]
    DebugProbe(#[from] probe_rs::DebugProbeError),
    #[error("RTT operation failed: {0}")]
    Rtt(#[from] probe_rs_rtt::Error),
    #[error("websocket operation failed: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),
    #[error("invalid websocket request: {0}")]
    WsRequest(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("transport is closed")]
    Closed,
}

impl diag::DiagnosableError for TransportError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            TransportError::Serial(_) => vec![
                "serial devices commonly need rw permissions (dialout group on Linux)".to_string(),
            ],
            TransportError::Probe(_) | TransportError::DebugProbe(_) => vec![
                "a debug probe must be connected and not held by another process".to_string(),
            ],
            TransportError::Rtt(_) => vec![
                "the target firmware must have an RTT control block up before attaching"
                    .to_string(),
            ],
            _ => vec![],
        }
    }
}

/// A byte-duplex channel. Implementations bound every read by
/// [`READ_POLL`] so callers holding the transport lock release it
/// frequently.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, TransportError>;
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
    fn close(&mut self);
    fn source(&self) -> TraceSource;
    fn describe(&self) -> String;
}

pub mod serial;
pub use serial::{SerialConfig, SerialTransport};

pub mod rtt;
pub use rtt::{RttConfig, RttTransport};

pub mod ws;
pub use ws::{WsConfig, WsTransport};
