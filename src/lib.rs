//! Trace-and-event matching engine.
//!
//! Two front doors share one core: [`ProcessController`] drives a child
//! OS process and reacts to its stdout/stderr, and [`Session`] drives a
//! bidirectional ASCII channel (serial, RTT-over-JTAG, WebSocket). Both
//! expose the same operation: issue an optional command, then block
//! until every required pattern has matched, an avoided pattern
//! matches, or a timeout expires, while a background producer frames
//! transport bytes into timestamped line records on a [`TraceBus`].
use thiserror::Error;

pub mod bus;
pub mod diag;
pub mod event;
pub mod framer;
pub mod log;
pub mod matcher;
pub mod process;
pub mod record;
pub mod session;
pub mod transport;
pub mod wait;

pub use bus::{NextRecord, StartFrom, Subscription, TraceBus};
pub use event::{CompiledPattern, EventMap, EventTag, PatternError, PatternRef, ResolvedPattern};
pub use framer::LineFramer;
pub use matcher::{match_record, MatchResult};
pub use process::{ProcessConfig, ProcessController, ProcessError};
pub use record::{TraceRecord, TraceSource};
pub use session::{Session, SessionConfig};
pub use transport::{
    ReadStatus, RttConfig, SerialConfig, Transport, TransportError, WsConfig,
};
pub use wait::{
    CancelToken, CollectPolicy, ResponseFormat, TerminatedBy, WaitError, WaitItem, WaitOptions,
    WaitOutcome,
};

#[derive(Debug, Error)]
pub enum TracewaitError {
    // adhoc errors
    #[error("I/O operation failed: {0}")]
    IOError(#[from] std::io::Error),

    // transparent errors
    #[error(transparent)]
    PatternError(#[from] PatternError),
    #[error(transparent)]
    TransportError(#[from] TransportError),
    #[error(transparent)]
    ProcessError(#[from] ProcessError),
    #[error(transparent)]
    WaitError(#[from] WaitError),

    // everything else
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl diag::DiagnosableError for TracewaitError {
    fn diagnose(&self) -> Vec<String> {
        vec![]
    }
}

impl TracewaitError {
    pub fn render(&self) {
        log::err(&self.to_string());

        // print eventual hints
        use crate::diag::DiagnosableError;
        type DE = dyn DiagnosableError;
        for hint in self.diagnose().iter().chain(
            match self {
                Self::PatternError(e) => Some(e as &DE),
                Self::TransportError(e) => Some(e as &DE),
                Self::ProcessError(e) => Some(e as &DE),
                Self::WaitError(e) => Some(e as &DE),
                _ => None,
            }
            .map(|e| e.diagnose())
            .unwrap_or_default()
            .iter(),
        ) {
            log::hint(hint);
        }
    }
}
