//! The waiter state machine: consume records from a [`Subscription`]
//! until the acceptance condition (every required pattern matched), a
//! rejection (any avoided pattern matched), a timeout, a cancellation
//! or the end of the stream terminates the wait.
use crate::bus::{NextRecord, StartFrom, Subscription, TraceBus};
use crate::diag;
use crate::event::{resolve_in, EventMapSnapshot, PatternError, PatternRef, ResolvedPattern};
use crate::matcher::{match_record, MatchResult};
use crate::process::ExitWatch;
use crate::record::TraceRecord;
use crate::transport::TransportError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on one blocking step, so cancellation and child-exit
/// notifications are observed promptly.
const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum WaitError {
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("failed to issue command: {0}")]
    Send(#[source] TransportError),
    #[error("session is not capturing")]
    NotCapturing,
}

impl diag::DiagnosableError for WaitError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            WaitError::NotCapturing => {
                vec!["call start_capturing before issuing waits".to_string()]
            }
            WaitError::Pattern(e) => e.diagnose(),
            _ => vec![],
        }
    }
}

/// Which records a wait retains in its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectPolicy {
    /// One entry per newly satisfied required pattern.
    Matching,
    /// Every record seen, matching or not.
    All,
    /// Only the most recent matching record.
    LastOnly,
}

/// Shape of the retained result entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Plain records; callers typically want their `text`.
    Raw,
    /// [`MatchResult`]s with named captures and the originating
    /// pattern/tag.
    Processed,
}

/// Cancellation handle shared between a wait and its controller.
/// Cancelling is idempotent.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Wait deadline in milliseconds; 0 disables the timeout.
    pub timeout_ms: u64,
    pub collect: CollectPolicy,
    /// `None` defers to the operation's default: RAW for trace waits,
    /// PROCESSED for event waits.
    pub response_format: Option<ResponseFormat>,
    /// Terminate on the first satisfied required pattern.
    pub return_on_first_match: bool,
    /// Replay the retained backlog before live records. When unset the
    /// backlog is cleared at wait start instead.
    pub use_backlog: bool,
    /// Keep every result entry; unset retains only the most recent.
    pub accumulate: bool,
    /// Skip the first record that echoes the issued command verbatim.
    pub ignore_echo: bool,
    /// Process runner only: terminate when the child exits.
    pub run_to_completion: bool,
    pub cancel: CancelToken,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            collect: CollectPolicy::Matching,
            response_format: None,
            return_on_first_match: false,
            use_backlog: false,
            accumulate: true,
            ignore_echo: false,
            run_to_completion: false,
            cancel: CancelToken::new(),
        }
    }
}

/// One retained result: the bare record, or the match that consumed it.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum WaitItem {
    Match(MatchResult),
    Record(TraceRecord),
}

impl WaitItem {
    pub fn record(&self) -> &TraceRecord {
        match self {
            WaitItem::Match(m) => &m.record,
            WaitItem::Record(r) => r,
        }
    }

    pub fn text(&self) -> &str {
        &self.record().text
    }

    pub fn as_match(&self) -> Option<&MatchResult> {
        match self {
            WaitItem::Match(m) => Some(m),
            WaitItem::Record(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminatedBy {
    Accepted,
    Rejected { pattern: String },
    Timeout,
    Cancelled { overflow: bool },
    TransportClosed,
    ProcessExited { code: i32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct WaitOutcome {
    pub successful: bool,
    pub results: Vec<WaitItem>,
    /// Labels of the required patterns that never matched.
    pub required_remaining: Vec<String>,
    pub terminated_by: TerminatedBy,
}

impl WaitOutcome {
    pub fn texts(&self) -> Vec<&str> {
        self.results.iter().map(|item| item.text()).collect()
    }
}

/// One wait in flight. Construction resolves and snapshots everything
/// and subscribes to the bus; the command (if any) must be issued
/// between [`Waiter::new`] and [`Waiter::run`] so no trace it provokes
/// can be missed.
pub(crate) struct Waiter {
    required: Vec<ResolvedPattern>,
    avoided: Vec<ResolvedPattern>,
    satisfied: Vec<bool>,
    results: Vec<WaitItem>,
    opts: WaitOptions,
    format: ResponseFormat,
    sub: Subscription,
    session_cancel: Option<CancelToken>,
    echo_pending: Option<String>,
}

impl Waiter {
    pub fn new(
        bus: &TraceBus,
        snapshot: &EventMapSnapshot,
        required: &[PatternRef],
        avoided: &[PatternRef],
        opts: WaitOptions,
        default_format: ResponseFormat,
    ) -> Result<Self, WaitError> {
        // Resolution happens before any side effect: an unknown tag or
        // a bad pattern fails the wait without touching the bus.
        let required = resolve_unique(snapshot, required)?;
        let avoided = resolve_unique(snapshot, avoided)?;

        if !opts.use_backlog {
            bus.clear_backlog();
        }
        let sub = bus.subscribe(if opts.use_backlog {
            StartFrom::ReplayAll
        } else {
            StartFrom::Live
        });

        let satisfied = vec![false; required.len()];
        let format = opts.response_format.unwrap_or(default_format);
        Ok(Self {
            required,
            avoided,
            satisfied,
            results: Vec::new(),
            opts,
            format,
            sub,
            session_cancel: None,
            echo_pending: None,
        })
    }

    pub fn session_cancel(mut self, token: CancelToken) -> Self {
        self.session_cancel = Some(token);
        self
    }

    pub fn echo(mut self, cmd: &str) -> Self {
        if self.opts.ignore_echo {
            self.echo_pending = Some(cmd.to_string());
        }
        self
    }

    /// Runs the wait to a terminal state. `exit` carries the process
    /// runner's child-exit notification, when there is one.
    pub fn run(mut self, exit: Option<&ExitWatch>) -> WaitOutcome {
        let deadline = match self.opts.timeout_ms {
            0 => None,
            ms => Some(Instant::now() + Duration::from_millis(ms)),
        };

        // With nothing required and no exit to await, the wait is
        // degenerate and completes at once.
        if self.required.is_empty() && !self.opts.run_to_completion {
            return self.finish(TerminatedBy::Accepted, true);
        }

        loop {
            if self.cancelled() {
                return self.finish(TerminatedBy::Cancelled { overflow: false }, false);
            }
            // A mailbox drop means a gap of unknown position; reporting
            // a positive outcome across it would be a false positive.
            if self.sub.dropped() > 0 {
                return self.finish(TerminatedBy::Cancelled { overflow: true }, false);
            }
            let step = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return self.finish(TerminatedBy::Timeout, false);
                    }
                    TICK.min(remaining)
                }
                None => TICK,
            };

            match self.sub.next(step) {
                NextRecord::Record(record) => {
                    if let Some(echo) = &self.echo_pending {
                        if record.text == *echo {
                            self.echo_pending = None;
                            continue;
                        }
                    }
                    if let Some(outcome) = self.evaluate(record) {
                        return outcome;
                    }
                }
                NextRecord::TimedOut => continue,
                NextRecord::Closed => {
                    // Session shutdown both cancels and closes; the
                    // cancellation is what the caller asked for.
                    if self.cancelled() {
                        return self.finish(TerminatedBy::Cancelled { overflow: false }, false);
                    }
                    // The process supervisor publishes the exit status
                    // before closing the bus, so a closed stream with
                    // an exit watch always has a code.
                    if let Some(code) = exit.and_then(ExitWatch::get) {
                        let successful = code == 0 && self.satisfied.iter().all(|&s| s);
                        return self.finish(TerminatedBy::ProcessExited { code }, successful);
                    }
                    return self.finish(TerminatedBy::TransportClosed, false);
                }
            }
        }
    }

    fn cancelled(&self) -> bool {
        self.opts.cancel.is_cancelled()
            || self
                .session_cancel
                .as_ref()
                .map_or(false, CancelToken::is_cancelled)
    }

    /// Evaluates one record atomically. Returns the terminal outcome if
    /// this record ends the wait.
    fn evaluate(&mut self, record: TraceRecord) -> Option<WaitOutcome> {
        // Avoided patterns first: rejection is terminal and wins over
        // any required match on the same record. The offending record
        // is reported regardless of the collect policy.
        for i in 0..self.avoided.len() {
            if let Some(m) = match_record(&record, &self.avoided[i]) {
                let pattern = self.avoided[i].label();
                let item = self.make_item(m);
                self.push_result(item);
                return Some(self.finish(TerminatedBy::Rejected { pattern }, false));
            }
        }

        // Required patterns are checked in caller order; a pattern is
        // satisfied at most once.
        let mut first_match: Option<MatchResult> = None;
        let mut newly: Vec<MatchResult> = Vec::new();
        for i in 0..self.required.len() {
            if let Some(m) = match_record(&record, &self.required[i]) {
                if first_match.is_none() {
                    first_match = Some(m.clone());
                }
                if !self.satisfied[i] {
                    self.satisfied[i] = true;
                    newly.push(m);
                }
            }
        }

        match self.opts.collect {
            CollectPolicy::Matching => {
                for m in newly {
                    let item = self.make_item(m);
                    self.push_result(item);
                }
            }
            CollectPolicy::All => {
                // Every record appears exactly once, as the match of
                // the first matching pattern where there is one.
                let item = match first_match.clone() {
                    Some(m) => self.make_item(m),
                    None => WaitItem::Record(record),
                };
                self.push_result(item);
            }
            CollectPolicy::LastOnly => {
                if let Some(m) = first_match.clone() {
                    self.results.clear();
                    let item = self.make_item(m);
                    self.push_result(item);
                }
            }
        }

        if first_match.is_some() && self.opts.return_on_first_match {
            return Some(self.finish(TerminatedBy::Accepted, true));
        }
        if !self.required.is_empty() && self.satisfied.iter().all(|&s| s) {
            return Some(self.finish(TerminatedBy::Accepted, true));
        }
        None
    }

    fn make_item(&self, m: MatchResult) -> WaitItem {
        match self.format {
            ResponseFormat::Raw => WaitItem::Record(m.record),
            ResponseFormat::Processed => WaitItem::Match(m),
        }
    }

    fn push_result(&mut self, item: WaitItem) {
        self.results.push(item);
        if !self.opts.accumulate && self.results.len() > 1 {
            let keep_from = self.results.len() - 1;
            self.results.drain(..keep_from);
        }
    }

    fn finish(&mut self, terminated_by: TerminatedBy, successful: bool) -> WaitOutcome {
        let required_remaining = self
            .required
            .iter()
            .zip(&self.satisfied)
            .filter(|(_, &satisfied)| !satisfied)
            .map(|(pattern, _)| pattern.label())
            .collect();
        WaitOutcome {
            successful,
            results: std::mem::take(&mut self.results),
            required_remaining,
            terminated_by,
        }
        // The subscription is released when the waiter drops, on every
        // exit path.
    }
}

/// Resolves a pattern list against one snapshot, collapsing duplicate
/// references so each pattern needs at most one match.
fn resolve_unique(
    snapshot: &EventMapSnapshot,
    patterns: &[PatternRef],
) -> Result<Vec<ResolvedPattern>, WaitError> {
    let mut resolved: Vec<ResolvedPattern> = Vec::with_capacity(patterns.len());
    for pattern in patterns {
        let candidate = resolve_in(snapshot, pattern)?;
        let duplicate = resolved
            .iter()
            .any(|p| p.tag == candidate.tag && p.pattern.as_str() == candidate.pattern.as_str());
        if !duplicate {
            resolved.push(candidate);
        }
    }
    Ok(resolved)
}
