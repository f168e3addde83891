//! The device-communications facade: one transport, one producer
//! thread, one trace bus and one event map per session.
use crate::bus::{StartFrom, Subscription, TraceBus};
use crate::event::{EventMap, EventTag, PatternError, PatternRef};
use crate::framer::LineFramer;
use crate::log;
use crate::record::TraceSource;
use crate::transport::{
    ReadStatus, RttConfig, RttTransport, SerialConfig, SerialTransport, Transport, TransportError,
    WsConfig, WsTransport,
};
use crate::wait::{CancelToken, ResponseFormat, WaitError, WaitOptions, WaitOutcome, Waiter};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Backoff after an empty poll, so adapters that return immediately
/// (RTT) do not spin and writers get a window at the transport lock.
const POLL_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Appended to every command issued with
    /// [`Session::send_cmd`].
    pub line_terminator: String,
    pub backlog_capacity: usize,
    pub mailbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            line_terminator: "\n".to_string(),
            backlog_capacity: crate::bus::DEFAULT_BACKLOG_CAPACITY,
            mailbox_capacity: crate::bus::DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Capturing,
    Stopped,
}

struct CaptureState {
    phase: Phase,
    bus: Option<Arc<TraceBus>>,
    producer: Option<thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

pub struct Session {
    transport: Arc<Mutex<Box<dyn Transport>>>,
    source: TraceSource,
    description: String,
    config: SessionConfig,
    epoch: Instant,
    events: EventMap,
    state: Mutex<CaptureState>,
    /// Concurrent waits sharing one session are not defined; they are
    /// serialized here.
    wait_lock: Mutex<()>,
    cancel: CancelToken,
}

impl Session {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: Box<dyn Transport>, config: SessionConfig) -> Self {
        let source = transport.source();
        let description = transport.describe();
        Self {
            transport: Arc::new(Mutex::new(transport)),
            source,
            description,
            config,
            epoch: Instant::now(),
            events: EventMap::new(),
            state: Mutex::new(CaptureState {
                phase: Phase::Idle,
                bus: None,
                producer: None,
                stop: Arc::new(AtomicBool::new(false)),
            }),
            wait_lock: Mutex::new(()),
            cancel: CancelToken::new(),
        }
    }

    pub fn serial(config: &SerialConfig) -> Result<Self, TransportError> {
        Ok(Self::new(Box::new(SerialTransport::open(config)?)))
    }

    pub fn rtt(config: &RttConfig) -> Result<Self, TransportError> {
        Ok(Self::new(Box::new(RttTransport::open(config)?)))
    }

    pub fn websocket(config: &WsConfig) -> Result<Self, TransportError> {
        Ok(Self::new(Box::new(WsTransport::open(config)?)))
    }

    pub fn describe(&self) -> String {
        self.description.clone()
    }

    /// Spawns the producer that pulls bytes from the transport, frames
    /// them and appends to the bus. Idempotent while capturing; a
    /// stopped session cannot be restarted (its transport is closed).
    pub fn start_capturing(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        match state.phase {
            Phase::Capturing => Ok(()),
            Phase::Stopped => Err(TransportError::Closed),
            Phase::Idle => {
                let bus = state
                    .bus
                    .get_or_insert_with(|| {
                        Arc::new(TraceBus::with_capacity(
                            self.config.backlog_capacity,
                            self.config.mailbox_capacity,
                        ))
                    })
                    .clone();
                let stop = Arc::new(AtomicBool::new(false));
                state.stop = stop.clone();
                let transport = self.transport.clone();
                let framer = LineFramer::new(self.source, self.epoch);
                state.producer = Some(thread::spawn(move || {
                    producer_loop(transport, framer, bus, stop)
                }));
                state.phase = Phase::Capturing;
                Ok(())
            }
        }
    }

    /// Halts the producer, closes the transport and the bus. No record
    /// is produced after this returns. Idempotent.
    pub fn stop_capturing(&self) {
        let mut state = self.state.lock().unwrap();
        match state.phase {
            Phase::Stopped => {}
            Phase::Idle => {
                self.transport.lock().unwrap().close();
                state.phase = Phase::Stopped;
            }
            Phase::Capturing => {
                state.stop.store(true, Ordering::Relaxed);
                if let Some(producer) = state.producer.take() {
                    // The producer closes the bus on its way out.
                    let _ = producer.join();
                }
                self.transport.lock().unwrap().close();
                state.phase = Phase::Stopped;
            }
        }
    }

    /// Appends the configured line terminator and writes atomically.
    pub fn send_cmd(&self, text: &str) -> Result<(), TransportError> {
        let mut line = String::with_capacity(text.len() + self.config.line_terminator.len());
        line.push_str(text);
        line.push_str(&self.config.line_terminator);
        self.transport.lock().unwrap().write(line.as_bytes())
    }

    /// Installs the tag→pattern map used by event waits. Replacement is
    /// atomic; in-flight waits keep their snapshot.
    pub fn set_event_map<I, S>(&self, entries: I) -> Result<(), PatternError>
    where
        I: IntoIterator<Item = (EventTag, S)>,
        S: AsRef<str>,
    {
        self.events.set(entries)
    }

    /// Issues `cmd` (if any) and blocks until the required patterns are
    /// satisfied, an avoided pattern matches, or the wait times out.
    /// Results default to the RAW format.
    pub fn wait_for_trace(
        &self,
        cmd: Option<&str>,
        required: &[PatternRef],
        avoided: &[PatternRef],
        opts: WaitOptions,
    ) -> Result<WaitOutcome, WaitError> {
        self.wait(cmd, required, avoided, opts, ResponseFormat::Raw)
    }

    /// Tag-based variant of [`Session::wait_for_trace`]; results
    /// default to the PROCESSED format and carry their event tags.
    pub fn wait_for_event(
        &self,
        cmd: Option<&str>,
        required: &[EventTag],
        avoided: &[EventTag],
        opts: WaitOptions,
    ) -> Result<WaitOutcome, WaitError> {
        let required: Vec<PatternRef> = required.iter().cloned().map(PatternRef::from).collect();
        let avoided: Vec<PatternRef> = avoided.iter().cloned().map(PatternRef::from).collect();
        self.wait(cmd, &required, &avoided, opts, ResponseFormat::Processed)
    }

    fn wait(
        &self,
        cmd: Option<&str>,
        required: &[PatternRef],
        avoided: &[PatternRef],
        opts: WaitOptions,
        default_format: ResponseFormat,
    ) -> Result<WaitOutcome, WaitError> {
        let _serialized = self.wait_lock.lock().unwrap();
        let bus = self
            .state
            .lock()
            .unwrap()
            .bus
            .clone()
            .ok_or(WaitError::NotCapturing)?;
        let snapshot = self.events.snapshot();
        let mut waiter = Waiter::new(&bus, &snapshot, required, avoided, opts, default_format)?
            .session_cancel(self.cancel.clone());
        if let Some(cmd) = cmd {
            waiter = waiter.echo(cmd);
            // Issued after the subscription exists, so no trace the
            // command provokes can be missed.
            self.send_cmd(cmd).map_err(WaitError::Send)?;
        }
        Ok(waiter.run(None))
    }

    /// A live cursor over the bus for custom consumers.
    pub fn raw_queue(&self) -> Result<Subscription, WaitError> {
        let bus = self
            .state
            .lock()
            .unwrap()
            .bus
            .clone()
            .ok_or(WaitError::NotCapturing)?;
        Ok(bus.subscribe(StartFrom::Live))
    }

    pub fn clear_backlog(&self) {
        if let Some(bus) = self.state.lock().unwrap().bus.clone() {
            bus.clear_backlog();
        }
    }

    /// Records evicted from the backlog by the capacity bound.
    pub fn dropped_total(&self) -> u64 {
        self.state
            .lock()
            .unwrap()
            .bus
            .as_ref()
            .map_or(0, |bus| bus.dropped_total())
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Cancels outstanding waits, tears down the producer and closes
    /// transport and bus. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.stop_capturing();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_capturing();
    }
}

fn producer_loop(
    transport: Arc<Mutex<Box<dyn Transport>>>,
    mut framer: LineFramer,
    bus: Arc<TraceBus>,
    stop: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 4096];
    while !stop.load(Ordering::Relaxed) {
        // The lock is held for at most one poll interval per iteration.
        let status = transport.lock().unwrap().read(&mut buf);
        match status {
            Ok(ReadStatus::Data(n)) => {
                for record in framer.push(&buf[..n]) {
                    if bus.append(record).is_err() {
                        return;
                    }
                }
            }
            Ok(ReadStatus::TimedOut) => thread::sleep(POLL_BACKOFF),
            Ok(ReadStatus::Closed) => break,
            Err(e) => {
                log::warn(&format!("trace producer stopped: {}", e));
                break;
            }
        }
    }
    // Stream over: flush the residual partial line and seal the bus so
    // waiters observe the closed transport.
    if let Some(record) = framer.finish() {
        let _ = bus.append(record);
    }
    bus.close();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wait::{CollectPolicy, TerminatedBy};

    use std::collections::VecDeque;

    /// Scripted transport: each entry is delivered after its delay,
    /// then the channel reports closed. Writes are recorded.
    struct MockTransport {
        script: VecDeque<(Duration, Vec<u8>)>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl MockTransport {
        fn new(script: &[(u64, &[u8])]) -> (Self, Arc<Mutex<Vec<u8>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    script: script
                        .iter()
                        .map(|(ms, bytes)| (Duration::from_millis(*ms), bytes.to_vec()))
                        .collect(),
                    written: written.clone(),
                },
                written,
            )
        }
    }

    impl Transport for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> Result<ReadStatus, TransportError> {
            match self.script.pop_front() {
                Some((delay, bytes)) => {
                    thread::sleep(delay);
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(ReadStatus::Data(bytes.len()))
                }
                None => Ok(ReadStatus::Closed),
            }
        }

        fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.written.lock().unwrap().extend_from_slice(bytes);
            Ok(())
        }

        fn close(&mut self) {
            self.script.clear();
        }

        fn source(&self) -> TraceSource {
            TraceSource::Device
        }

        fn describe(&self) -> String {
            "mock".to_string()
        }
    }

    fn session_with(script: &[(u64, &[u8])]) -> (Session, Arc<Mutex<Vec<u8>>>) {
        let (transport, written) = MockTransport::new(script);
        (Session::new(Box::new(transport)), written)
    }

    fn backlog_opts() -> WaitOptions {
        WaitOptions {
            use_backlog: true,
            ..WaitOptions::default()
        }
    }

    #[test]
    fn captures_and_matches_framed_lines() {
        let (session, _) = session_with(&[(5, b"boot ok\r\nready\n")]);
        session.start_capturing().unwrap();
        let outcome = session
            .wait_for_trace(None, &[PatternRef::from(r"ready")], &[], backlog_opts())
            .unwrap();
        assert!(outcome.successful);
        assert_eq!(outcome.texts(), vec!["ready"]);
        session.stop_capturing();
    }

    #[test]
    fn send_cmd_appends_the_configured_terminator() {
        let (session, written) = session_with(&[]);
        session.send_cmd("AT").unwrap();
        assert_eq!(written.lock().unwrap().as_slice(), b"AT\n");

        let (transport, written) = MockTransport::new(&[]);
        let session = Session::with_config(
            Box::new(transport),
            SessionConfig {
                line_terminator: "\r\n".to_string(),
                ..SessionConfig::default()
            },
        );
        session.send_cmd("AT").unwrap();
        assert_eq!(written.lock().unwrap().as_slice(), b"AT\r\n");
    }

    #[test]
    fn wait_issues_the_command_after_subscribing() {
        let (session, written) = session_with(&[(50, b"pong\n")]);
        session.start_capturing().unwrap();
        let outcome = session
            .wait_for_trace(
                Some("ping"),
                &[PatternRef::from(r"pong")],
                &[],
                WaitOptions::default(),
            )
            .unwrap();
        assert!(outcome.successful);
        assert_eq!(written.lock().unwrap().as_slice(), b"ping\n");
        session.stop_capturing();
    }

    #[test]
    fn event_waits_resolve_tags_and_carry_them() {
        let (session, _) = session_with(&[(5, b"Booting v7\n")]);
        session
            .set_event_map([(EventTag::from("boot"), r"Booting v(?P<version>\d+)")])
            .unwrap();
        session.start_capturing().unwrap();
        let outcome = session
            .wait_for_event(None, &[EventTag::from("boot")], &[], backlog_opts())
            .unwrap();
        assert!(outcome.successful);
        let m = outcome.results[0].as_match().unwrap();
        assert_eq!(m.event_tag.as_ref().unwrap().as_str(), "boot");
        assert_eq!(m.named_captures["version"], "7");
        session.stop_capturing();
    }

    #[test]
    fn unknown_event_tag_fails_before_io() {
        let (session, written) = session_with(&[(5, b"anything\n")]);
        session.start_capturing().unwrap();
        let err = session
            .wait_for_event(
                Some("should not be sent"),
                &[EventTag::from("missing")],
                &[],
                WaitOptions::default(),
            )
            .err()
            .unwrap();
        assert!(matches!(err, WaitError::Pattern(_)));
        assert!(written.lock().unwrap().is_empty());
        session.stop_capturing();
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let (session, _) = session_with(&[(200, b"late\n")]);
        session.start_capturing().unwrap();
        session.start_capturing().unwrap();
        session.stop_capturing();
        session.stop_capturing();
        assert!(matches!(
            session.start_capturing(),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn stopping_flushes_the_residual_partial_line() {
        let (session, _) = session_with(&[(5, b"no newline here")]);
        session.start_capturing().unwrap();
        // The script runs dry, the producer flushes and seals the bus.
        let outcome = session
            .wait_for_trace(None, &[PatternRef::from(r"no newline")], &[], backlog_opts())
            .unwrap();
        assert!(outcome.successful);
        session.stop_capturing();
    }

    #[test]
    fn transport_end_terminates_waits() {
        let (session, _) = session_with(&[]);
        session.start_capturing().unwrap();
        let outcome = session
            .wait_for_trace(
                None,
                &[PatternRef::from(r"never")],
                &[],
                WaitOptions {
                    timeout_ms: 0,
                    ..WaitOptions::default()
                },
            )
            .unwrap();
        assert!(!outcome.successful);
        assert_eq!(outcome.terminated_by, TerminatedBy::TransportClosed);
    }

    #[test]
    fn command_echo_can_be_suppressed() {
        let (session, _) = session_with(&[(5, b"status\nstatus: ok\n")]);
        session.start_capturing().unwrap();
        let outcome = session
            .wait_for_trace(
                Some("status"),
                &[PatternRef::from(r"status")],
                &[],
                WaitOptions {
                    ignore_echo: true,
                    collect: CollectPolicy::All,
                    ..backlog_opts()
                },
            )
            .unwrap();
        assert!(outcome.successful);
        assert_eq!(outcome.texts(), vec!["status: ok"]);
        session.stop_capturing();
    }

    #[test]
    fn cancelling_the_session_unblocks_waits() {
        let (session, _) = session_with(&[(500, b"slow\n")]);
        let session = Arc::new(session);
        session.start_capturing().unwrap();
        let canceller = {
            let session = session.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                session.cancel();
                session.cancel(); // idempotent
            })
        };
        let outcome = session
            .wait_for_trace(
                None,
                &[PatternRef::from(r"never")],
                &[],
                WaitOptions {
                    timeout_ms: 0,
                    ..WaitOptions::default()
                },
            )
            .unwrap();
        canceller.join().unwrap();
        assert!(!outcome.successful);
        assert_eq!(
            outcome.terminated_by,
            TerminatedBy::Cancelled { overflow: false }
        );
    }

    #[test]
    fn raw_queue_exposes_live_records() {
        let (session, _) = session_with(&[(80, b"tick\n")]);
        session.start_capturing().unwrap();
        let mut sub = session.raw_queue().unwrap();
        match sub.next(Duration::from_millis(500)) {
            crate::bus::NextRecord::Record(r) => {
                assert_eq!(r.text, "tick");
                assert_eq!(r.source, TraceSource::Device);
            }
            other => panic!("expected live record, got {:?}", other),
        }
        session.stop_capturing();
    }
}
