//! The per-session trace bus: a bounded backlog of every framed record
//! plus a broadcast path to live subscribers. The backlog is owned by
//! the bus alone; consumers read through [`Subscription`] handles.
use crate::record::TraceRecord;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel as channel;
use thiserror::Error;

/// Records retained for replay before the oldest is evicted.
pub const DEFAULT_BACKLOG_CAPACITY: usize = 4096;
/// Records buffered per subscriber before new broadcasts are dropped
/// for that subscriber only.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("trace bus is closed")]
    Closed,
}

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFrom {
    /// Only records appended after the subscription was registered.
    Live,
    /// The retained backlog first, in order, then live records.
    ReplayAll,
}

/// Result of [`Subscription::next`].
#[derive(Debug)]
pub enum NextRecord {
    Record(TraceRecord),
    TimedOut,
    /// The bus was closed and every delivered record has been consumed.
    Closed,
}

struct Mailbox {
    tx: channel::Sender<TraceRecord>,
    dropped: Arc<AtomicU64>,
}

struct BusInner {
    backlog: VecDeque<TraceRecord>,
    subscribers: Vec<Mailbox>,
    next_sequence: u64,
    closed: bool,
}

pub struct TraceBus {
    inner: Mutex<BusInner>,
    backlog_capacity: usize,
    mailbox_capacity: usize,
    evicted: AtomicU64,
}

impl TraceBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BACKLOG_CAPACITY, DEFAULT_MAILBOX_CAPACITY)
    }

    pub fn with_capacity(backlog_capacity: usize, mailbox_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                backlog: VecDeque::with_capacity(backlog_capacity.min(1024)),
                subscribers: Vec::new(),
                next_sequence: 0,
                closed: false,
            }),
            backlog_capacity,
            mailbox_capacity,
            evicted: AtomicU64::new(0),
        }
    }

    /// Assigns the record its sequence, retains it in the backlog and
    /// broadcasts it to every live subscriber. Append and broadcast
    /// happen under one lock, so no subscriber can observe a record
    /// before a backlog replay would.
    pub fn append(&self, mut record: TraceRecord) -> Result<u64, BusError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(BusError::Closed);
        }

        record.sequence = inner.next_sequence;
        inner.next_sequence += 1;

        inner.backlog.push_back(record.clone());
        if inner.backlog.len() > self.backlog_capacity {
            inner.backlog.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }

        // A full mailbox drops the new record for that subscriber only;
        // its private drop counter makes the loss observable.
        inner.subscribers.retain(|mailbox| match mailbox.tx.try_send(record.clone()) {
            Ok(()) => true,
            Err(channel::TrySendError::Full(_)) => {
                mailbox.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(channel::TrySendError::Disconnected(_)) => false,
        });

        Ok(record.sequence)
    }

    /// Registers a subscriber. With [`StartFrom::ReplayAll`] the
    /// current backlog is snapshotted into the subscription cursor, so
    /// a later [`TraceBus::clear_backlog`] cannot retract records the
    /// subscriber already holds.
    pub fn subscribe(&self, start_from: StartFrom) -> Subscription {
        let mut inner = self.inner.lock().unwrap();
        let replay = match start_from {
            StartFrom::ReplayAll => inner.backlog.iter().cloned().collect(),
            StartFrom::Live => VecDeque::new(),
        };
        let (tx, rx) = channel::bounded(self.mailbox_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        if inner.closed {
            // The sender is dropped immediately; the subscription sees
            // a closed bus after any replayed records.
            drop(tx);
        } else {
            inner.subscribers.push(Mailbox {
                tx,
                dropped: dropped.clone(),
            });
        }
        Subscription { replay, rx, dropped }
    }

    /// Empties the backlog. Subscriptions that already replayed it keep
    /// their copies.
    pub fn clear_backlog(&self) {
        self.inner.lock().unwrap().backlog.clear();
    }

    /// Terminal. Subscribers drain whatever was already delivered and
    /// then observe [`NextRecord::Closed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Total records evicted from the backlog by the capacity bound.
    pub fn dropped_total(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.lock().unwrap().backlog.len()
    }
}

impl Default for TraceBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A live cursor over the bus, optionally preceded by a backlog replay.
/// Dropping the handle unsubscribes; the bus prunes the mailbox on the
/// next append.
pub struct Subscription {
    replay: VecDeque<TraceRecord>,
    rx: channel::Receiver<TraceRecord>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Yields the next record: replayed backlog first, then live
    /// broadcasts, blocking up to `timeout`.
    pub fn next(&mut self, timeout: Duration) -> NextRecord {
        if let Some(record) = self.replay.pop_front() {
            return NextRecord::Record(record);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(record) => NextRecord::Record(record),
            Err(channel::RecvTimeoutError::Timeout) => NextRecord::TimedOut,
            Err(channel::RecvTimeoutError::Disconnected) => NextRecord::Closed,
        }
    }

    /// Records this subscriber lost to a full mailbox.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::TraceSource;

    fn record(text: &str) -> TraceRecord {
        TraceRecord::new(text.to_string(), 0, TraceSource::Device)
    }

    fn drain(sub: &mut Subscription) -> Vec<TraceRecord> {
        let mut out = vec![];
        loop {
            match sub.next(Duration::from_millis(10)) {
                NextRecord::Record(r) => out.push(r),
                NextRecord::TimedOut | NextRecord::Closed => return out,
            }
        }
    }

    #[test]
    fn replay_observes_gap_free_increasing_sequences() {
        let bus = TraceBus::new();
        for i in 0..16 {
            bus.append(record(&format!("line {}", i))).unwrap();
        }
        let mut sub = bus.subscribe(StartFrom::ReplayAll);
        let records = drain(&mut sub);
        assert_eq!(records.len(), 16);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.sequence, i as u64);
        }
    }

    #[test]
    fn live_subscriber_sees_only_later_records() {
        let bus = TraceBus::new();
        bus.append(record("before")).unwrap();
        let mut sub = bus.subscribe(StartFrom::Live);
        bus.append(record("after")).unwrap();
        let records = drain(&mut sub);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "after");
        assert_eq!(records[0].sequence, 1);
    }

    #[test]
    fn backlog_overflow_evicts_oldest() {
        let bus = TraceBus::with_capacity(4, 64);
        for i in 0..6 {
            bus.append(record(&format!("{}", i))).unwrap();
        }
        assert_eq!(bus.dropped_total(), 2);
        let mut sub = bus.subscribe(StartFrom::ReplayAll);
        let texts: Vec<_> = drain(&mut sub).into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["2", "3", "4", "5"]);
    }

    #[test]
    fn clear_backlog_keeps_materialized_cursors() {
        let bus = TraceBus::new();
        bus.append(record("kept")).unwrap();
        let mut sub = bus.subscribe(StartFrom::ReplayAll);
        bus.clear_backlog();
        assert_eq!(bus.backlog_len(), 0);
        let records = drain(&mut sub);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text, "kept");
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let bus = TraceBus::new();
        let mut sub = bus.subscribe(StartFrom::Live);
        bus.append(record("last")).unwrap();
        bus.close();
        assert!(bus.append(record("late")).is_err());
        match sub.next(Duration::from_millis(10)) {
            NextRecord::Record(r) => assert_eq!(r.text, "last"),
            other => panic!("expected buffered record, got {:?}", other),
        }
        assert!(matches!(
            sub.next(Duration::from_millis(10)),
            NextRecord::Closed
        ));
    }

    #[test]
    fn subscribe_after_close_replays_then_closes() {
        let bus = TraceBus::new();
        bus.append(record("old")).unwrap();
        bus.close();
        let mut sub = bus.subscribe(StartFrom::ReplayAll);
        match sub.next(Duration::from_millis(10)) {
            NextRecord::Record(r) => assert_eq!(r.text, "old"),
            other => panic!("expected replayed record, got {:?}", other),
        }
        assert!(matches!(
            sub.next(Duration::from_millis(10)),
            NextRecord::Closed
        ));
    }

    #[test]
    fn full_mailbox_drops_for_that_subscriber_only() {
        let bus = TraceBus::with_capacity(64, 2);
        let mut starved = bus.subscribe(StartFrom::Live);
        for i in 0..5 {
            bus.append(record(&format!("{}", i))).unwrap();
        }
        // Two buffered, three dropped; a fresh replay still sees all.
        assert_eq!(drain(&mut starved).len(), 2);
        assert_eq!(starved.dropped(), 3);
        let mut fresh = bus.subscribe(StartFrom::ReplayAll);
        assert_eq!(drain(&mut fresh).len(), 5);
        assert_eq!(fresh.dropped(), 0);
    }
}
