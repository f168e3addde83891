//! Process runner: spawns a command in its own process group, frames
//! stdout and stderr into one trace bus, and tears the whole tree down
//! on timeout, rejection, cancellation or completion.
use crate::bus::TraceBus;
use crate::diag;
use crate::event::{EventMap, EventTag, PatternRef};
use crate::framer::LineFramer;
use crate::record::TraceSource;
use crate::wait::{ResponseFormat, TerminatedBy, WaitError, WaitOptions, WaitOutcome, Waiter};

use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("refusing to spawn an empty command line")]
    EmptyCommandLine,
    #[error("failed to spawn {argv0}: {source}")]
    Spawn {
        argv0: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to capture child {0}")]
    Pipe(&'static str),
}

impl diag::DiagnosableError for ProcessError {
    fn diagnose(&self) -> Vec<String> {
        match self {
            ProcessError::Spawn { .. } => {
                vec!["the command must be an executable resolvable from PATH".to_string()]
            }
            _ => vec![],
        }
    }
}

fn default_grace_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub argv: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Delay between graceful termination and forced kill of the
    /// process group.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Delay between a successful wait and teardown, for children that
    /// must not be interrupted mid-transaction.
    #[serde(default)]
    pub cmd_recovery_time_ms: u64,
}

impl ProcessConfig {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
            grace_ms: default_grace_ms(),
            cmd_recovery_time_ms: 0,
        }
    }

    /// Runs `cmd` through `sh -c`, so multi-line command strings work.
    pub fn shell(cmd: &str) -> Self {
        Self::new(["/bin/sh", "-c", cmd])
    }
}

/// Publishes the child's exit code to waiters exactly once.
#[derive(Clone, Default)]
pub(crate) struct ExitWatch(Arc<(Mutex<Option<i32>>, Condvar)>);

impl ExitWatch {
    fn publish(&self, code: i32) {
        let (lock, cvar) = &*self.0;
        *lock.lock().unwrap() = Some(code);
        cvar.notify_all();
    }

    pub(crate) fn get(&self) -> Option<i32> {
        let (lock, _) = &*self.0;
        *lock.lock().unwrap()
    }

    fn wait_timeout(&self, timeout: Duration) -> Option<i32> {
        let (lock, cvar) = &*self.0;
        let guard = lock.lock().unwrap();
        if guard.is_some() {
            return *guard;
        }
        let (guard, _) = cvar.wait_timeout(guard, timeout).unwrap();
        *guard
    }
}

fn spawn_pump<R>(mut reader: R, mut framer: LineFramer, bus: Arc<TraceBus>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for record in framer.push(&buf[..n]) {
                        if bus.append(record).is_err() {
                            return;
                        }
                    }
                }
            }
        }
        if let Some(record) = framer.finish() {
            let _ = bus.append(record);
        }
    })
}

/// One spawned command and its trace bus. Dropping the controller
/// terminates the process tree.
pub struct ProcessController {
    bus: Arc<TraceBus>,
    events: EventMap,
    pgid: Pid,
    exit: ExitWatch,
    supervisor: Option<thread::JoinHandle<()>>,
    grace: Duration,
    recovery: Duration,
    terminated: bool,
}

impl ProcessController {
    /// Spawns the command as the leader of a fresh session/process
    /// group with stdout and stderr piped into framers sharing one bus.
    pub fn spawn(config: ProcessConfig) -> Result<Self, ProcessError> {
        let argv0 = config
            .argv
            .first()
            .cloned()
            .ok_or(ProcessError::EmptyCommandLine)?;
        let mut command = Command::new(&argv0);
        command.args(&config.argv[1..]);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        command.envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Descendants must be terminable as a unit: the child leads its
        // own session, so killpg(child_pid) reaches the whole tree.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            argv0: argv0.clone(),
            source,
        })?;
        let pgid = Pid::from_raw(child.id() as i32);
        let stdout = child.stdout.take().ok_or(ProcessError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ProcessError::Pipe("stderr"))?;

        let epoch = Instant::now();
        let bus = Arc::new(TraceBus::new());
        let out_pump = spawn_pump(stdout, LineFramer::new(TraceSource::Stdout, epoch), bus.clone());
        let err_pump = spawn_pump(stderr, LineFramer::new(TraceSource::Stderr, epoch), bus.clone());

        let exit = ExitWatch::default();
        let supervisor = {
            let bus = bus.clone();
            let exit = exit.clone();
            thread::spawn(move || {
                // Both pipes reach EOF before the reap; records framed
                // from them land on the bus before it closes.
                let _ = out_pump.join();
                let _ = err_pump.join();
                let code = match child.wait() {
                    Ok(status) => status
                        .code()
                        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
                    Err(_) => -1,
                };
                // Publish before closing: a waiter that observes the
                // closed bus must find the code.
                exit.publish(code);
                bus.close();
            })
        };

        Ok(Self {
            bus,
            events: EventMap::new(),
            pgid,
            exit,
            supervisor: Some(supervisor),
            grace: Duration::from_millis(config.grace_ms),
            recovery: Duration::from_millis(config.cmd_recovery_time_ms),
            terminated: false,
        })
    }

    pub fn bus(&self) -> Arc<TraceBus> {
        self.bus.clone()
    }

    /// Exit code of the child, once reaped. Children killed by a signal
    /// report `128 + signo`.
    pub fn exit_status(&self) -> Option<i32> {
        self.exit.get()
    }

    pub fn set_event_map<I, S>(&self, entries: I) -> Result<(), crate::event::PatternError>
    where
        I: IntoIterator<Item = (EventTag, S)>,
        S: AsRef<str>,
    {
        self.events.set(entries)
    }

    /// Blocks until the wait terminates, then tears the process tree
    /// down (delayed by `cmd_recovery_time_ms` after an acceptance).
    pub fn wait(
        &mut self,
        required: &[PatternRef],
        avoided: &[PatternRef],
        opts: WaitOptions,
    ) -> Result<WaitOutcome, WaitError> {
        let snapshot = self.events.snapshot();
        let waiter = Waiter::new(
            &self.bus,
            &snapshot,
            required,
            avoided,
            opts,
            ResponseFormat::Raw,
        )?;
        let outcome = waiter.run(Some(&self.exit));
        if outcome.terminated_by == TerminatedBy::Accepted && !self.recovery.is_zero() {
            thread::sleep(self.recovery);
        }
        self.terminate_tree();
        Ok(outcome)
    }

    /// Graceful termination of the whole group, escalating to a forced
    /// kill after the grace period. Idempotent.
    pub fn terminate_tree(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        if self.exit.get().is_none() {
            let _ = killpg(self.pgid, Signal::SIGTERM);
            if self.exit.wait_timeout(self.grace).is_none() {
                let _ = killpg(self.pgid, Signal::SIGKILL);
            }
        }
        // Sweep group survivors still holding the pipes open, then wait
        // for the reaper.
        let _ = killpg(self.pgid, Signal::SIGKILL);
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        self.terminate_tree();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wait::CollectPolicy;

    fn refs(patterns: &[&str]) -> Vec<PatternRef> {
        patterns.iter().map(|&p| PatternRef::from(p)).collect()
    }

    fn backlog_opts() -> WaitOptions {
        // Output may land on the bus before the wait subscribes, so
        // process waits replay the backlog.
        WaitOptions {
            use_backlog: true,
            ..WaitOptions::default()
        }
    }

    #[test]
    fn collects_all_required_patterns_in_order() {
        let mut controller =
            ProcessController::spawn(ProcessConfig::shell("echo foo1\necho bar2\necho baz3"))
                .unwrap();
        let outcome = controller
            .wait(&refs(&[r"foo\d", r"bar\d", r"baz\d"]), &[], backlog_opts())
            .unwrap();

        assert!(outcome.successful);
        assert_eq!(outcome.terminated_by, TerminatedBy::Accepted);
        assert_eq!(outcome.texts(), vec!["foo1", "bar2", "baz3"]);
        assert!(outcome.required_remaining.is_empty());
    }

    #[test]
    fn last_only_keeps_the_final_match() {
        let mut controller =
            ProcessController::spawn(ProcessConfig::shell("echo foo1\necho bar2\necho baz3"))
                .unwrap();
        let outcome = controller
            .wait(
                &refs(&[r"foo\d", r"bar\d", r"baz\d"]),
                &[],
                WaitOptions {
                    collect: CollectPolicy::LastOnly,
                    ..backlog_opts()
                },
            )
            .unwrap();

        assert!(outcome.successful);
        assert_eq!(outcome.texts(), vec!["baz3"]);
    }

    #[test]
    fn first_match_leaves_the_backlog_for_later_waits() {
        let mut config = ProcessConfig::shell("echo foo1\necho bar2\necho baz3");
        // Let the child finish echoing before teardown, so the rest of
        // its output reaches the backlog.
        config.cmd_recovery_time_ms = 200;
        let mut controller = ProcessController::spawn(config).unwrap();
        let first = controller
            .wait(
                &refs(&[r"foo"]),
                &[],
                WaitOptions {
                    return_on_first_match: true,
                    ..backlog_opts()
                },
            )
            .unwrap();
        assert_eq!(first.texts(), vec!["foo1"]);

        // No command is re-issued; the backlog already holds the rest.
        let second = controller
            .wait(&refs(&[r"bar\d"]), &[], backlog_opts())
            .unwrap();
        assert!(second.successful);
        assert_eq!(second.texts(), vec!["bar2"]);
    }

    #[test]
    fn avoided_pattern_rejects_well_before_the_deadline() {
        let mut controller =
            ProcessController::spawn(ProcessConfig::shell("echo Unknown host")).unwrap();
        let start = Instant::now();
        let outcome = controller
            .wait(
                &refs(&[r"\d+ bytes from"]),
                &refs(&[r"Unknown host", r"Request timeout"]),
                WaitOptions {
                    timeout_ms: 60_000,
                    ..backlog_opts()
                },
            )
            .unwrap();

        assert!(!outcome.successful);
        assert_eq!(
            outcome.terminated_by,
            TerminatedBy::Rejected {
                pattern: "Unknown host".to_string()
            }
        );
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn timeout_kills_the_process_tree() {
        let mut controller = ProcessController::spawn(ProcessConfig::shell("sleep 1000")).unwrap();
        let start = Instant::now();
        let outcome = controller
            .wait(
                &[],
                &[],
                WaitOptions {
                    timeout_ms: 300,
                    run_to_completion: true,
                    ..backlog_opts()
                },
            )
            .unwrap();
        let elapsed = start.elapsed();

        assert!(!outcome.successful);
        assert_eq!(outcome.terminated_by, TerminatedBy::Timeout);
        assert!(elapsed >= Duration::from_millis(300));
        // Deadline plus grace, not the sleep duration.
        assert!(elapsed < Duration::from_secs(5));
        // The tree is gone and reaped.
        assert!(controller.exit_status().is_some());
    }

    #[test]
    fn run_to_completion_reports_the_exit_code() {
        let mut ok = ProcessController::spawn(ProcessConfig::shell("exit 0")).unwrap();
        let outcome = ok
            .wait(
                &[],
                &[],
                WaitOptions {
                    run_to_completion: true,
                    ..backlog_opts()
                },
            )
            .unwrap();
        assert!(outcome.successful);
        assert_eq!(outcome.terminated_by, TerminatedBy::ProcessExited { code: 0 });

        let mut failing = ProcessController::spawn(ProcessConfig::shell("exit 3")).unwrap();
        let outcome = failing
            .wait(
                &[],
                &[],
                WaitOptions {
                    run_to_completion: true,
                    ..backlog_opts()
                },
            )
            .unwrap();
        assert!(!outcome.successful);
        assert_eq!(outcome.terminated_by, TerminatedBy::ProcessExited { code: 3 });
    }

    #[test]
    fn child_exit_with_unsatisfied_patterns_is_not_success() {
        let mut controller = ProcessController::spawn(ProcessConfig::shell("echo done")).unwrap();
        let outcome = controller
            .wait(&refs(&[r"never matches"]), &[], backlog_opts())
            .unwrap();

        assert!(!outcome.successful);
        assert!(matches!(
            outcome.terminated_by,
            TerminatedBy::ProcessExited { code: 0 }
        ));
        assert_eq!(outcome.required_remaining, vec!["never matches"]);
    }

    #[test]
    fn named_captures_are_extracted_from_child_output() {
        let mut controller =
            ProcessController::spawn(ProcessConfig::shell("echo VERSION:1.2.3")).unwrap();
        let outcome = controller
            .wait(
                &refs(&[r"VERSION:\s*v?(?P<major>\d+)\.(?P<minor>\d+)\.(?P<patch>\d+)"]),
                &[],
                WaitOptions {
                    response_format: Some(ResponseFormat::Processed),
                    ..backlog_opts()
                },
            )
            .unwrap();

        assert!(outcome.successful);
        let m = outcome.results[0].as_match().unwrap();
        assert_eq!(m.record.text, "VERSION:1.2.3");
        assert_eq!(m.named_captures["major"], "1");
        assert_eq!(m.named_captures["minor"], "2");
        assert_eq!(m.named_captures["patch"], "3");
    }

    #[test]
    fn stderr_records_carry_their_source_tag() {
        let mut controller =
            ProcessController::spawn(ProcessConfig::shell("echo oops 1>&2")).unwrap();
        let outcome = controller
            .wait(&refs(&[r"oops"]), &[], backlog_opts())
            .unwrap();

        assert!(outcome.successful);
        assert_eq!(outcome.results[0].record().source, TraceSource::Stderr);
    }

    #[test]
    fn spawn_failures_surface_immediately() {
        let err = ProcessController::spawn(ProcessConfig::new(["/definitely/not/a/binary"]))
            .err()
            .unwrap();
        assert!(matches!(err, ProcessError::Spawn { .. }));

        let err = ProcessController::spawn(ProcessConfig::new(Vec::<String>::new()))
            .err()
            .unwrap();
        assert!(matches!(err, ProcessError::EmptyCommandLine));
    }

    #[test]
    fn terminate_tree_is_idempotent() {
        let mut controller = ProcessController::spawn(ProcessConfig::shell("sleep 1000")).unwrap();
        controller.terminate_tree();
        controller.terminate_tree();
        assert!(controller.exit_status().is_some());
    }
}
