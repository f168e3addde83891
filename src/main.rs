//! Process-runner CLI: run a command, wait until its output satisfies
//! every required pattern, an avoided pattern matches, or the deadline
//! expires; report the outcome through the exit code.
use std::time::{Duration, Instant};

use anyhow::Context;
use structopt::StructOpt;

use tracewait::log;
use tracewait::{
    CancelToken, PatternRef, ProcessConfig, ProcessController, TerminatedBy, TracewaitError,
    WaitError, WaitOptions, WaitOutcome,
};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "tracewait",
    about = "Run a command and wait for pattern-based accept/reject conditions on its output."
)]
struct Opts {
    /// Command to run (passed to `sh -c`, so shell syntax and
    /// multi-line scripts work).
    #[structopt(short = "c", long = "cmd")]
    cmd: String,

    /// Comma-separated patterns that must all match for success.
    #[structopt(short = "r", long = "required", use_delimiter = true)]
    required: Vec<String>,

    /// Comma-separated patterns that immediately fail the wait.
    #[structopt(short = "a", long = "avoid", use_delimiter = true)]
    avoided: Vec<String>,

    /// Wait deadline in milliseconds; 0 disables the timeout.
    #[structopt(short = "t", long = "timeout-ms", default_value = "10000")]
    timeout_ms: u64,

    /// Terminate on the first satisfied required pattern.
    #[structopt(short = "f", long = "first-match")]
    first_match: bool,

    /// Wait for the command to exit; success then also requires exit
    /// code 0.
    #[structopt(long = "run-to-completion")]
    run_to_completion: bool,

    /// Report every match instead of only the most recent one.
    #[structopt(long = "accumulate")]
    accumulate: bool,

    /// Suppress status output; the exit code alone reports the outcome.
    #[structopt(long = "quiet")]
    quiet: bool,

    /// Grace period in milliseconds between graceful termination and
    /// forced kill of the process tree.
    #[structopt(long = "grace-ms", default_value = "250")]
    grace_ms: u64,
}

fn main() {
    let opts = Opts::from_args();
    log::set_quiet(opts.quiet);
    let code = match run(&opts) {
        Ok(outcome) => outcome_code(&outcome),
        Err(e) => {
            e.render();
            error_code(&e)
        }
    };
    std::process::exit(code);
}

fn run(opts: &Opts) -> Result<WaitOutcome, TracewaitError> {
    let required: Vec<PatternRef> = opts
        .required
        .iter()
        .map(|p| PatternRef::Raw(p.clone()))
        .collect();
    let avoided: Vec<PatternRef> = opts
        .avoided
        .iter()
        .map(|p| PatternRef::Raw(p.clone()))
        .collect();

    if required.is_empty() && !opts.run_to_completion {
        log::warn("no required patterns and no --run-to-completion: nothing to wait for");
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())
            .context("Failed to install SIGINT handler")?;
    }

    let mut config = ProcessConfig::shell(&opts.cmd);
    config.grace_ms = opts.grace_ms;

    log::status("Running", &format!("`{}`...", opts.cmd));
    let instant = Instant::now();
    let mut controller = ProcessController::spawn(config)?;
    let outcome = controller.wait(
        &required,
        &avoided,
        WaitOptions {
            timeout_ms: opts.timeout_ms,
            return_on_first_match: opts.first_match,
            run_to_completion: opts.run_to_completion,
            accumulate: opts.accumulate,
            use_backlog: true,
            cancel,
            ..WaitOptions::default()
        },
    )?;
    let dropped = controller.bus().dropped_total();
    if dropped > 0 {
        log::warn(&format!(
            "{} trace record(s) were evicted from the backlog; matches may be incomplete",
            dropped
        ));
    }
    report(&outcome, instant.elapsed());
    Ok(outcome)
}

fn report(outcome: &WaitOutcome, duration: Duration) {
    for item in &outcome.results {
        log::matched(item.record());
    }
    let summary = format!(
        "{} in {} ({} pattern(s) unsatisfied).",
        describe_termination(&outcome.terminated_by),
        format_duration(&duration),
        outcome.required_remaining.len(),
    );
    if outcome.successful {
        log::status("Finished", &summary);
    } else {
        log::warn(&summary);
    }
}

fn describe_termination(terminated_by: &TerminatedBy) -> String {
    match terminated_by {
        TerminatedBy::Accepted => "all required patterns satisfied".to_string(),
        TerminatedBy::Rejected { pattern } => format!("avoided pattern /{}/ matched", pattern),
        TerminatedBy::Timeout => "deadline exceeded".to_string(),
        TerminatedBy::Cancelled { overflow: true } => "trace mailbox overflowed".to_string(),
        TerminatedBy::Cancelled { overflow: false } => "cancelled".to_string(),
        TerminatedBy::TransportClosed => "output ended before the wait completed".to_string(),
        TerminatedBy::ProcessExited { code } => format!("process exited with code {}", code),
    }
}

fn format_duration(duration: &Duration) -> String {
    match duration.as_secs() {
        secs if secs >= 60 => format!("{}min {}s", secs / 60, secs % 60),
        secs if secs >= 1 => format!("{:.1}s", duration.as_secs_f32()),
        _ => format!("{}ms", duration.as_millis()),
    }
}

fn outcome_code(outcome: &WaitOutcome) -> i32 {
    match &outcome.terminated_by {
        TerminatedBy::Accepted => 0,
        TerminatedBy::ProcessExited { .. } if outcome.successful => 0,
        TerminatedBy::ProcessExited { .. } | TerminatedBy::TransportClosed => 1,
        TerminatedBy::Rejected { .. } => 2,
        TerminatedBy::Timeout => 3,
        TerminatedBy::Cancelled { .. } => 4,
    }
}

fn error_code(error: &TracewaitError) -> i32 {
    match error {
        TracewaitError::PatternError(_) | TracewaitError::WaitError(WaitError::Pattern(_)) => 5,
        _ => 4,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn outcomes_map_to_documented_exit_codes() {
        let outcome = |terminated_by, successful| WaitOutcome {
            successful,
            results: vec![],
            required_remaining: vec![],
            terminated_by,
        };

        assert_eq!(outcome_code(&outcome(TerminatedBy::Accepted, true)), 0);
        assert_eq!(
            outcome_code(&outcome(TerminatedBy::ProcessExited { code: 0 }, true)),
            0
        );
        assert_eq!(
            outcome_code(&outcome(TerminatedBy::ProcessExited { code: 3 }, false)),
            1
        );
        assert_eq!(
            outcome_code(&outcome(TerminatedBy::TransportClosed, false)),
            1
        );
        assert_eq!(
            outcome_code(&outcome(
                TerminatedBy::Rejected {
                    pattern: "x".to_string()
                },
                false
            )),
            2
        );
        assert_eq!(outcome_code(&outcome(TerminatedBy::Timeout, false)), 3);
        assert_eq!(
            outcome_code(&outcome(TerminatedBy::Cancelled { overflow: true }, false)),
            4
        );
    }

    #[test]
    fn configuration_errors_exit_with_code_five() {
        let err = TracewaitError::from(
            tracewait::CompiledPattern::new("(unclosed").err().unwrap(),
        );
        assert_eq!(error_code(&err), 5);
    }
}
