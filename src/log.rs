//! Stderr reporting for the process-runner CLI: a right-aligned colored
//! gutter header per line, plus per-record output for satisfied
//! matches.
use std::io::{stderr, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use colored::{Color, Colorize};
use crossterm::{
    cursor, queue,
    terminal::{Clear, ClearType},
};

use crate::record::TraceRecord;

/// Width of the header gutter. Padding happens before colorization so
/// escape codes do not skew the alignment.
const GUTTER: usize = 10;

static QUIET: AtomicBool = AtomicBool::new(false);

/// Silences everything below [`err`].
pub fn set_quiet(quiet: bool) {
    QUIET.store(quiet, Ordering::Relaxed);
}

fn quiet() -> bool {
    QUIET.load(Ordering::Relaxed)
}

fn emit(header: &str, color: Color, msg: &str) {
    let mut out = stderr();
    // Reset the line first; live trace output may have left a partial
    // line on screen.
    let _ = queue!(out, Clear(ClearType::CurrentLine), cursor::MoveToColumn(0));
    let header = format!("{:>width$}", header, width = GUTTER);
    let _ = writeln!(out, "{} {}", header.as_str().color(color).bold(), msg);
    let _ = out.flush();
}

/// Reports a record that satisfied a pattern, labeled with the stream
/// it was framed from.
pub fn matched(record: &TraceRecord) {
    if !quiet() {
        emit(&record.source.to_string(), Color::Cyan, &record.text);
    }
}

pub fn status(header: &str, msg: &str) {
    if !quiet() {
        emit(header, Color::Green, msg);
    }
}

pub fn warn(msg: &str) {
    if !quiet() {
        emit("Warning", Color::Yellow, msg);
    }
}

pub fn err(msg: &str) {
    emit("Error", Color::Red, msg);
}

pub fn hint(msg: &str) {
    if !quiet() {
        emit("Hint", Color::Blue, msg);
    }
}
