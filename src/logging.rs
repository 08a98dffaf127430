//! Build loggers.
//!
//! [`ConsoleLogger`] writes colored, labelled lines and serializes output so
//! escape sequences and content never interleave across threads.
//! [`BufferedLogger`] wraps any delegate and, while recording, keeps one
//! ordered event buffer per calling worker; `play` flushes the current
//! worker's buffer contiguously to the delegate.

use std::{
    collections::HashMap,
    fmt,
    io::Write,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    thread::{self, ThreadId},
};
use yansi::Paint;

/// Severity, ordered `Debug < Info < Warn < Error`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub const ALL: [Level; 4] = [Level::Debug, Level::Info, Level::Warn, Level::Error];

    pub fn label(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Level {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Level::ALL.into_iter().find(|level| level.label() == s).ok_or(())
    }
}

/// Label used for the distinguished success style, logged at info level.
const SUCCESS_LABEL: &str = "success";

/// One replayable logging event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEvent {
    Log(Level, String),
    Success(String),
    Trace(String),
    SetLevel(Level),
    SetTrace(bool),
}

/// The interface every component logs through.
pub trait Log: Send + Sync {
    fn get_level(&self) -> Level;
    fn set_level(&self, level: Level);
    fn enable_trace(&self, flag: bool);
    fn trace_enabled(&self) -> bool;

    fn log(&self, level: Level, message: &str);
    /// Logs the full rendering of an error; emitted only when trace is enabled.
    fn trace_err(&self, error: &dyn fmt::Display);
    /// Info-level message with the success label.
    fn success(&self, message: &str);

    /// Whether messages at `level` would currently be emitted.
    fn at_level(&self, level: Level) -> bool {
        level >= self.get_level()
    }

    /// Replays a recorded batch. Implementations that own an output stream
    /// hold its lock for the whole batch so the events stay contiguous.
    fn log_batch(&self, events: &[LogEvent]) {
        for event in events {
            match event {
                LogEvent::Log(level, message) => self.log(*level, message),
                LogEvent::Success(message) => self.success(message),
                LogEvent::Trace(rendered) => self.trace_err(rendered),
                LogEvent::SetLevel(level) => self.set_level(*level),
                LogEvent::SetTrace(flag) => self.enable_trace(*flag),
            }
        }
    }

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message)
    }
    fn info(&self, message: &str) {
        self.log(Level::Info, message)
    }
    fn warn(&self, message: &str) {
        self.log(Level::Warn, message)
    }
    fn error(&self, message: &str) {
        self.log(Level::Error, message)
    }
}

struct LoggerState {
    level: Level,
    trace: bool,
}

/// Logs to standard output with colored level labels.
pub struct ConsoleLogger {
    state: Mutex<LoggerState>,
    // held across a whole line (or a whole replayed batch) of colored segments
    out: Mutex<()>,
}

impl ConsoleLogger {
    pub fn new() -> Self {
        ConsoleLogger {
            state: Mutex::new(LoggerState { level: Level::Info, trace: false }),
            out: Mutex::new(()),
        }
    }

    fn write_line(&self, styled: yansi::Paint<&str>, message: &str) {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        for line in message.lines().chain(message.is_empty().then_some("")) {
            let _ = writeln!(handle, "[{styled}] {line}");
        }
        let _ = handle.flush();
    }

    fn emit(&self, level: Level, label: &str, message: &str) {
        let styled = match level {
            Level::Debug => Paint::new(label).dimmed(),
            Level::Info => {
                if label == SUCCESS_LABEL {
                    Paint::green(label)
                } else {
                    Paint::new(label)
                }
            }
            Level::Warn => Paint::yellow(label),
            Level::Error => Paint::red(label),
        };
        self.write_line(styled, message);
    }
}

impl Default for ConsoleLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for ConsoleLogger {
    fn get_level(&self) -> Level {
        self.state.lock().unwrap().level
    }

    fn set_level(&self, level: Level) {
        self.state.lock().unwrap().level = level;
    }

    fn enable_trace(&self, flag: bool) {
        self.state.lock().unwrap().trace = flag;
    }

    fn trace_enabled(&self) -> bool {
        self.state.lock().unwrap().trace
    }

    fn log(&self, level: Level, message: &str) {
        if !self.at_level(level) {
            return;
        }
        let _guard = self.out.lock().unwrap();
        self.emit(level, level.label(), message);
    }

    fn trace_err(&self, error: &dyn fmt::Display) {
        if !self.trace_enabled() {
            return;
        }
        let _guard = self.out.lock().unwrap();
        self.emit(Level::Error, Level::Error.label(), &error.to_string());
    }

    fn success(&self, message: &str) {
        if !self.at_level(Level::Info) {
            return;
        }
        let _guard = self.out.lock().unwrap();
        self.emit(Level::Info, SUCCESS_LABEL, message);
    }

    fn log_batch(&self, events: &[LogEvent]) {
        let _guard = self.out.lock().unwrap();
        for event in events {
            match event {
                LogEvent::Log(level, message) => {
                    if self.at_level(*level) {
                        self.emit(*level, level.label(), message);
                    }
                }
                LogEvent::Success(message) => {
                    if self.at_level(Level::Info) {
                        self.emit(Level::Info, SUCCESS_LABEL, message);
                    }
                }
                LogEvent::Trace(rendered) => {
                    if self.trace_enabled() {
                        self.emit(Level::Error, Level::Error.label(), rendered);
                    }
                }
                LogEvent::SetLevel(level) => self.set_level(*level),
                LogEvent::SetTrace(flag) => self.enable_trace(*flag),
            }
        }
    }
}

/// Wraps a delegate logger with per-worker buffering.
pub struct BufferedLogger<L: Log> {
    delegate: L,
    recording: AtomicBool,
    state: Mutex<LoggerState>,
    buffers: Mutex<HashMap<ThreadId, Vec<LogEvent>>>,
}

impl<L: Log> BufferedLogger<L> {
    pub fn new(delegate: L) -> Self {
        let state =
            LoggerState { level: delegate.get_level(), trace: delegate.trace_enabled() };
        BufferedLogger {
            delegate,
            recording: AtomicBool::new(false),
            state: Mutex::new(state),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn delegate(&self) -> &L {
        &self.delegate
    }

    pub fn start_recording(&self) {
        self.recording.store(true, Ordering::SeqCst);
    }

    pub fn recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Flushes the current worker's buffer atomically to the delegate. The
    /// delegate serializes the batch, so this worker's output is contiguous.
    pub fn play(&self) {
        let events = self
            .buffers
            .lock()
            .unwrap()
            .remove(&thread::current().id())
            .unwrap_or_default();
        if !events.is_empty() {
            self.delegate.log_batch(&events);
        }
    }

    /// Discards the current worker's buffer.
    pub fn clear(&self) {
        self.buffers.lock().unwrap().remove(&thread::current().id());
    }

    /// Discards all buffers and disables recording.
    pub fn clear_all(&self) {
        self.buffers.lock().unwrap().clear();
        self.recording.store(false, Ordering::SeqCst);
    }

    fn record(&self, event: LogEvent) -> bool {
        if !self.recording() {
            return false;
        }
        self.buffers
            .lock()
            .unwrap()
            .entry(thread::current().id())
            .or_default()
            .push(event);
        true
    }
}

impl<L: Log> Log for BufferedLogger<L> {
    fn get_level(&self) -> Level {
        self.state.lock().unwrap().level
    }

    fn set_level(&self, level: Level) {
        self.state.lock().unwrap().level = level;
        if !self.record(LogEvent::SetLevel(level)) {
            self.delegate.set_level(level);
        }
    }

    fn enable_trace(&self, flag: bool) {
        self.state.lock().unwrap().trace = flag;
        if !self.record(LogEvent::SetTrace(flag)) {
            self.delegate.enable_trace(flag);
        }
    }

    fn trace_enabled(&self) -> bool {
        self.state.lock().unwrap().trace
    }

    fn log(&self, level: Level, message: &str) {
        if !self.at_level(level) {
            return;
        }
        if !self.record(LogEvent::Log(level, message.to_string())) {
            self.delegate.log(level, message);
        }
    }

    fn trace_err(&self, error: &dyn fmt::Display) {
        if !self.trace_enabled() {
            return;
        }
        if !self.record(LogEvent::Trace(error.to_string())) {
            self.delegate.trace_err(error);
        }
    }

    fn success(&self, message: &str) {
        if !self.at_level(Level::Info) {
            return;
        }
        if !self.record(LogEvent::Success(message.to_string())) {
            self.delegate.success(message);
        }
    }
}

/// A delegate that keeps everything in memory; used by tests and by the
/// scripted-test interpreter to inspect replayed output.
#[derive(Default)]
pub struct RecordedLogger {
    state: Mutex<LoggerState>,
    pub events: Mutex<Vec<LogEvent>>,
}

impl RecordedLogger {
    pub fn new() -> Self {
        RecordedLogger {
            state: Mutex::new(LoggerState { level: Level::Debug, trace: false }),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<LogEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl Default for LoggerState {
    fn default() -> Self {
        LoggerState { level: Level::Debug, trace: false }
    }
}

impl Log for RecordedLogger {
    fn get_level(&self) -> Level {
        self.state.lock().unwrap().level
    }
    fn set_level(&self, level: Level) {
        self.state.lock().unwrap().level = level;
    }
    fn enable_trace(&self, flag: bool) {
        self.state.lock().unwrap().trace = flag;
    }
    fn trace_enabled(&self) -> bool {
        self.state.lock().unwrap().trace
    }
    fn log(&self, level: Level, message: &str) {
        self.events.lock().unwrap().push(LogEvent::Log(level, message.to_string()));
    }
    fn trace_err(&self, error: &dyn fmt::Display) {
        self.events.lock().unwrap().push(LogEvent::Trace(error.to_string()));
    }
    fn success(&self, message: &str) {
        self.events.lock().unwrap().push(LogEvent::Success(message.to_string()));
    }
    fn log_batch(&self, events: &[LogEvent]) {
        self.events.lock().unwrap().extend(events.iter().cloned());
    }
}
