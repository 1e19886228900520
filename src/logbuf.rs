//! Log backend: writes records to stderr and keeps them in a shared
//! buffer the debug text view reads back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{LevelFilter, Metadata, Record};

/// Shared handle on the recorded log lines. Cloned into the UI so the
/// TextView context can display them.
#[derive(Debug, Clone)]
pub struct LogHandle {
    lines: Arc<Mutex<Vec<String>>>,
    echo: Arc<AtomicBool>,
}

impl Default for LogHandle {
    fn default() -> Self {
        Self { lines: Arc::default(), echo: Arc::new(AtomicBool::new(true)) }
    }
}

impl LogHandle {
    /// Enable or disable the stderr echo. Turned off while a terminal UI
    /// owns the screen; the recorded lines stay available either way.
    pub fn set_echo(&self, on: bool) {
        self.echo.store(on, Ordering::Relaxed);
    }

    pub fn echo(&self) -> bool {
        self.echo.load(Ordering::Relaxed)
    }

    pub fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line);
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|lines| lines.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().map(|lines| lines.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct LogSink {
    handle: LogHandle,
    level: LevelFilter,
}

impl log::Log for LogSink {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("{}: {}", record.level(), record.args());
        if self.handle.echo() {
            eprintln!("[raven-bootmenu] {}", line);
        }
        self.handle.push(line);
    }

    fn flush(&self) {}
}

/// Install the recording backend and return the shared handle.
pub fn init(level: LevelFilter) -> Result<LogHandle> {
    let handle = LogHandle::default();
    log::set_boxed_logger(Box::new(LogSink { handle: handle.clone(), level }))
        .context("logger already installed")?;
    log::set_max_level(level);
    Ok(handle)
}
