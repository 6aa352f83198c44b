//! Progress reporting and cooperative cancellation.
//!
//! A [`ProgressHandler`] is owned by the caller (UI, batch tool) and shared with
//! long-running engine calls through an `Arc`. Engine code reports a percentage,
//! a free-text status and log messages; the caller may request an abort, which
//! is polled at frame boundaries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use common::SharedFn;
use parking_lot::Mutex;

/// Default number of log messages retained by a handler.
pub const DEFAULT_LOG_CAPACITY: usize = 100;

/// Snapshot passed to the progress callback.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Percentage in `0..=100`.
    pub percent: u32,
    /// Current status text.
    pub status: String,
}

pub type ProgressCallback = SharedFn<dyn Fn(ProgressUpdate) + Send + Sync>;

#[derive(Debug, Default)]
struct Journal {
    status: String,
    messages: VecDeque<String>,
}

/// Thread-safe progress and abort state.
#[derive(Debug)]
pub struct ProgressHandler {
    percent: AtomicU32,
    aborted: AtomicBool,
    journal: Mutex<Journal>,
    log_capacity: usize,
    callback: ProgressCallback,
}

impl Default for ProgressHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHandler {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_log_capacity(log_capacity: usize) -> Self {
        Self {
            percent: AtomicU32::new(0),
            aborted: AtomicBool::new(false),
            journal: Mutex::new(Journal::default()),
            log_capacity: log_capacity.max(1),
            callback: SharedFn::None,
        }
    }

    /// Attach a callback invoked on every progress or status change.
    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = callback;
        self
    }

    /// Set progress percentage. Values above 100 are clamped.
    pub fn set_progress(&self, percent: f64) {
        let clamped = if percent.is_finite() {
            percent.clamp(0.0, 100.0).round() as u32
        } else {
            0
        };
        self.percent.store(clamped, Ordering::Relaxed);
        self.notify();
    }

    pub fn progress(&self) -> u32 {
        self.percent.load(Ordering::Relaxed)
    }

    pub fn set_status(&self, status: impl Into<String>) {
        self.journal.lock().status = status.into();
        self.notify();
    }

    pub fn status(&self) -> String {
        self.journal.lock().status.clone()
    }

    /// Append a message to the bounded log, dropping the oldest when full.
    pub fn log(&self, message: impl Into<String>) {
        let mut journal = self.journal.lock();
        if journal.messages.len() == self.log_capacity {
            journal.messages.pop_front();
        }
        journal.messages.push_back(message.into());
    }

    /// Messages currently retained, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.journal.lock().messages.iter().cloned().collect()
    }

    /// Request cancellation of any in-flight operation observing this handler.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Clear the abort flag, progress and status. The log is kept.
    pub fn reset(&self) {
        self.aborted.store(false, Ordering::SeqCst);
        self.percent.store(0, Ordering::Relaxed);
        self.journal.lock().status.clear();
    }

    fn notify(&self) {
        if let Some(f) = self.callback.as_ref() {
            f(ProgressUpdate {
                percent: self.progress(),
                status: self.status(),
            });
        }
    }
}

/// Returns `Err(Error::Cancelled)` if the optional handler has been aborted.
pub(crate) fn check_abort(handler: Option<&ProgressHandler>) -> crate::Result<()> {
    match handler {
        Some(h) if h.is_aborted() => Err(crate::Error::Cancelled),
        _ => Ok(()),
    }
}
