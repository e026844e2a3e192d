//! Externally visible pipeline state.
//!
//! `ObservationStore` has exactly one writer (the pipeline loop) and many
//! readers (control surface handlers). The frame/violation pair and the
//! operator log each sit behind their own mutex; no method holds one while
//! acquiring the other. Counters and status flags are atomics.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

pub const DEFAULT_LOG_CAPACITY: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    System,
    Error,
    Notification,
    Config,
}

impl LogLevel {
    fn as_log_level(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::System | LogLevel::Notification | LogLevel::Config => log::Level::Info,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::System => "SYSTEM",
            LogLevel::Error => "ERROR",
            LogLevel::Notification => "NOTIFICATION",
            LogLevel::Config => "CONFIG",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogEntry {
    /// Local wall-clock time, `HH:MM:SS`.
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Stats {
    pub total_detections: u64,
    pub violations_detected: u64,
    pub notifications_sent: u64,
    /// Store creation time in seconds since the Unix epoch.
    pub uptime_start: f64,
    /// Seconds since `uptime_start`.
    pub uptime: f64,
    pub detection_active: bool,
    pub camera_active: bool,
    pub current_chat_id: String,
}

struct PublishedFrame {
    encoded: String,
    violation: bool,
}

pub struct ObservationStore {
    frame: Mutex<Option<PublishedFrame>>,
    logs: Mutex<VecDeque<LogEntry>>,
    log_capacity: usize,
    total_detections: AtomicU64,
    violations_detected: AtomicU64,
    notifications_sent: AtomicU64,
    detection_active: AtomicBool,
    camera_active: AtomicBool,
    destination: RwLock<String>,
    started_at: Instant,
    started_epoch_s: f64,
}

impl ObservationStore {
    pub fn new(log_capacity: usize, destination: impl Into<String>) -> Self {
        let started_epoch_s = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            frame: Mutex::new(None),
            logs: Mutex::new(VecDeque::with_capacity(log_capacity.max(1))),
            log_capacity: log_capacity.max(1),
            total_detections: AtomicU64::new(0),
            violations_detected: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            detection_active: AtomicBool::new(false),
            camera_active: AtomicBool::new(false),
            destination: RwLock::new(destination.into()),
            started_at: Instant::now(),
            started_epoch_s,
        }
    }

    /// Replace the latest frame and its violation flag in one critical section.
    pub fn publish_frame(&self, encoded: String, violation: bool) {
        let mut guard = lock(&self.frame);
        *guard = Some(PublishedFrame { encoded, violation });
    }

    /// Latest published `(encoded_frame, violation)` pair.
    pub fn frame(&self) -> Option<(String, bool)> {
        let guard = lock(&self.frame);
        guard
            .as_ref()
            .map(|published| (published.encoded.clone(), published.violation))
    }

    pub fn append_log(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
            level,
            message: message.into(),
        };
        log::log!(level.as_log_level(), "[{}] {}", entry.level, entry.message);

        let mut logs = lock(&self.logs);
        logs.push_front(entry);
        logs.truncate(self.log_capacity);
    }

    /// Snapshot of the operator log, most recent first.
    pub fn logs(&self) -> Vec<LogEntry> {
        lock(&self.logs).iter().cloned().collect()
    }

    pub fn log_capacity(&self) -> usize {
        self.log_capacity
    }

    pub fn record_detection(&self) {
        self.total_detections.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_violation(&self) {
        self.violations_detected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_notification(&self) {
        self.notifications_sent.fetch_add(1, Ordering::SeqCst);
    }

    pub fn set_detection_active(&self, active: bool) {
        self.detection_active.store(active, Ordering::SeqCst);
    }

    pub fn detection_active(&self) -> bool {
        self.detection_active.load(Ordering::SeqCst)
    }

    pub fn set_camera_active(&self, active: bool) {
        self.camera_active.store(active, Ordering::SeqCst);
    }

    pub fn camera_active(&self) -> bool {
        self.camera_active.load(Ordering::SeqCst)
    }

    /// Current alert destination (chat id).
    pub fn destination(&self) -> String {
        self.destination
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap the alert destination, returning the previous one.
    pub fn set_destination(&self, destination: impl Into<String>) -> String {
        let mut guard = self
            .destination
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, destination.into())
    }

    pub fn stats(&self) -> Stats {
        Stats {
            total_detections: self.total_detections.load(Ordering::SeqCst),
            violations_detected: self.violations_detected.load(Ordering::SeqCst),
            notifications_sent: self.notifications_sent.load(Ordering::SeqCst),
            uptime_start: self.started_epoch_s,
            uptime: self.started_at.elapsed().as_secs_f64(),
            detection_active: self.detection_active(),
            camera_active: self.camera_active(),
            current_chat_id: self.destination(),
        }
    }
}

impl Default for ObservationStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY, String::new())
    }
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
