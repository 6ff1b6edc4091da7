//! Push-style log event stream for the Mihomo family.
//!
//! The hub publishes [`LogEvent`]s on a [`LogBus`]; a [`LogForwarder`] drains
//! one subscription into the configured log file.

use serde::Serialize;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Silent,
}

impl LogLevel {
    pub fn parse(input: &str) -> Self {
        match input.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warning,
            "error" | "fatal" | "panic" => LogLevel::Error,
            "silent" => LogLevel::Silent,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Silent => "silent",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub payload: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, payload: impl Into<String>) -> Self {
        Self {
            level,
            payload: payload.into(),
        }
    }

    /// Parse one line of engine output in `key=value` form, e.g.
    /// `time="..." level=info msg="Start initial configuration"`.
    ///
    /// Lines without a `msg` field are kept verbatim at info level.
    pub fn parse_line(line: &str) -> Self {
        let level = field(line, "level").map_or(LogLevel::Info, |l| LogLevel::parse(&l));
        match field(line, "msg") {
            Some(msg) => Self::new(level, msg),
            None => Self::new(level, line.trim()),
        }
    }
}

/// Extract `key=value` or `key="quoted \"value\""` from a logfmt line.
fn field(line: &str, key: &str) -> Option<String> {
    let needle = format!("{key}=");
    let mut offset = 0;
    let rest = loop {
        let pos = offset + line[offset..].find(&needle)?;
        offset = pos + needle.len();
        if pos == 0 || line[..pos].ends_with(' ') {
            break &line[offset..];
        }
    };

    if let Some(quoted) = rest.strip_prefix('"') {
        let mut value = String::new();
        let mut chars = quoted.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                }
                '"' => return Some(value),
                other => value.push(other),
            }
        }
        Some(value)
    } else {
        Some(rest.split_whitespace().next().unwrap_or_default().to_owned())
    }
}

/// A live subscription to a [`LogBus`]. The event stream ends once the
/// subscription is removed from the bus.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    events: Receiver<LogEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn events(&self) -> &Receiver<LogEvent> {
        &self.events
    }
}

#[derive(Debug, Default)]
pub struct LogBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Sender<LogEvent>)>>,
}

impl LogBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, events) = mpsc::channel();
        self.lock().push((id, tx));
        debug!("log subscription {id} opened");
        Subscription { id, events }
    }

    /// Returns `false` when `id` was not subscribed.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        let removed = subscribers.len() != before;
        if removed {
            debug!("log subscription {id} closed");
        }
        removed
    }

    pub fn publish(&self, event: &LogEvent) {
        self.lock()
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Sender<LogEvent>)>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Drains one subscription into an append-only log file on its own thread.
#[derive(Debug)]
pub struct LogForwarder {
    subscription_id: u64,
    path: PathBuf,
    handle: JoinHandle<()>,
}

impl LogForwarder {
    /// Open `path` for appending and start forwarding `subscription` into it.
    pub fn spawn(subscription: Subscription, path: &Path) -> Result<Self, std::io::Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "[{}] Mihomo log forwarding started", timestamp())?;

        let subscription_id = subscription.id();
        let target = path.display().to_string();
        let handle = thread::Builder::new()
            .name("corehub-logfwd".to_owned())
            .spawn(move || forward(&subscription, &mut file, &target))?;

        debug!("forwarding engine logs to {}", path.display());
        Ok(Self {
            subscription_id,
            path: path.to_path_buf(),
            handle,
        })
    }

    pub fn subscription_id(&self) -> u64 {
        self.subscription_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the forwarding thread. The caller must have closed the
    /// subscription first, otherwise this blocks until it is.
    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("log forwarder for {} panicked", self.path.display());
        }
    }
}

fn forward(subscription: &Subscription, file: &mut File, target: &str) {
    for event in subscription.events() {
        let line = format!("[{}] [{}] {}\n", timestamp(), event.level, event.payload);
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
            warn!("failed to write engine log to {target}: {e}");
        }
    }
}
