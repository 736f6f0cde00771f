//! Substring-triggered log watching.
//!
//! The ingest server only reports its lifecycle in its log output. A
//! `LogEventWatcher` maps marker substrings to callbacks; a callback that
//! returns `Disposition::Done` is removed after it fires.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Unregister this marker.
    Done,
    Keep,
}

type Handler = Box<dyn FnMut(&str) -> Disposition + Send>;

/// Marker → callback registry. Callbacks run in registration order and
/// must not call back into the watcher.
#[derive(Default)]
pub struct LogEventWatcher {
    handlers: Mutex<Vec<(String, Handler)>>,
}

impl LogEventWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `marker`, replacing any existing one.
    pub fn register<F>(&self, marker: impl Into<String>, handler: F)
    where
        F: FnMut(&str) -> Disposition + Send + 'static,
    {
        let marker = marker.into();
        let mut handlers = self.handlers.lock();
        match handlers.iter_mut().find(|(m, _)| *m == marker) {
            Some(slot) => slot.1 = Box::new(handler),
            None => handlers.push((marker, Box::new(handler))),
        }
    }

    pub fn unregister(&self, marker: &str) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(m, _)| m != marker);
        handlers.len() != before
    }

    /// Run every callback whose marker occurs in `line`. Returns how many fired.
    pub fn dispatch(&self, line: &str) -> usize {
        let mut handlers = self.handlers.lock();
        let mut fired = 0;
        handlers.retain_mut(|(marker, handler)| {
            if !line.contains(marker.as_str()) {
                return true;
            }
            fired += 1;
            handler(line) == Disposition::Keep
        });
        fired
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn markers(&self) -> Vec<String> {
        self.handlers.lock().iter().map(|(m, _)| m.clone()).collect()
    }
}

// ── Ingest events ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestEvent {
    /// The RTMP listener is up on this port.
    PortBound(String),
    /// An encoder started publishing.
    PublishStarted,
    /// A publishing session ended.
    Terminated,
}

#[async_trait]
pub trait IngestEventSource: Send {
    /// Next lifecycle event. `None` once the source is exhausted.
    async fn next_event(&mut self) -> Option<IngestEvent>;
}

pub const RTMP_LISTENING_MARKER: &str = "[RTMP] listener opened on :";
pub const PUBLISHING_MARKER: &str = "is publishing to path";
pub const TERMINATED_MARKER: &str = "destroyed: terminated";

/// Turns ingest server log lines into `IngestEvent`s.
pub struct LogScanSource {
    lines: mpsc::Receiver<String>,
    watcher: LogEventWatcher,
    pending: Arc<Mutex<VecDeque<IngestEvent>>>,
}

impl LogScanSource {
    pub fn new(lines: mpsc::Receiver<String>) -> Self {
        let watcher = LogEventWatcher::new();
        let pending: Arc<Mutex<VecDeque<IngestEvent>>> = Arc::default();

        let out = pending.clone();
        watcher.register(RTMP_LISTENING_MARKER, move |line| {
            let Some(idx) = line.find(RTMP_LISTENING_MARKER) else {
                return Disposition::Keep;
            };
            let port = line[idx + RTMP_LISTENING_MARKER.len()..].trim().to_string();
            out.lock().push_back(IngestEvent::PortBound(port));
            Disposition::Done
        });

        let out = pending.clone();
        watcher.register(PUBLISHING_MARKER, move |_| {
            out.lock().push_back(IngestEvent::PublishStarted);
            Disposition::Done
        });

        let out = pending.clone();
        watcher.register(TERMINATED_MARKER, move |_| {
            out.lock().push_back(IngestEvent::Terminated);
            Disposition::Keep
        });

        Self {
            lines,
            watcher,
            pending,
        }
    }

    pub fn watcher(&self) -> &LogEventWatcher {
        &self.watcher
    }
}

#[async_trait]
impl IngestEventSource for LogScanSource {
    async fn next_event(&mut self) -> Option<IngestEvent> {
        loop {
            let queued = self.pending.lock().pop_front();
            if queued.is_some() {
                return queued;
            }
            let line = self.lines.recv().await?;
            self.watcher.dispatch(&line);
        }
    }
}

/// Events pushed directly, for embedders that observe ingest themselves.
pub struct ChannelEventSource {
    events: mpsc::Receiver<IngestEvent>,
}

impl ChannelEventSource {
    pub fn new(events: mpsc::Receiver<IngestEvent>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl IngestEventSource for ChannelEventSource {
    async fn next_event(&mut self) -> Option<IngestEvent> {
        self.events.recv().await
    }
}
