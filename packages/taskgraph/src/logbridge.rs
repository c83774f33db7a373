//! Bridges log records from worker threads to a single sink.
//!
//! Workers never touch the sink directly: they enqueue plain-data records
//! (origin thread name, level, target, pre-formatted message) onto a
//! channel, and one drain thread in the graph redispatches each record.
//! Records are born serializable — no live arguments or backtraces cross
//! the channel — and the origin name travels with each record so the
//! producing worker remains observable at the sink.

use std::{sync::Arc, thread::JoinHandle};

use tracing::Level;

/// A log record emitted by a task body, as forwarded to the sink.
#[derive(Clone, Debug)]
pub struct LogRecord {
    /// Name of the worker thread that produced the record.
    pub origin: String,
    pub level: Level,
    /// Logical subsystem name, in the style of a `tracing` target.
    pub target: String,
    pub message: String,
}

/// Receives every bridged record, in emission order.
pub type LogSink = Arc<dyn Fn(&LogRecord) + Send + Sync>;

/// Default sink: re-emit through `tracing` with the origin attached.
pub(crate) fn tracing_sink() -> LogSink {
    Arc::new(|record| {
        let LogRecord {
            origin,
            level,
            target,
            message,
        } = record;
        match *level {
            Level::ERROR => tracing::error!(%origin, %target, "{message}"),
            Level::WARN => tracing::warn!(%origin, %target, "{message}"),
            Level::INFO => tracing::info!(%origin, %target, "{message}"),
            Level::DEBUG => tracing::debug!(%origin, %target, "{message}"),
            Level::TRACE => tracing::trace!(%origin, %target, "{message}"),
        }
    })
}

enum Msg {
    Record(LogRecord),
    Shutdown,
}

/// Cloneable producer handed to task contexts.
#[derive(Clone)]
pub struct LogHandle {
    tx: flume::Sender<Msg>,
}

impl LogHandle {
    pub fn log(&self, level: Level, target: impl Into<String>, message: impl Into<String>) {
        let record = LogRecord {
            origin: std::thread::current()
                .name()
                .unwrap_or("unnamed")
                .to_owned(),
            level,
            target: target.into(),
            message: message.into(),
        };
        // A send can only fail during teardown, when the sink is gone.
        let _ = self.tx.send(Msg::Record(record));
    }

    pub fn info(&self, target: impl Into<String>, message: impl Into<String>) {
        self.log(Level::INFO, target, message);
    }

    pub fn debug(&self, target: impl Into<String>, message: impl Into<String>) {
        self.log(Level::DEBUG, target, message);
    }

    pub fn warn(&self, target: impl Into<String>, message: impl Into<String>) {
        self.log(Level::WARN, target, message);
    }

    pub fn error(&self, target: impl Into<String>, message: impl Into<String>) {
        self.log(Level::ERROR, target, message);
    }
}

/// Owns the drain thread. Shutting down (or dropping) flushes queued
/// records and joins the drain; records sent afterwards are discarded.
pub(crate) struct LogBridge {
    tx: flume::Sender<Msg>,
    drain: Option<JoinHandle<()>>,
}

impl LogBridge {
    pub(crate) fn start(sink: LogSink) -> Self {
        let (tx, rx) = flume::unbounded::<Msg>();
        let drain = std::thread::Builder::new()
            .name("taskgraph-logbridge".to_owned())
            .spawn(move || {
                for msg in rx.iter() {
                    match msg {
                        Msg::Record(record) => sink(&record),
                        Msg::Shutdown => break,
                    }
                }
            })
            .expect("spawn log bridge thread");
        LogBridge {
            tx,
            drain: Some(drain),
        }
    }

    pub(crate) fn handle(&self) -> LogHandle {
        LogHandle {
            tx: self.tx.clone(),
        }
    }

    /// Flush records queued so far and stop the drain. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        if let Some(drain) = self.drain.take() {
            let _ = self.tx.send(Msg::Shutdown);
            let _ = drain.join();
        }
    }
}

impl Drop for LogBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
