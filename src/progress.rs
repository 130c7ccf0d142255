//! progress reporting and cancellation for long-running transfers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};

/// stage of a transfer an event belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connecting,
    Negotiating,
    Receiving,
    Resolving,
    Checking,
    Done,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Connecting => "connecting",
            Phase::Negotiating => "negotiating",
            Phase::Receiving => "receiving objects",
            Phase::Resolving => "resolving deltas",
            Phase::Checking => "checking connectivity",
            Phase::Done => "done",
        }
    }
}

/// a single progress notification
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub processed: u64,
    /// 0 when the total is not yet known
    pub total: u64,
    pub phase: Phase,
    pub message: String,
}

/// where progress events go
pub enum ProgressSink<'a> {
    Silent,
    Callback(Box<dyn FnMut(&ProgressEvent) + Send + 'a>),
    Channel(Sender<ProgressEvent>),
}

impl<'a> ProgressSink<'a> {
    pub fn callback(f: impl FnMut(&ProgressEvent) + Send + 'a) -> Self {
        ProgressSink::Callback(Box::new(f))
    }

    pub fn emit(&mut self, event: ProgressEvent) {
        match self {
            ProgressSink::Silent => {}
            ProgressSink::Callback(f) => f(&event),
            // a dropped receiver just means nobody is watching
            ProgressSink::Channel(tx) => {
                let _ = tx.send(event);
            }
        }
    }
}

/// cooperative cancellation flag shared between a caller and a transfer
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// error out if cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// rate-limited, monotonic reporter over a sink
///
/// counts only move forward within a phase and intermediate events are
/// emitted at most `steps` times per phase.
pub struct Progress<'s, 'a> {
    sink: &'s mut ProgressSink<'a>,
    steps: u64,
    phase: Phase,
    total: u64,
    processed: u64,
    last_reported: Option<u64>,
}

impl<'s, 'a> Progress<'s, 'a> {
    pub fn new(sink: &'s mut ProgressSink<'a>, steps: u64) -> Self {
        Self {
            sink,
            steps: steps.max(1),
            phase: Phase::Connecting,
            total: 0,
            processed: 0,
            last_reported: None,
        }
    }

    /// enter a new phase and announce it immediately
    ///
    /// counts carry over between phases so consecutive events never go
    /// backwards; `total` replaces the known total when given.
    pub fn phase(&mut self, phase: Phase, total: Option<u64>) {
        self.phase = phase;
        if let Some(total) = total {
            self.total = total.max(self.processed);
        }
        self.last_reported = None;
        self.report();
    }

    /// advance the count, emitting when a step boundary is crossed
    pub fn set(&mut self, processed: u64) {
        if processed <= self.processed && self.last_reported.is_some() {
            return;
        }
        self.processed = processed.max(self.processed);

        let due = match self.last_reported {
            None => true,
            // unknown totals report each time the count doubles
            Some(last) if self.total == 0 => self.processed >= (last * 2).max(1),
            Some(last) => {
                let step = (self.total / self.steps).max(1);
                self.processed >= last + step || self.processed == self.total
            }
        };
        if due {
            self.report();
        }
    }

    pub fn inc(&mut self) {
        let next = self.processed + 1;
        self.set(next);
    }

    /// final event of the transfer
    pub fn finish(&mut self, message: impl Into<String>) {
        let count = self.processed.max(self.total);
        self.sink.emit(ProgressEvent {
            processed: count,
            total: count,
            phase: Phase::Done,
            message: message.into(),
        });
    }

    fn report(&mut self) {
        self.last_reported = Some(self.processed);
        let message = if self.total > 0 {
            format!("{}: {}/{}", self.phase.label(), self.processed, self.total)
        } else {
            self.phase.label().to_string()
        };
        self.sink.emit(ProgressEvent {
            processed: self.processed,
            total: self.total,
            phase: self.phase,
            message,
        });
    }
}
