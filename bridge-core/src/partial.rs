//! Partial result delivery
//!
//! A single-slot, latest-value channel. A partial result that has not been
//! read when the next one arrives is overwritten, so a slow consumer only
//! ever sees the most recent `(text, done)` pair. Emissions made while no
//! consumer is subscribed are dropped.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, trace};

/// One streamed fragment plus the completion flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartialResult {
    pub text: String,
    pub done: bool,
}

/// Producer side, cloned into the engine's result listener
#[derive(Clone)]
pub struct PartialResultSender {
    tx: Arc<watch::Sender<Option<PartialResult>>>,
}

impl PartialResultSender {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a partial result, replacing any unread one
    pub fn emit(&self, text: &str, done: bool) {
        let result = PartialResult {
            text: text.to_string(),
            done,
        };
        if self.tx.send(Some(result)).is_err() {
            trace!("No partial result listener, dropping fragment");
        }
    }

    /// Start a new consumer; it only sees results emitted after this call
    pub fn subscribe(&self) -> PartialResults {
        PartialResults {
            rx: self.tx.subscribe(),
        }
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for PartialResultSender {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer side: an open-ended sequence of the latest partial results
pub struct PartialResults {
    rx: watch::Receiver<Option<PartialResult>>,
}

impl PartialResults {
    /// Wait for the next partial result.
    ///
    /// Returns `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<PartialResult> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(result) = self.rx.borrow_and_update().clone() {
                return Some(result);
            }
        }
    }

    /// Take the latest unread partial result without waiting
    pub fn try_next(&mut self) -> Option<PartialResult> {
        if !self.rx.has_changed().unwrap_or(false) {
            return None;
        }
        self.rx.borrow_and_update().clone()
    }
}

/// Drain partial results into the log for as long as the producer lives
pub fn spawn_partial_result_logger(mut results: PartialResults) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(partial) = results.next().await {
            info!("Partial result: {}, Done: {}", partial.text, partial.done);
        }
    })
}
