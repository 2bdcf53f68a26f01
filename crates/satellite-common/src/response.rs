//! Response channels between the device manager and requesters.
//!
//! A [`ResponseSink`] is the producing half: the device manager pushes
//! outcome responses into it with [`ResponseSink::next`] and finishes it with
//! [`ResponseSink::complete`]. The requester holds the matching
//! [`ResponseStream`] and reads responses until the stream ends.
//!
//! Sinks are cheap to clone; all clones share one channel. Completing any
//! clone completes the channel, and completing twice is a no-op. When the last
//! clone is dropped without completion the stream ends as well.

use crate::api_call_rc::ApiCallRc;
use log::trace;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Creates a connected sink/stream pair.
pub fn response_channel() -> (ResponseSink, ResponseStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ResponseSink {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        ResponseStream { rx },
    )
}

/// Producing half of a response channel.
#[derive(Clone)]
pub struct ResponseSink {
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<ApiCallRc>>>>,
}

impl ResponseSink {
    /// Pushes one response. Returns false if the sink was already completed
    /// or the stream was dropped.
    pub fn next(&self, response: ApiCallRc) -> bool {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                trace!("Dropping response for an already completed sink");
                false
            }
        }
    }

    /// Completes the channel; the stream ends after the pending responses.
    pub fn complete(&self) {
        self.tx.lock().take();
    }

    pub fn is_completed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Returns true if both handles feed the same channel.
    pub fn same_channel(&self, other: &ResponseSink) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}

impl fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Consuming half of a response channel.
#[derive(Debug)]
pub struct ResponseStream {
    rx: mpsc::UnboundedReceiver<ApiCallRc>,
}

impl ResponseStream {
    /// Waits for the next response. Returns `None` once the sink completed
    /// and all responses were read.
    pub async fn recv(&mut self) -> Option<ApiCallRc> {
        self.rx.recv().await
    }

    /// Reads all responses until the channel completes.
    pub async fn collect(mut self) -> Vec<ApiCallRc> {
        let mut responses = Vec::new();
        while let Some(response) = self.rx.recv().await {
            responses.push(response);
        }
        responses
    }

    /// Returns a response that is already available, without waiting.
    pub fn try_recv(&mut self) -> Option<ApiCallRc> {
        self.rx.try_recv().ok()
    }
}
