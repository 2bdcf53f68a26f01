//! Error reporting with error ids.
//!
//! Every reported error is logged once and receives an id that is also put
//! into the response sent to the requester, so a failure seen by a user can
//! be found in the satellite's log.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;
use uuid::Uuid;

/// Assigns error ids and logs reported errors.
#[derive(Debug)]
pub struct ErrorReporter {
    instance_id: String,
    counter: AtomicU64,
}

impl ErrorReporter {
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string().to_uppercase();
        Self {
            instance_id: uuid[..8].to_string(),
            counter: AtomicU64::new(0),
        }
    }

    /// Prefix shared by all ids of this reporter.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Logs the error and returns its id.
    pub fn report_error(&self, err: &dyn Display, context: Option<&str>) -> String {
        let nr = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}-{:06}", self.instance_id, nr);
        match context {
            Some(ctx) => error!(error_id = %id, "{}: {}", ctx, err),
            None => error!(error_id = %id, "{}", err),
        }
        id
    }
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new()
    }
}
