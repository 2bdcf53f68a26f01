//! Structured responses returned to the controller.
//!
//! An [`ApiCallRc`] is a list of [`RcEntry`] values, each with a return
//! code, a message and optional cause/correction/details texts. The two high
//! bits of the return code select the severity.

use serde::{Deserialize, Serialize};

/// Return codes and masks.
pub mod rc {
    /// Severity mask for informational entries
    pub const MASK_INFO: u64 = 0;
    /// Severity mask for warnings
    pub const MASK_WARN: u64 = 0x4000_0000_0000_0000;
    /// Severity mask for errors
    pub const MASK_ERROR: u64 = 0xC000_0000_0000_0000;
    /// Mask covering the severity bits
    pub const MASK_SEVERITY: u64 = 0xC000_0000_0000_0000;

    /// An object was modified
    pub const MODIFIED: u64 = MASK_INFO | 3;
    /// A dispatch request was skipped
    pub const WARN_SKIPPED: u64 = MASK_WARN | 0x0100;
    /// Unspecified failure
    pub const FAIL_UNKNOWN_ERROR: u64 = MASK_ERROR | 0x0FFF_FFFF;
}

/// One entry of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcEntry {
    pub return_code: u64,
    pub message: String,
    pub cause: Option<String>,
    pub correction: Option<String>,
    pub details: Option<String>,
    pub error_ids: Vec<String>,
}

impl RcEntry {
    /// Creates an entry with only a return code and a message.
    pub fn new(return_code: u64, message: impl Into<String>) -> Self {
        Self {
            return_code,
            message: message.into(),
            cause: None,
            correction: None,
            details: None,
            error_ids: Vec::new(),
        }
    }

    pub fn with_cause(mut self, cause: Option<String>) -> Self {
        self.cause = cause;
        self
    }

    pub fn with_correction(mut self, correction: Option<String>) -> Self {
        self.correction = correction;
        self
    }

    pub fn with_details(mut self, details: Option<String>) -> Self {
        self.details = details;
        self
    }

    pub fn with_error_id(mut self, error_id: impl Into<String>) -> Self {
        self.error_ids.push(error_id.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.return_code & rc::MASK_SEVERITY == rc::MASK_ERROR
    }

    pub fn is_warning(&self) -> bool {
        self.return_code & rc::MASK_SEVERITY == rc::MASK_WARN
    }
}

/// A response made of any number of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCallRc {
    entries: Vec<RcEntry>,
}

impl ApiCallRc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a response holding exactly one entry.
    pub fn singleton(entry: RcEntry) -> Self {
        Self {
            entries: vec![entry],
        }
    }

    /// Creates a response with one entry carrying a message and a cause.
    pub fn single(return_code: u64, message: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::singleton(RcEntry::new(return_code, message).with_cause(Some(cause.into())))
    }

    pub fn add_entry(&mut self, entry: RcEntry) {
        self.entries.push(entry);
    }

    /// Appends all entries of `other`.
    pub fn add_entries(&mut self, other: ApiCallRc) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[RcEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(RcEntry::is_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_severity() {
        assert!(RcEntry::new(rc::FAIL_UNKNOWN_ERROR, "boom").is_error());
        assert!(RcEntry::new(rc::WARN_SKIPPED, "skipped").is_warning());
        assert!(!RcEntry::new(rc::MODIFIED, "ok").is_error());
    }

    #[test]
    fn test_single() {
        let response = ApiCallRc::single(0, "Skipping processing resource: r1", "Resource is already deleted");
        assert_eq!(response.entries().len(), 1);
        assert_eq!(
            response.entries()[0].cause.as_deref(),
            Some("Resource is already deleted")
        );
        assert!(!response.has_errors());
    }

    #[test]
    fn test_add_entries() {
        let mut response = ApiCallRc::new();
        assert!(response.is_empty());
        response.add_entry(RcEntry::new(rc::MODIFIED, "changed"));
        response.add_entries(ApiCallRc::singleton(
            RcEntry::new(rc::FAIL_UNKNOWN_ERROR, "failed").with_error_id("ABC-000001"),
        ));
        assert_eq!(response.entries().len(), 2);
        assert!(response.has_errors());
        assert_eq!(response.entries()[1].error_ids, vec!["ABC-000001".to_string()]);
    }
}
