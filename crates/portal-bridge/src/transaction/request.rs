use crate::config::RecordEdit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation for a running transaction.
///
/// Honoured between phases up to the submit. Once the commit has been
/// issued the transaction always waits for its response.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What one transaction should do.
#[derive(Debug, Clone, Default)]
pub struct TransactionRequest {
    /// Value for the screen's `${query}` slot. `None` searches with an empty
    /// query.
    pub search: Option<String>,
    pub records: Vec<RecordEdit>,
    /// Stop after writing and report the form's values instead of saving.
    pub dry_run: bool,
    pub deadline: Option<Instant>,
    cancel: CancelHandle,
}

impl TransactionRequest {
    pub fn new(records: Vec<RecordEdit>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    pub fn search(mut self, query: Option<String>) -> Self {
        self.search = query;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `budget` from now.
    pub fn within(self, budget: Duration) -> Self {
        self.deadline(Instant::now() + budget)
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// A handle that cancels this request.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn query(&self) -> &str {
        self.search.as_deref().unwrap_or("")
    }

    /// Why the transaction should stop now, if it should.
    pub fn interruption(&self) -> Option<String> {
        if self.cancel.is_cancelled() {
            return Some("cancelled by caller".into());
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some("deadline exceeded".into()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_handle_is_shared() {
        let request = TransactionRequest::new(vec![]);
        let handle = request.cancel_handle();
        assert!(request.interruption().is_none());
        handle.cancel();
        assert_eq!(request.interruption().as_deref(), Some("cancelled by caller"));
    }

    #[test]
    fn test_past_deadline_interrupts() {
        let request = TransactionRequest::new(vec![]).deadline(Instant::now());
        assert_eq!(request.interruption().as_deref(), Some("deadline exceeded"));
        let request = TransactionRequest::new(vec![]).within(Duration::from_secs(60));
        assert!(request.interruption().is_none());
    }

    #[test]
    fn test_query_defaults_to_empty() {
        let request = TransactionRequest::new(vec![RecordEdit::new("CORUMBA")]);
        assert_eq!(request.query(), "");
        assert_eq!(request.search(Some("COR".into())).query(), "COR");
    }
}
