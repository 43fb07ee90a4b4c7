//! Record of remediations already attempted in this run.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::catalog::ErrorCode;

/// Ledger key: an error code paired with the context it occurred in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecoveryKey {
    pub code: ErrorCode,
    pub context: String,
}

impl RecoveryKey {
    pub fn new(code: ErrorCode, context: Option<&str>) -> Self {
        Self {
            code,
            context: context.unwrap_or_default().to_string(),
        }
    }
}

impl fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.code, self.context)
    }
}

/// A ledger shared by every dispatcher of one process.
pub type SharedLedger = Arc<Mutex<RecoveryLedger>>;

/// Append-only set of attempted recoveries.
///
/// There is no way to remove an entry: once a (code, context) pair has been
/// tried it stays tried for the lifetime of the process.
#[derive(Debug, Default)]
pub struct RecoveryLedger {
    attempted: HashSet<RecoveryKey>,
}

impl RecoveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedLedger {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn contains(&self, key: &RecoveryKey) -> bool {
        self.attempted.contains(key)
    }

    /// Record a key. Returns `false` if it was already present.
    pub fn record(&mut self, key: RecoveryKey) -> bool {
        self.attempted.insert(key)
    }

    pub fn len(&self) -> usize {
        self.attempted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_is_idempotent() {
        let mut ledger = RecoveryLedger::new();
        let key = RecoveryKey::new(ErrorCode::Prc001, Some("Checking port availability"));

        assert!(ledger.record(key.clone()));
        assert!(!ledger.record(key.clone()));
        assert!(ledger.contains(&key));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_context_distinguishes_keys() {
        let mut ledger = RecoveryLedger::new();
        ledger.record(RecoveryKey::new(ErrorCode::Prc001, Some("a")));
        assert!(!ledger.contains(&RecoveryKey::new(ErrorCode::Prc001, Some("b"))));
        assert!(!ledger.contains(&RecoveryKey::new(ErrorCode::Prc001, None)));
        assert_eq!(RecoveryKey::new(ErrorCode::Prc001, None).to_string(), "PRC_001_");
    }
}
