//! Cooperative cancellation.

use crate::error::{ArchiveError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cheaply clonable cancellation token.
///
/// Pipelines call [`CancelToken::check`] at every I/O boundary and at least
/// every 1024 iterations of hot loops; once the token is cancelled they fail
/// with [`ArchiveError::Cancelled`] and release their buffers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Fail with [`ArchiveError::Cancelled`] if cancellation was signalled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ArchiveError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_propagates_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(ArchiveError::Cancelled)));
    }
}
