use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// A shared stop flag for long-running passes.
///
/// The driver keeps one clone and the worker another. The worker polls
/// `is_cancelled()` between batches and abandons its pass once it flips.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(!worker.is_cancelled());
        token.cancel();
        assert!(worker.is_cancelled());
        token.cancel();
        assert!(worker.is_cancelled());
    }
}
