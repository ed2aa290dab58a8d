use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cairn_types::error::{CairnError, Result};

use crate::caching::CacheManager;

/// Process-level services threaded through every operation: cooperative
/// cancellation, the cache manager, and the concurrency budget.
///
/// Child contexts share the parent's cancellation flag, so cancelling a
/// parent propagates to every in-flight task forked from it.
#[derive(Clone)]
pub struct AppContext {
    cancel: Arc<AtomicBool>,
    cache: Arc<CacheManager>,
    max_concurrency: usize,
}

impl AppContext {
    pub fn new(cache_dir: &Path) -> Self {
        let max_concurrency = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            cache: Arc::new(CacheManager::new(cache_dir)),
            max_concurrency,
        }
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    /// Fork a child context sharing the parent's cancellation flag.
    pub fn child(&self) -> Self {
        self.clone()
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Bail out of the current operation if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CairnError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_propagates_to_children() {
        let dir = tempfile::tempdir().unwrap();
        let parent = AppContext::new(dir.path());
        let child = parent.child();
        assert!(child.check_cancelled().is_ok());

        parent.cancel();
        assert!(child.is_cancelled());
        assert!(matches!(child.check_cancelled(), Err(CairnError::Cancelled)));
    }

    #[test]
    fn concurrency_floor_is_one() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::new(dir.path()).with_max_concurrency(0);
        assert_eq!(ctx.max_concurrency(), 1);
    }
}
