use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::utils::IdError;

/// Wall-clock budget and cooperative cancellation for one document.
///
/// Checked only between the primary and secondary alignment attempts and
/// between the plain and enhanced OCR passes.
#[derive(Debug, Clone)]
pub struct Budget {
    started: Instant,
    limit: Option<Duration>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Budget {
    pub fn unbounded() -> Self {
        Budget {
            started: Instant::now(),
            limit: None,
            cancel: None,
        }
    }

    pub fn with_limit(limit: Duration) -> Self {
        Budget {
            limit: Some(limit),
            ..Self::unbounded()
        }
    }

    /// Attach a flag another thread may set to abandon the document.
    pub fn cancelled_by(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn checkpoint(&self, stage: &'static str) -> Result<(), IdError> {
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(IdError::Cancelled(stage));
            }
        }
        if let Some(limit) = self.limit {
            if self.started.elapsed() > limit {
                return Err(IdError::DeadlineExceeded {
                    stage,
                    budget: limit,
                });
            }
        }
        Ok(())
    }
}

impl Default for Budget {
    fn default() -> Self {
        Self::unbounded()
    }
}
