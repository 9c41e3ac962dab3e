use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorCode, Result};

/// Cancellation signal polled by long-running planning and scan loops.
///
/// Clones share the cancel flag, so cancelling any clone stops every
/// holder. Deadlines are per clone: [`Interrupt::with_timeout`] narrows
/// one without affecting the others.
#[derive(Clone, Default)]
pub struct Interrupt {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A clone whose deadline is at most `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Interrupt {
            cancelled: Arc::clone(&self.cancelled),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.clone(),
        }
    }

    /// Applies a command's `maxTimeMS`. Zero and negative values mean no
    /// limit.
    pub fn with_max_time_ms(&self, max_time_ms: Option<i64>) -> Self {
        match max_time_ms.and_then(|ms| u64::try_from(ms).ok()).filter(|ms| *ms > 0) {
            Some(ms) => self.with_timeout(Duration::from_millis(ms)),
            None => self.clone(),
        }
    }

    /// `Interrupted` once cancelled, `ExceededTimeLimit` past the deadline.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::new(ErrorCode::Interrupted, "operation was interrupted"));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::new(
                ErrorCode::ExceededTimeLimit,
                "operation exceeded time limit",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupt")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn cancel_reaches_every_clone() {
        let interrupt = Interrupt::new();
        let narrowed = interrupt.with_timeout(Duration::from_secs(3600));
        assert!(narrowed.check().is_ok());

        interrupt.cancel();
        let err = narrowed.check().unwrap_err();
        assert_eq!(err.code, ErrorCode::Interrupted);
        assert_eq!(err.code.code(), 11601);
        assert_eq!(err.kind(), ErrorKind::Resource);
    }

    #[test]
    fn past_deadline_exceeds_time_limit() {
        let interrupt = Interrupt::new().with_deadline(Instant::now());
        assert_eq!(interrupt.check().unwrap_err().code, ErrorCode::ExceededTimeLimit);
    }

    #[test]
    fn deadlines_only_narrow() {
        let now = Instant::now();
        let early = Interrupt::new().with_deadline(now);
        let later = early.with_deadline(now + Duration::from_secs(60));
        assert_eq!(later.deadline(), Some(now));
    }

    #[test]
    fn non_positive_max_time_is_unlimited() {
        let interrupt = Interrupt::new();
        assert_eq!(interrupt.with_max_time_ms(Some(0)).deadline(), None);
        assert_eq!(interrupt.with_max_time_ms(Some(-5)).deadline(), None);
        assert_eq!(interrupt.with_max_time_ms(None).deadline(), None);
        assert!(interrupt.with_max_time_ms(Some(10_000)).deadline().is_some());
    }
}
