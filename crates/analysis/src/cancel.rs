use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::error;

const SLEEP_SLICE: Duration = Duration::from_millis(10);

struct Inner {
    cancelled: AtomicBool,
    aborted: AtomicBool,
    parent: Option<CancellationToken>,
}

/// Cooperative cancellation signal with an escalated "abort" level.
///
/// Cancelling a token cancels all of its children. Work polls the token at
/// transaction boundaries and inner-loop iterations.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    /// Token cancelled together with `self`, but cancellable on its own.
    pub fn child_token(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                aborted: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Forced abort: checkpoints fail immediately, whatever the step is doing.
    pub fn abort(&self) {
        self.inner.aborted.store(true, Ordering::SeqCst);
        self.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || self.inner.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
            || self.inner.parent.as_ref().is_some_and(|p| p.is_aborted())
    }

    /// Sleep up to `duration`. Returns `false` if cancelled meanwhile.
    pub fn sleep(&self, duration: Duration) -> bool {
        let until = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(until - now));
        }
    }
}

/// Process-wide "exit requested" flag, set on fatal conditions.
#[derive(Clone, Default)]
pub struct ExitSignal {
    requested: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl ExitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request exit. The first reason is kept.
    pub fn request(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            error!(reason = %reason, "process exit requested");
            *slot = Some(reason);
        }
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_follows_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(!child.is_aborted());
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        child.abort();
        assert!(child.is_cancelled());
        assert!(child.is_aborted());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn sleep_stops_on_cancel() {
        let token = CancellationToken::new();
        assert!(token.sleep(Duration::from_millis(5)));
        token.cancel();
        let started = Instant::now();
        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn exit_signal_keeps_first_reason() {
        let exit = ExitSignal::new();
        assert!(!exit.is_requested());
        exit.request("first");
        exit.request("second");
        assert!(exit.is_requested());
        assert_eq!(exit.reason().as_deref(), Some("first"));
    }
}
