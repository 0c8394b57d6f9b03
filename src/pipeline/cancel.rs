//! Cooperative cancellation and forced unblocking.
//!
//! Every stage loop checks a [`CancelToken`] at each blocking-call boundary. Calls that
//! cannot observe the token (a socket receive, a slow disk write) are woken through
//! an [`Interrupt`] the stage hands to the orchestrator before it starts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared "please stop" flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Forces a stage out of a call that does not watch its [`CancelToken`].
pub trait Interrupt: Send + Sync {
    /// Wake the blocked call. May be invoked more than once.
    fn interrupt(&self);
}

/// Interrupt that raises a flag polled by the blocked call.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// Lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the flag has been raised.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Lower the flag before reuse.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Interrupt for InterruptFlag {
    fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }
}
