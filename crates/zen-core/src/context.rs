//! Cancellation and deadline carrier passed to every blocking operation.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ZenError;

/// Cheap to clone; clones share cancellation. [`Context::child`] and
/// [`Context::with_timeout`] derive contexts that are cancelled with their
/// parent but can be cancelled (or expire) independently.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a context whose deadline is the earlier of the parent's and
    /// `now + timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.is_expired()
    }

    /// `canceled` or `timeout` once the context is done, `None` before.
    pub fn err(&self) -> Option<ZenError> {
        if self.is_cancelled() {
            Some(ZenError::canceled("operation canceled"))
        } else if self.is_expired() {
            Some(ZenError::timeout("deadline exceeded"))
        } else {
            None
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Sleep for `dur` unless the context finishes first.
    pub async fn sleep(&self, dur: Duration) -> crate::Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(dur) => Ok(()),
            _ = self.done() => Err(self.err().unwrap_or_else(|| ZenError::canceled("operation canceled"))),
        }
    }

    /// The underlying token, for handing to spawned tasks.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
