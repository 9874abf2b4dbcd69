//! Cooperative polling with explicit intervals, deadlines and cancellation.
//!
//! Cloud and install APIs are only observable by asking again later. A
//! `Poller` owns the cadence of one such loop; a `Shutdown` handle lets the
//! caller abort a stuck deployment between polls.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Classify, ErrorKind};

/// Returned when a shutdown signal interrupts a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled by shutdown signal")]
pub struct Cancelled;

impl Classify for Cancelled {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Cancelled
    }
}

/// Receiving side of a deployment-wide shutdown signal.
///
/// Backed by a `watch` channel carrying `true` once shutdown is requested.
/// A dropped sender means "never cancelled".
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Create a sender/handle pair.
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self::new(rx))
    }

    /// A handle that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Fail fast if shutdown has already been requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration` unless shutdown is requested first.
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), Cancelled> {
        self.check()?;
        let until = Instant::now() + duration;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(until) => return Ok(()),
                changed = self.rx.changed() => match changed {
                    Ok(()) if *self.rx.borrow() => return Err(Cancelled),
                    Ok(()) => continue,
                    Err(_) => {
                        tokio::time::sleep_until(until).await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Errors that end a polling loop without a terminal observation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("gave up waiting for {what} after {waited:?}")]
    DeadlineExceeded { what: String, waited: Duration },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl Classify for PollError {
    fn kind(&self) -> ErrorKind {
        match self {
            PollError::DeadlineExceeded { .. } => ErrorKind::Timeout,
            PollError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

/// Paces one polling loop.
///
/// ```text
/// loop {
///     observe();
///     poller.tick().await?;   // sleeps `interval`, enforces the deadline
/// }
/// ```
#[derive(Debug)]
pub struct Poller {
    what: String,
    interval: Duration,
    started: Instant,
    timeout: Option<Duration>,
    shutdown: Shutdown,
}

impl Poller {
    pub fn new(what: impl Into<String>, interval: Duration, shutdown: Shutdown) -> Self {
        Self {
            what: what.into(),
            interval,
            started: Instant::now(),
            timeout: None,
            shutdown,
        }
    }

    /// Bound the loop by an absolute deadline measured from creation.
    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Time since the poller was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the deadline (if any) has passed.
    pub fn expired(&self) -> bool {
        self.timeout.is_some_and(|t| self.elapsed() > t)
    }

    /// Wait one interval, then enforce cancellation and the deadline.
    pub async fn tick(&mut self) -> Result<(), PollError> {
        self.shutdown.sleep(self.interval).await?;
        if self.expired() {
            return Err(PollError::DeadlineExceeded {
                what: self.what.clone(),
                waited: self.elapsed(),
            });
        }
        Ok(())
    }
}
