//! Client-side operation timeouts.
//!
//! A [`TimeoutContext`] turns the client-wide time budget into an absolute deadline. Every network
//! call made on behalf of an operation (server selection, connection checkout, the send itself) is
//! bounded by that deadline, and the remaining time is forwarded to the server as `maxTimeMS`.
#[cfg(test)]
mod test;

use std::{future::Future, time::Duration};

use tokio::time::Instant;

use crate::{
    error::{Error, Result},
    options::{ClientOptions, WriteConcern},
};

const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_secs(1);

/// Deadline bookkeeping for a single logical operation or cursor.
///
/// The deadline is derived once, at creation, from the budget. It is never extended: reading
/// [`remaining`](TimeoutContext::remaining) repeatedly yields monotonically non-increasing values
/// until it fails with [`ErrorKind::TimedOut`](crate::error::ErrorKind::TimedOut).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeoutContext {
    budget: Option<Duration>,
    deadline: Option<Instant>,
    max_time_ceiling: Option<Duration>,
    socket_timeout: Option<Duration>,
}

impl TimeoutContext {
    /// Creates a context whose deadline is `now + budget`. A budget of `None` or zero disables the
    /// client-side timeout entirely.
    pub fn for_new_operation(budget: impl Into<Option<Duration>>) -> Self {
        let budget = budget.into().filter(|b| !b.is_zero());
        Self {
            budget,
            deadline: budget.map(|b| Instant::now() + b),
            max_time_ceiling: None,
            socket_timeout: None,
        }
    }

    /// The budget this context was derived from, if any.
    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }

    /// The absolute deadline, if a budget is configured.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The time left before the deadline. Returns `Ok(None)` when no budget is configured and an
    /// error as soon as the remaining time is no longer positive.
    pub fn remaining(&self) -> Result<Option<Duration>> {
        let deadline = match self.deadline {
            Some(deadline) => deadline,
            None => return Ok(None),
        };
        let now = Instant::now();
        if deadline <= now {
            return Err(self.expired_error());
        }
        Ok(Some(deadline - now))
    }

    /// The server-side execution limit to attach to the next command: the smaller of the remaining
    /// time and the configured ceiling. `None` when no budget is configured.
    pub fn per_call_ceiling(&self) -> Result<Option<Duration>> {
        Ok(self
            .remaining()?
            .map(|remaining| match self.max_time_ceiling {
                Some(ceiling) => remaining.min(ceiling),
                None => remaining,
            }))
    }

    /// Resolves the `maxTimeMS` value to send. A configured budget always wins over a legacy
    /// per-command limit.
    pub(crate) fn max_time(&self, legacy: Option<Duration>) -> Result<Option<Duration>> {
        if self.deadline.is_some() {
            self.per_call_ceiling()
        } else {
            Ok(legacy)
        }
    }

    /// Resolves the write concern to send. `wtimeout` is dropped when a budget is configured.
    pub(crate) fn write_concern(&self, write_concern: &WriteConcern) -> WriteConcern {
        let mut write_concern = write_concern.clone();
        if self.deadline.is_some() {
            write_concern.w_timeout = None;
        }
        write_concern
    }

    /// A new context with the same budget and settings whose deadline starts now.
    pub(crate) fn refreshed(&self) -> Self {
        Self {
            deadline: self.budget.map(|b| Instant::now() + b),
            ..*self
        }
    }

    /// Awaits `fut`, failing with `TimedOut` if the deadline passes first.
    pub(crate) async fn bound<F, T>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        // Fail without polling when the deadline has already passed.
        self.remaining()?;
        match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Err(Error::timed_out(format!("{what} exceeded the time budget"))),
            },
            None => fut.await,
        }
    }

    /// Awaits a network send. The send is bounded by the deadline when a budget is configured, or
    /// by the legacy socket timeout otherwise. Budget expiry yields `TimedOut`; socket timeout
    /// expiry yields a network timeout.
    pub(crate) async fn bound_send<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.deadline.is_some() {
            return self.bound("sending the command", fut).await;
        }
        match self.socket_timeout {
            Some(socket_timeout) => match tokio::time::timeout(socket_timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(Error::network_timeout()),
            },
            None => fut.await,
        }
    }

    /// The deadline forwarded to the transport along with a command.
    pub(crate) fn send_deadline(&self) -> Option<Instant> {
        self.deadline
            .or_else(|| self.socket_timeout.map(|t| Instant::now() + t))
    }

    fn expired_error(&self) -> Error {
        let budget = self.budget.unwrap_or_default();
        Error::timed_out(format!(
            "the time budget of {}ms has been exhausted",
            budget.as_millis()
        ))
    }
}

/// The timeout-related client options, resolved once when the client is created.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct TimeoutSettings {
    pub(crate) budget: Option<Duration>,
    pub(crate) socket_timeout: Option<Duration>,
    pub(crate) max_time_ceiling: Option<Duration>,
    pub(crate) cleanup_grace: Option<Duration>,
}

impl TimeoutSettings {
    pub(crate) fn from_options(options: &ClientOptions) -> Self {
        Self {
            budget: options.timeout,
            socket_timeout: options.socket_timeout,
            max_time_ceiling: options.max_time_ceiling,
            cleanup_grace: options.cursor_cleanup_grace,
        }
    }

    /// The effective budget. Zero is treated the same as no budget.
    pub(crate) fn budget(&self) -> Option<Duration> {
        self.budget.filter(|b| !b.is_zero())
    }

    /// A context for a new logical operation.
    pub(crate) fn new_context(&self) -> TimeoutContext {
        let mut context = TimeoutContext::for_new_operation(self.budget());
        context.max_time_ceiling = self.max_time_ceiling;
        if context.deadline.is_none() {
            context.socket_timeout = self.socket_timeout.filter(|t| !t.is_zero());
        }
        context
    }

    /// A short-lived context for best-effort cleanup commands such as `killCursors`.
    pub(crate) fn cleanup_context(&self) -> TimeoutContext {
        let grace = self
            .cleanup_grace
            .filter(|g| !g.is_zero())
            .or_else(|| self.budget())
            .unwrap_or(DEFAULT_CLEANUP_GRACE);
        let mut context = TimeoutContext::for_new_operation(grace);
        context.max_time_ceiling = self.max_time_ceiling;
        context
    }
}

/// Renders a duration as whole milliseconds for `maxTimeMS`, rounding up so that a
/// sub-millisecond remainder is never sent as `0` (which the server reads as "no limit").
pub(crate) fn max_time_ms(duration: Duration) -> i64 {
    let mut millis = duration.as_millis();
    if duration.subsec_nanos() % 1_000_000 != 0 {
        millis += 1;
    }
    millis.try_into().unwrap_or(i64::MAX).min(i32::MAX as i64)
}
