use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};
use tracing::debug;

use crate::{Condition, Operation};

/// Retry flips between running an attempt and sleeping off a failed one:
/// ```no_rust
///  Running --Ok--> [Ok]
///     |
///    Err --not retryable--> [Err]
///     |
///  next backoff --None--> [Err]
///     |
///  Sleeping --elapsed--> Running
/// ```
#[pin_project(project = RetryStateProj)]
enum RetryState<O>
where
    O: Operation,
{
    Running(#[pin] O::Future),
    Sleeping(#[pin] Sleep),
}

/// Retries an [`Operation`] with the delays produced by a backoff [`crate::strategy`] for as long
/// as the [`Condition`] accepts the error.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    retry_state: RetryState<O>,
    backoff: I,
    operation: O,
    condition: C,
    attempt: u32,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II: IntoIterator<IntoIter = I, Item = I::Item>>(
        backoff: II,
        mut operation: O,
        condition: C,
    ) -> Self {
        Self {
            retry_state: RetryState::Running(operation.run()),
            backoff: backoff.into_iter(),
            operation,
            condition,
            attempt: 1,
        }
    }

    /// Moves to [`RetryState::Sleeping`], or hands the error back once the backoff is exhausted.
    fn cool_off(self: Pin<&mut Self>, err: O::Error) -> Result<(), O::Error> {
        let mut this = self.project();
        match this.backoff.next() {
            None => Err(err),
            Some(duration) => {
                debug!(attempt = *this.attempt, ?duration, "Attempt failed, backing off");
                this.retry_state
                    .set(RetryState::Sleeping(sleep_until(Instant::now() + duration)));
                Ok(())
            }
        }
    }

    fn reattempt(self: Pin<&mut Self>) {
        let mut this = self.project();
        *this.attempt += 1;
        this.retry_state
            .set(RetryState::Running(this.operation.run()));
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project().retry_state.project() {
                RetryStateProj::Running(op) => match op.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                    Poll::Ready(Err(e)) => {
                        if !self.as_mut().project().condition.can_retry(&e) {
                            return Poll::Ready(Err(e));
                        }
                        if let Err(e) = self.as_mut().cool_off(e) {
                            return Poll::Ready(Err(e));
                        }
                    }
                },
                RetryStateProj::Sleeping(sleep) => match sleep.poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => self.as_mut().reattempt(),
                },
            }
        }
    }
}
