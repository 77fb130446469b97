//! Retries for fallible async operations.
//!
//! An [`Operation`] is re-run by [`retry::Retry`] whenever it fails with an error accepted by the
//! [`Condition`], sleeping between attempts for the durations yielded by a [`strategy`]. Running
//! out of durations ends the retry with the last error.

use std::future::Future;

/// Future that drives an [`Operation`] through its retries.
pub mod retry;

/// Backoff strategies, i.e., iterators of sleep durations between attempts.
pub mod strategy;

/// A unit of work that can be started multiple times.
pub trait Operation {
    /// Value produced on success.
    type Item;
    /// Error produced on failure.
    type Error;
    /// The future of one attempt.
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    /// Starts a new attempt.
    fn run(&mut self) -> Self::Future;
}

impl<I, E, T, F> Operation for F
where
    F: FnMut() -> T,
    T: Future<Output = Result<I, E>>,
{
    type Item = I;
    type Error = E;
    type Future = T;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether a failed attempt may be retried.
pub trait Condition<E> {
    fn can_retry(&mut self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: FnMut(&E) -> bool,
{
    fn can_retry(&mut self, error: &E) -> bool {
        self(error)
    }
}
