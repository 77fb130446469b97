//! Error injection controller for KV store testing.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Forces failures and latency on the operations of a
/// [`SimpleKVStore`](super::SimpleKVStore).
#[derive(Debug, Default)]
pub struct KVErrorInjector {
    /// Fail the next N get operations.
    fail_next_gets: AtomicUsize,
    /// Fail the next N compare-and-swap operations before they are applied.
    fail_next_cas: AtomicUsize,
    /// Apply the next N compare-and-swap operations but report a failure to the caller.
    lose_next_cas_responses: AtomicUsize,
    /// Fail the next N list operations.
    fail_next_lists: AtomicUsize,
    get_latency_ms: AtomicU64,
    cas_latency_ms: AtomicU64,
    list_latency_ms: AtomicU64,
}

impl KVErrorInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_gets(&self, count: usize) {
        self.fail_next_gets.store(count, Ordering::Relaxed);
    }

    pub fn fail_cas(&self, count: usize) {
        self.fail_next_cas.store(count, Ordering::Relaxed);
    }

    /// The next `count` writes succeed in the store, yet the writer sees an error, as if the
    /// response got lost on the way back.
    pub fn lose_cas_responses(&self, count: usize) {
        self.lose_next_cas_responses
            .store(count, Ordering::Relaxed);
    }

    pub fn fail_lists(&self, count: usize) {
        self.fail_next_lists.store(count, Ordering::Relaxed);
    }

    pub fn set_get_latency(&self, ms: u64) {
        self.get_latency_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_cas_latency(&self, ms: u64) {
        self.cas_latency_ms.store(ms, Ordering::Relaxed);
    }

    pub fn set_list_latency(&self, ms: u64) {
        self.list_latency_ms.store(ms, Ordering::Relaxed);
    }

    /// Clears every injected failure and latency.
    pub fn reset(&self) {
        for counter in [
            &self.fail_next_gets,
            &self.fail_next_cas,
            &self.lose_next_cas_responses,
            &self.fail_next_lists,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for latency in [
            &self.get_latency_ms,
            &self.cas_latency_ms,
            &self.list_latency_ms,
        ] {
            latency.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn should_fail_get(&self) -> bool {
        Self::decrement_counter(&self.fail_next_gets)
    }

    pub(crate) fn should_fail_cas(&self) -> bool {
        Self::decrement_counter(&self.fail_next_cas)
    }

    pub(crate) fn should_lose_cas_response(&self) -> bool {
        Self::decrement_counter(&self.lose_next_cas_responses)
    }

    pub(crate) fn should_fail_list(&self) -> bool {
        Self::decrement_counter(&self.fail_next_lists)
    }

    /// Returns true if the counter was above zero, and decrements it.
    fn decrement_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }

    pub(crate) async fn apply_get_latency(&self) {
        Self::apply_latency(&self.get_latency_ms).await;
    }

    pub(crate) async fn apply_cas_latency(&self) {
        Self::apply_latency(&self.cas_latency_ms).await;
    }

    pub(crate) async fn apply_list_latency(&self) {
        Self::apply_latency(&self.list_latency_ms).await;
    }

    async fn apply_latency(latency_ms: &AtomicU64) {
        let ms = latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}
