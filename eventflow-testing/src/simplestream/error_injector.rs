use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Forces failures and latency on a [`SimpleStream`](super::SimpleStream) and its cursors.
#[derive(Debug, Default)]
pub struct StreamErrorInjector {
    fail_next_lists: AtomicUsize,
    fail_next_opens: AtomicUsize,
    fail_next_reads: AtomicUsize,
    read_latency_ms: AtomicU64,
}

impl StreamErrorInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_lists(&self, count: usize) {
        self.fail_next_lists.store(count, Ordering::Relaxed);
    }

    pub fn fail_opens(&self, count: usize) {
        self.fail_next_opens.store(count, Ordering::Relaxed);
    }

    /// Fails the next `count` cursor reads, across all cursors.
    pub fn fail_reads(&self, count: usize) {
        self.fail_next_reads.store(count, Ordering::Relaxed);
    }

    pub fn set_read_latency(&self, ms: u64) {
        self.read_latency_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn should_fail_list(&self) -> bool {
        Self::decrement_counter(&self.fail_next_lists)
    }

    pub(crate) fn should_fail_open(&self) -> bool {
        Self::decrement_counter(&self.fail_next_opens)
    }

    pub(crate) fn should_fail_read(&self) -> bool {
        Self::decrement_counter(&self.fail_next_reads)
    }

    fn decrement_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }

    pub(crate) async fn apply_read_latency(&self) {
        let ms = self.read_latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}
