//! Failure-injecting document store.
//!
//! Wraps a `MemoryDocumentStore` and fails selected calls with a transient
//! store error, which is what the engine's retry loop and circuit breaker
//! react to. It can also slow every call down, or apply an update and then
//! hold back its acknowledgement so the caller times out on a write that
//! did land.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::Rng;
use vigil_core::{
    store::{memory::MemoryDocumentStore, StoreFuture},
    CoreError, Document, DocumentStore, Filter, OrderBy,
};

/// Document store that fails on demand.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: Arc<MemoryDocumentStore>,
    outage: AtomicBool,
    fail_next: AtomicU32,
    failure_rate_millis: AtomicU32,
    calls: AtomicU64,
    injected: AtomicU64,
    latency_micros: AtomicU64,
    ack_delay_micros: AtomicU64,
}

impl FlakyStore {
    /// Wraps a fresh in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing store so the test can inspect it directly.
    pub fn wrap(inner: Arc<MemoryDocumentStore>) -> Self {
        Self { inner, ..Self::default() }
    }

    /// Underlying store.
    pub fn inner(&self) -> &Arc<MemoryDocumentStore> {
        &self.inner
    }

    /// Fails every call until `set_outage(false)`.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Fails the next `count` calls.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fails each call with probability `rate` (clamped to 0..=1).
    pub fn set_failure_rate(&self, rate: f64) {
        let millis = (rate.clamp(0.0, 1.0) * 1000.0).round() as u32;
        self.failure_rate_millis.store(millis, Ordering::SeqCst);
    }

    /// Delays every call by `latency` before it reaches the inner store.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_micros.store(latency.as_micros() as u64, Ordering::SeqCst);
    }

    /// Applies the next conditional update, then waits `delay` before
    /// acknowledging it.
    pub fn delay_next_update_ack(&self, delay: Duration) {
        self.ack_delay_micros.store(delay.as_micros() as u64, Ordering::SeqCst);
    }

    /// Calls received, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls failed by injection.
    pub fn injected_failures(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let fail = self.outage.load(Ordering::SeqCst)
            || self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            || self.random_failure();

        if fail {
            self.injected.fetch_add(1, Ordering::SeqCst);
        }
        fail
    }

    fn random_failure(&self) -> bool {
        let millis = self.failure_rate_millis.load(Ordering::SeqCst);
        millis > 0 && rand::rng().random_range(0..1000) < millis
    }

    fn slowed<'a, T: Send + 'a>(&self, call: StoreFuture<'a, T>) -> StoreFuture<'a, T> {
        match self.latency_micros.load(Ordering::SeqCst) {
            0 => call,
            micros => Box::pin(async move {
                tokio::time::sleep(Duration::from_micros(micros)).await;
                call.await
            }),
        }
    }
}

fn injected<'a, T: Send + 'a>() -> StoreFuture<'a, T> {
    Box::pin(async { Err(CoreError::store("injected store failure")) })
}

impl DocumentStore for FlakyStore {
    fn insert(&self, collection: &str, document: Document) -> StoreFuture<'_, String> {
        if self.should_fail() {
            return injected();
        }
        self.slowed(self.inner.insert(collection, document))
    }

    fn batch_insert(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> StoreFuture<'_, Vec<String>> {
        if self.should_fail() {
            return injected();
        }
        self.slowed(self.inner.batch_insert(collection, documents))
    }

    fn conditional_update(
        &self,
        collection: &str,
        id: &str,
        conditions: Vec<Filter>,
        fields: Document,
    ) -> StoreFuture<'_, bool> {
        if self.should_fail() {
            return injected();
        }
        let write = self.inner.conditional_update(collection, id, conditions, fields);
        let write: StoreFuture<'_, bool> = match self.ack_delay_micros.swap(0, Ordering::SeqCst) {
            0 => write,
            micros => Box::pin(async move {
                let applied = write.await?;
                tokio::time::sleep(Duration::from_micros(micros)).await;
                Ok(applied)
            }),
        };
        self.slowed(write)
    }

    fn query(
        &self,
        collection: &str,
        filters: Vec<Filter>,
        order_by: Vec<OrderBy>,
        limit: Option<usize>,
    ) -> StoreFuture<'_, Vec<Document>> {
        if self.should_fail() {
            return injected();
        }
        self.slowed(self.inner.query(collection, filters, order_by, limit))
    }

    fn batch_delete(&self, collection: &str, ids: Vec<String>) -> StoreFuture<'_, usize> {
        if self.should_fail() {
            return injected();
        }
        self.slowed(self.inner.batch_delete(collection, ids))
    }
}
