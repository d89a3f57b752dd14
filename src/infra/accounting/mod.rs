//! Usage: Bounded in-memory buffer of finalized accounting records.
//!
//! Records are appended on the request path and drained wholesale by the flusher.
//! When the buffer is full the oldest record is evicted and counted as dropped.

mod flusher;
mod rollup;
mod store;


pub use flusher::{AccountingFlusher, FlushOutcome, FlushPolicy};
pub use rollup::{build_batch, FlushBatch, RollupKey, RollupValue};
pub use store::ApplyOutcome;

use crate::domain::usage::AccountingRecord;
use crate::infra::metrics::GatewayMetrics;
use crate::shared::mutex_ext::MutexExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct BufferInner {
    records: HashMap<String, AccountingRecord>,
    order: VecDeque<String>,
}

pub struct AccountingBuffer {
    inner: Mutex<BufferInner>,
    max_records: usize,
    metrics: Arc<GatewayMetrics>,
}

impl AccountingBuffer {
    pub fn new(max_records: usize, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            inner: Mutex::new(BufferInner::default()),
            max_records: max_records.max(1),
            metrics,
        }
    }

    /// Never blocks on I/O. A record whose request id is already buffered replaces it.
    pub fn push(&self, record: AccountingRecord) {
        let mut dropped = 0u64;
        {
            let mut inner = self.inner.lock_or_recover();
            let id = record.request_id.clone();
            if inner.records.insert(id.clone(), record).is_none() {
                inner.order.push_back(id);
            }
            while inner.records.len() > self.max_records {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                if inner.records.remove(&oldest).is_some() {
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            tracing::warn!(dropped, "accounting buffer full, evicted oldest records");
            self.metrics.accounting_dropped(dropped);
        }
    }

    /// Swap the buffer out and return its records in arrival order.
    pub fn drain(&self) -> Vec<AccountingRecord> {
        let taken = {
            let mut inner = self.inner.lock_or_recover();
            std::mem::take(&mut *inner)
        };
        let BufferInner { mut records, order } = taken;
        order
            .into_iter()
            .filter_map(|id| records.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock_or_recover().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
