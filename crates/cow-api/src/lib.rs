#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cow_core::{BufferAddr, ConflictKind, StorageId, Token, TrackingState};
use cow_runtime::{ConflictLedger, LOG_TARGET, LedgerSink, SharedSink, default_sink};
use cow_storage::StorageHandle;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReshapeMode {
    View,
    Copy,
}

/// User-facing tensor handle owning exactly one [`StorageHandle`].
///
/// `view` aliases storage and lineage, `reshape_as_view` aliases storage
/// under a new lineage with conflict tracking on, and `clone` produces an
/// independent storage.
#[derive(Debug)]
pub struct TensorHandle {
    id: u64,
    storage: StorageHandle,
}

impl Default for TensorHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorHandle {
    /// A fresh tensor whose conflicts go to the process-wide counter.
    #[must_use]
    pub fn new() -> Self {
        Self::new_with_sink(default_sink())
    }

    #[must_use]
    pub fn new_with_sink(sink: SharedSink) -> Self {
        Self::from_storage(StorageHandle::new(sink))
    }

    #[must_use]
    pub fn from_storage(storage: StorageHandle) -> Self {
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            storage,
        }
    }

    pub fn read_data(&self) -> BufferAddr {
        self.storage.read()
    }

    pub fn write_data(&mut self) -> BufferAddr {
        self.storage.write()
    }

    #[must_use]
    pub fn view(&self) -> Self {
        Self::from_storage(self.storage.clone())
    }

    /// Aliases storage under a new lineage. If the storage has no fresh
    /// lineage left to give, the result is an independent copy instead.
    #[must_use]
    pub fn reshape_as_view(&self) -> Self {
        self.storage.enable_cow();
        let mut result = self.view();
        match result.storage.advance_group() {
            Ok(()) => result,
            Err(error) => {
                tracing::warn!(target: LOG_TARGET, %error, "reshape falls back to a copy");
                self.clone()
            }
        }
    }

    #[must_use]
    pub fn reshape(&self, mode: ReshapeMode) -> Self {
        match mode {
            ReshapeMode::View => self.reshape_as_view(),
            ReshapeMode::Copy => self.clone(),
        }
    }

    /// Rebinds this tensor onto `source`'s storage and lineage, dropping
    /// the storage it held before.
    pub fn set_storage_from(&mut self, source: &Self) {
        self.storage = source.storage.clone();
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    #[must_use]
    pub fn storage_id(&self) -> StorageId {
        self.storage.storage_id()
    }

    #[must_use]
    pub fn group_token(&self) -> Token {
        self.storage.group_token()
    }

    #[must_use]
    pub fn tracking_state(&self) -> TrackingState {
        self.storage.tracking_state()
    }

    #[must_use]
    pub fn is_alias_of(&self, other: &Self) -> bool {
        self.storage.shares_storage_with(&other.storage)
    }
}

impl Clone for TensorHandle {
    /// Independent copy: new storage, new lineage, same conflict sink.
    fn clone(&self) -> Self {
        Self::new_with_sink(Arc::clone(self.storage.storage().sink()))
    }
}

/// Builds tensors that report into one private ledger.
#[derive(Debug, Clone, Default)]
pub struct CowSession {
    sink: Arc<LedgerSink>,
}

impl CowSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn tensor(&self) -> TensorHandle {
        let sink: SharedSink = self.sink.clone();
        TensorHandle::new_with_sink(sink)
    }

    #[must_use]
    pub fn conflicts(&self) -> ConflictLedger {
        self.sink.snapshot()
    }

    #[must_use]
    pub fn conflict_count(&self) -> usize {
        self.sink.len()
    }

    #[must_use]
    pub fn conflict_count_of(&self, kind: ConflictKind) -> usize {
        self.sink.snapshot().count_kind(kind)
    }

    pub fn clear(&self) {
        self.sink.clear();
    }
}
