#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cow_core::{ConflictKind, CowConflict};

pub const LOG_TARGET: &str = "cow_sim";

static WARN_COUNTER: AtomicU64 = AtomicU64::new(0);
static COUNTER_SCOPE_LOCK: Mutex<()> = Mutex::new(());

pub fn reset_counter() {
    WARN_COUNTER.store(0, Ordering::SeqCst);
}

#[must_use]
pub fn get_counter() -> u64 {
    WARN_COUNTER.load(Ordering::SeqCst)
}

#[must_use]
pub fn check_counter(expected: u64) -> bool {
    get_counter() == expected
}

/// Exclusive use of the process-wide warning counter.
///
/// The counter is shared by every thread, so runs that assert on it hold a
/// scope for their whole duration. Creating the scope resets the counter.
#[derive(Debug)]
pub struct CounterScope {
    _guard: MutexGuard<'static, ()>,
}

impl CounterScope {
    #[must_use]
    pub fn begin() -> Self {
        let guard = COUNTER_SCOPE_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        reset_counter();
        Self { _guard: guard }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        get_counter()
    }

    pub fn reset(&self) {
        reset_counter();
    }
}

/// Receives every conflict a storage detects.
pub trait ConflictSink: fmt::Debug + Send + Sync {
    fn report(&self, conflict: &CowConflict);
}

pub type SharedSink = Arc<dyn ConflictSink>;

#[must_use]
pub fn default_sink() -> SharedSink {
    Arc::new(CounterSink)
}

/// Bumps the process-wide counter and emits a `tracing` warning.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSink;

impl ConflictSink for CounterSink {
    fn report(&self, conflict: &CowConflict) {
        WARN_COUNTER.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(
            target: LOG_TARGET,
            kind = conflict.kind.label(),
            accessor = conflict.accessor.get(),
            first_writer = conflict.first_writer.get(),
            "{conflict}"
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ConflictSink for NullSink {
    fn report(&self, _conflict: &CowConflict) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    pub ts_unix_ms: u128,
    pub conflict: CowConflict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictLedger {
    entries: Vec<ConflictEntry>,
}

impl ConflictLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, conflict: CowConflict) {
        self.entries.push(ConflictEntry {
            ts_unix_ms: now_unix_ms(),
            conflict,
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[ConflictEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn count_kind(&self, kind: ConflictKind) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.conflict.kind == kind)
            .count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Records conflicts into a private ledger instead of the global counter.
#[derive(Debug, Default)]
pub struct LedgerSink {
    ledger: Mutex<ConflictLedger>,
}

impl LedgerSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> ConflictLedger {
        self.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, ConflictLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConflictSink for LedgerSink {
    fn report(&self, conflict: &CowConflict) {
        tracing::debug!(target: LOG_TARGET, "ledger recorded {conflict}");
        self.lock().record(conflict.clone());
    }
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}
