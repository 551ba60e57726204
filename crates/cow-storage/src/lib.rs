#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cow_core::{
    Buffer, BufferAddr, ConflictChecker, CowConflict, StorageId, Token, TrackingState,
};
use cow_runtime::{LOG_TARGET, SharedSink};

/// Every group number this storage can hand out has been used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupsExhausted {
    pub storage: StorageId,
}

impl fmt::Display for GroupsExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage {} has no unissued group tokens left", self.storage.get())
    }
}

impl std::error::Error for GroupsExhausted {}

/// One buffer plus its conflict checker, shared by every aliasing handle.
///
/// Checker transitions run under a lock owned by this storage alone. The
/// buffer is released when the last [`StorageHandle`] referencing it drops.
#[derive(Debug)]
pub struct SharedStorage {
    id: StorageId,
    buffer: Buffer,
    checker: Mutex<ConflictChecker>,
    next_group: AtomicU64,
    sink: SharedSink,
}

impl SharedStorage {
    #[must_use]
    pub fn new(sink: SharedSink) -> Self {
        let id = StorageId::next();
        Self {
            id,
            buffer: Buffer::allocate(),
            checker: Mutex::new(ConflictChecker::for_storage(id)),
            next_group: AtomicU64::new(Token::FIRST_GROUP.get() + 1),
            sink,
        }
    }

    #[must_use]
    pub fn id(&self) -> StorageId {
        self.id
    }

    pub fn read(&self, token: Token) -> BufferAddr {
        let conflict = self.checker().check_on_read(token);
        self.dispatch(conflict);
        self.buffer.data()
    }

    pub fn write(&self, token: Token) -> BufferAddr {
        let conflict = self.checker().check_on_write(token);
        self.dispatch(conflict);
        self.buffer.mutable_data()
    }

    pub fn enable_cow(&self, token: Token) {
        let mut checker = self.checker();
        if checker.creator().is_none() {
            tracing::debug!(
                target: LOG_TARGET,
                storage = self.id.get(),
                creator = token.get(),
                "cow tracking enabled"
            );
        }
        checker.enable(token);
    }

    /// Hands out a group token never issued before for this storage, or
    /// `None` once the counter is spent. The counter never wraps.
    #[must_use]
    pub fn issue_group(&self) -> Option<Token> {
        self.next_group
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |raw| raw.checked_add(1))
            .ok()
            .and_then(Token::new)
    }

    #[must_use]
    pub fn tracking_state(&self) -> TrackingState {
        self.checker().state()
    }

    #[must_use]
    pub fn creator(&self) -> Option<Token> {
        self.checker().creator()
    }

    #[must_use]
    pub fn first_writer(&self) -> Option<Token> {
        self.checker().first_writer()
    }

    #[must_use]
    pub fn note(&self) -> String {
        self.checker().note().to_string()
    }

    pub fn set_note(&self, note: impl Into<String>) {
        self.checker().set_note(note);
    }

    #[must_use]
    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    // Reporting happens after the checker lock is released so a sink may
    // inspect the storage.
    fn dispatch(&self, conflict: Option<CowConflict>) {
        if let Some(conflict) = conflict {
            self.sink.report(&conflict);
        }
    }

    fn checker(&self) -> MutexGuard<'_, ConflictChecker> {
        self.checker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Copyable front-end that accesses a [`SharedStorage`] under a group token.
///
/// Clones share the storage and keep the same group token, so a handle and
/// its copies act as one writer until [`StorageHandle::advance_group`].
#[derive(Debug, Clone)]
pub struct StorageHandle {
    storage: Arc<SharedStorage>,
    group_token: Token,
}

impl StorageHandle {
    #[must_use]
    pub fn new(sink: SharedSink) -> Self {
        Self {
            storage: Arc::new(SharedStorage::new(sink)),
            group_token: Token::FIRST_GROUP,
        }
    }

    pub fn read(&self) -> BufferAddr {
        self.storage.read(self.group_token)
    }

    pub fn write(&self) -> BufferAddr {
        self.storage.write(self.group_token)
    }

    pub fn enable_cow(&self) {
        self.storage.enable_cow(self.group_token);
    }

    /// Moves this handle onto a fresh lineage. On error the handle keeps its
    /// current token.
    pub fn advance_group(&mut self) -> Result<(), GroupsExhausted> {
        let next = self.storage.issue_group().ok_or(GroupsExhausted {
            storage: self.storage.id(),
        })?;
        tracing::debug!(
            target: LOG_TARGET,
            storage = self.storage.id().get(),
            from = self.group_token.get(),
            to = next.get(),
            "group advanced"
        );
        self.group_token = next;
        Ok(())
    }

    #[must_use]
    pub fn group_token(&self) -> Token {
        self.group_token
    }

    #[must_use]
    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    #[must_use]
    pub fn storage_id(&self) -> StorageId {
        self.storage.id()
    }

    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Number of handles currently keeping the storage alive.
    #[must_use]
    pub fn use_count(&self) -> usize {
        Arc::strong_count(&self.storage)
    }

    #[must_use]
    pub fn tracking_state(&self) -> TrackingState {
        self.storage.tracking_state()
    }
}
