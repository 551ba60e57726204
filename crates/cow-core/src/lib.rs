#![forbid(unsafe_code)]

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BUFFER_ADDR: AtomicU64 = AtomicU64::new(0);
static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

pub const DEFAULT_NOTE: &str = "<info>";

/// Identity of whoever performs an access.
///
/// A `Token` is always set; the unset sentinel is `Option::<Token>::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(NonZeroU64);

impl Token {
    /// Group token handed to the first handle of every fresh storage.
    pub const FIRST_GROUP: Self = Self(NonZeroU64::MIN);

    /// Returns `None` for the raw value `0`, which is reserved as the null token.
    #[must_use]
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageId(u64);

impl StorageId {
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage:{}", self.0)
    }
}

/// Address of a buffer. Only identity is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferAddr(NonZeroU64);

impl BufferAddr {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// Opaque handle to a raw memory region.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    addr: BufferAddr,
}

impl Buffer {
    #[must_use]
    pub fn allocate() -> Self {
        let raw = NEXT_BUFFER_ADDR.fetch_add(1, Ordering::Relaxed);
        Self {
            addr: BufferAddr(NonZeroU64::MIN.saturating_add(raw)),
        }
    }

    #[must_use]
    pub fn data(&self) -> BufferAddr {
        self.addr
    }

    #[must_use]
    pub fn mutable_data(&self) -> BufferAddr {
        self.addr
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    WriteAfterWrite,
    ReadAfterWrite,
}

impl ConflictKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::WriteAfterWrite => "WRITE THEN WRITE",
            Self::ReadAfterWrite => "WRITE THEN READ",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An access that would have observed a different buffer under real
/// copy-on-write semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CowConflict {
    pub kind: ConflictKind,
    pub storage_id: Option<StorageId>,
    pub accessor: Token,
    pub first_writer: Token,
    pub creator: Token,
    pub note: String,
}

impl fmt::Display for CowConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "COW BEHAVIOR WARNING: {}", self.kind)?;
        if let Some(storage_id) = self.storage_id {
            write!(f, " {storage_id}")?;
        }
        write!(
            f,
            " accessor={} first_writer={} creator={} note={}",
            self.accessor, self.first_writer, self.creator, self.note
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    Untracked,
    Tracked { first_writer: Option<Token> },
}

impl TrackingState {
    #[must_use]
    pub fn is_tracked(self) -> bool {
        matches!(self, Self::Tracked { .. })
    }
}

/// Per-buffer copy-on-write simulation state.
///
/// Tracking starts on the first [`ConflictChecker::enable`]. The first write
/// observed afterwards pins the owning lineage; every later access from a
/// different token is returned as a [`CowConflict`]. The checker never counts
/// or logs conflicts itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictChecker {
    storage_id: Option<StorageId>,
    creator: Option<Token>,
    first_writer: Option<Token>,
    note: String,
}

impl Default for ConflictChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictChecker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            storage_id: None,
            creator: None,
            first_writer: None,
            note: DEFAULT_NOTE.to_string(),
        }
    }

    #[must_use]
    pub fn for_storage(storage_id: StorageId) -> Self {
        Self {
            storage_id: Some(storage_id),
            ..Self::new()
        }
    }

    /// A checker that starts out tracked with `creator` already recorded.
    #[must_use]
    pub fn enabled_by(creator: Token) -> Self {
        Self {
            creator: Some(creator),
            ..Self::new()
        }
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    pub fn set_note(&mut self, note: impl Into<String>) {
        self.note = note.into();
    }

    pub fn enable(&mut self, creator: Token) {
        if self.creator.is_none() {
            self.creator = Some(creator);
        }
    }

    pub fn check_on_write(&mut self, writer: Token) -> Option<CowConflict> {
        let conflict = self.mismatch(writer, ConflictKind::WriteAfterWrite);
        if self.creator.is_some() && self.first_writer.is_none() {
            self.first_writer = Some(writer);
        }
        conflict
    }

    #[must_use]
    pub fn check_on_read(&self, reader: Token) -> Option<CowConflict> {
        self.mismatch(reader, ConflictKind::ReadAfterWrite)
    }

    #[must_use]
    pub fn creator(&self) -> Option<Token> {
        self.creator
    }

    #[must_use]
    pub fn first_writer(&self) -> Option<Token> {
        self.first_writer
    }

    #[must_use]
    pub fn note(&self) -> &str {
        &self.note
    }

    #[must_use]
    pub fn storage_id(&self) -> Option<StorageId> {
        self.storage_id
    }

    #[must_use]
    pub fn state(&self) -> TrackingState {
        match self.creator {
            None => TrackingState::Untracked,
            Some(_) => TrackingState::Tracked {
                first_writer: self.first_writer,
            },
        }
    }

    fn mismatch(&self, accessor: Token, kind: ConflictKind) -> Option<CowConflict> {
        let creator = self.creator?;
        let first_writer = self.first_writer?;
        if first_writer == accessor {
            return None;
        }
        Some(CowConflict {
            kind,
            storage_id: self.storage_id,
            accessor,
            first_writer,
            creator,
            note: self.note.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        Buffer, ConflictChecker, ConflictKind, DEFAULT_NOTE, StorageId, Token, TrackingState,
    };

    fn token(raw: u64) -> Token {
        Token::new(raw).expect("non-zero token")
    }

    #[derive(Debug, Clone, Copy)]
    enum Access {
        Enable(u64),
        Read(u64),
        Write(u64),
    }

    fn access_strategy() -> impl Strategy<Value = Access> {
        prop_oneof![
            (1u64..=4).prop_map(Access::Enable),
            (1u64..=4).prop_map(Access::Read),
            (1u64..=4).prop_map(Access::Write),
        ]
    }

    #[test]
    fn zero_is_reserved_for_the_null_token() {
        assert!(Token::new(0).is_none());
        assert_eq!(Token::FIRST_GROUP.get(), 1);
        assert!(token(2) > Token::FIRST_GROUP);
    }

    #[test]
    fn buffers_get_distinct_non_zero_addresses() {
        let first = Buffer::allocate();
        let second = Buffer::allocate();
        assert_ne!(first.data(), second.data());
        assert_eq!(first.data(), first.mutable_data());
        assert!(first.data().get() > 0);
    }

    #[test]
    fn untracked_checker_never_warns_or_records() {
        let mut checker = ConflictChecker::new();
        assert!(checker.check_on_write(token(1)).is_none());
        assert!(checker.check_on_write(token(2)).is_none());
        assert!(checker.check_on_read(token(3)).is_none());
        assert_eq!(checker.first_writer(), None);
        assert_eq!(checker.state(), TrackingState::Untracked);
    }

    #[test]
    fn enable_is_idempotent() {
        let mut checker = ConflictChecker::new();
        checker.enable(token(1));
        checker.enable(token(5));
        assert_eq!(checker.creator(), Some(token(1)));
        assert_eq!(
            checker.state(),
            TrackingState::Tracked { first_writer: None }
        );
    }

    #[test]
    fn reads_before_first_write_are_silent() {
        let mut checker = ConflictChecker::new();
        checker.enable(token(1));
        assert!(checker.check_on_read(token(2)).is_none());
        assert!(checker.check_on_read(token(1)).is_none());
        assert_eq!(checker.first_writer(), None);
    }

    #[test]
    fn first_write_pins_the_owner() {
        let mut checker = ConflictChecker::new();
        checker.enable(token(1));
        assert!(checker.check_on_write(token(2)).is_none());
        assert_eq!(checker.first_writer(), Some(token(2)));

        assert!(checker.check_on_write(token(2)).is_none());
        assert!(checker.check_on_read(token(2)).is_none());

        let conflict = checker
            .check_on_write(token(1))
            .expect("foreign writer must conflict");
        assert_eq!(conflict.kind, ConflictKind::WriteAfterWrite);
        assert_eq!(conflict.accessor, token(1));
        assert_eq!(conflict.first_writer, token(2));
        assert_eq!(conflict.creator, token(1));
        assert_eq!(checker.first_writer(), Some(token(2)));
    }

    #[test]
    fn foreign_read_reports_read_after_write() {
        let mut checker = ConflictChecker::for_storage(StorageId::next()).with_note("reshape");
        checker.enable(token(1));
        let _ = checker.check_on_write(token(1));

        let conflict = checker
            .check_on_read(token(3))
            .expect("foreign reader must conflict");
        assert_eq!(conflict.kind, ConflictKind::ReadAfterWrite);
        assert_eq!(conflict.note, "reshape");
        assert_eq!(conflict.storage_id, checker.storage_id());

        let rendered = conflict.to_string();
        assert!(rendered.starts_with("COW BEHAVIOR WARNING: WRITE THEN READ"));
        assert!(rendered.contains("accessor=#3"));
    }

    #[test]
    fn enabled_by_starts_tracked() {
        let checker = ConflictChecker::enabled_by(token(7));
        assert_eq!(checker.creator(), Some(token(7)));
        assert_eq!(checker.note(), DEFAULT_NOTE);
        assert!(checker.state().is_tracked());
    }

    proptest! {
        #[test]
        fn prop_checker_matches_reference_model(
            accesses in prop::collection::vec(access_strategy(), 0..48),
        ) {
            let mut checker = ConflictChecker::new();
            let mut creator: Option<u64> = None;
            let mut first_writer: Option<u64> = None;

            for access in accesses {
                match access {
                    Access::Enable(raw) => {
                        checker.enable(token(raw));
                        creator.get_or_insert(raw);
                    }
                    Access::Read(raw) => {
                        let expected = creator.is_some()
                            && first_writer.is_some_and(|owner| owner != raw);
                        prop_assert_eq!(checker.check_on_read(token(raw)).is_some(), expected);
                    }
                    Access::Write(raw) => {
                        let expected = creator.is_some()
                            && first_writer.is_some_and(|owner| owner != raw);
                        prop_assert_eq!(checker.check_on_write(token(raw)).is_some(), expected);
                        if creator.is_some() && first_writer.is_none() {
                            first_writer = Some(raw);
                        }
                    }
                }
                prop_assert_eq!(checker.creator().map(Token::get), creator);
                prop_assert_eq!(checker.first_writer().map(Token::get), first_writer);
            }
        }

        #[test]
        fn prop_first_writer_is_set_at_most_once(
            writers in prop::collection::vec(1u64..=6, 1..24),
        ) {
            let mut checker = ConflictChecker::enabled_by(token(1));
            let owner = token(writers[0]);
            for raw in writers {
                let conflict = checker.check_on_write(token(raw));
                prop_assert_eq!(checker.first_writer(), Some(owner));
                prop_assert_eq!(conflict.is_some(), token(raw) != owner);
            }
        }
    }
}
