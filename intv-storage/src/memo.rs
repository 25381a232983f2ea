//! Identity-validated caching of values computed from storage locations.
//!
//! A memo is valid while the location's size and modification time are
//! unchanged. Stale memos are evicted on the next check.

use std::collections::HashMap;
use std::time::SystemTime;

use log::trace;
use parking_lot::Mutex;

use crate::error::Result;
use crate::location::StorageLocation;

/// How a [`FileMemo`] computes and validates its values.
pub trait MemoSource: Send + Sync {
    type Value: Clone + Send;
    type Aux: ?Sized;

    /// The sentinel reported when there is no usable memo.
    fn default_memo(&self) -> Self::Value;

    /// Whether `value` may be stored. The default sentinel must fail this.
    fn is_valid_memo(&self, value: &Self::Value) -> bool;

    fn compute_memo(&self, location: &StorageLocation, aux: &Self::Aux) -> Result<Self::Value>;
}

struct MemoEntry<T> {
    size: u64,
    modified: SystemTime,
    value: T,
}

/// File identity the memo is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Identity {
    size: u64,
    modified: SystemTime,
}

impl Identity {
    fn current(location: &StorageLocation) -> Option<Self> {
        if !location.exists() {
            return None;
        }
        let size = location.size().ok()?;
        let modified = location.last_modified().ok()?;
        Some(Self { size, modified })
    }
}

/// Cache of `S::Value` keyed by storage location.
///
/// The map lock is never held across I/O or computation, so memos for
/// different locations compute concurrently. Two callers racing on the same
/// location may both compute; the later [`add_memo`](Self::add_memo) wins.
pub struct FileMemo<S: MemoSource> {
    source: S,
    memos: Mutex<HashMap<StorageLocation, MemoEntry<S::Value>>>,
}

impl<S: MemoSource> FileMemo<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            memos: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// The memo for `location` if its size and modification time still match.
    pub fn check_memo(&self, location: &StorageLocation) -> Option<S::Value> {
        let Some(identity) = Identity::current(location) else {
            self.remove(location);
            return None;
        };
        let mut memos = self.memos.lock();
        let entry = memos.get(location)?;
        if entry.size == identity.size && entry.modified == identity.modified {
            return Some(entry.value.clone());
        }
        trace!("memo for {} is stale", location);
        memos.remove(location);
        None
    }

    /// Store `value` against the location's current identity.
    ///
    /// Fails, evicting any existing memo, if the value is invalid or the
    /// location no longer exists.
    pub fn add_memo(&self, location: &StorageLocation, value: S::Value) -> bool {
        let identity = match Identity::current(location) {
            Some(identity) if self.source.is_valid_memo(&value) => identity,
            _ => {
                self.remove(location);
                return false;
            }
        };
        self.memos.lock().insert(
            location.clone(),
            MemoEntry {
                size: identity.size,
                modified: identity.modified,
                value,
            },
        );
        true
    }

    /// Cached value if valid, otherwise compute, validate and store.
    ///
    /// `Ok(None)` means the computed value failed validation.
    pub fn check_add_memo(
        &self,
        location: &StorageLocation,
        aux: &S::Aux,
    ) -> Result<Option<S::Value>> {
        if let Some(value) = self.check_memo(location) {
            return Ok(Some(value));
        }
        let value = self.source.compute_memo(location, aux)?;
        if self.add_memo(location, value.clone()) {
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    /// Like [`check_add_memo`](Self::check_add_memo) but reports the
    /// source's default sentinel instead of `None`.
    pub fn value_or_default(&self, location: &StorageLocation, aux: &S::Aux) -> Result<S::Value> {
        Ok(self
            .check_add_memo(location, aux)?
            .unwrap_or_else(|| self.source.default_memo()))
    }

    pub fn remove(&self, location: &StorageLocation) -> bool {
        self.memos.lock().remove(location).is_some()
    }

    pub fn clear(&self) {
        self.memos.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.memos.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
