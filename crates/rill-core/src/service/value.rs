// Stored values
// Payload model plus the home-node reader/writer lock used during invalidation

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Where a value's payload lives besides memory
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    #[default]
    Memory,
    /// Written through to the persistence collaborator on the home node
    File,
}

mod opt_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        value.as_deref().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        Ok(Option::<Vec<u8>>::deserialize(d)?.map(Bytes::from))
    }
}

/// Versioned payload of one key; `None` payload is a tombstone
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub type_tag: u16,
    pub backend: Backend,
    #[serde(with = "opt_bytes")]
    payload: Option<Bytes>,
}

impl Value {
    pub fn new(type_tag: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            type_tag,
            backend: Backend::Memory,
            payload: Some(payload.into()),
        }
    }

    pub fn from_bytes(payload: impl Into<Bytes>) -> Self {
        Self::new(0, payload)
    }

    pub fn tombstone() -> Self {
        Self {
            type_tag: 0,
            backend: Backend::Memory,
            payload: None,
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn len(&self) -> usize {
        self.payload.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same tag and payload, wherever the payload is kept
    pub fn same_content(&self, other: &Value) -> bool {
        self.type_tag == other.type_tag && self.payload == other.payload
    }
}

/// Condition a put checks against the value stored at home
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expectation {
    #[default]
    Any,
    /// Nothing stored, or a tombstone
    Absent,
    Equals(Value),
}

impl Expectation {
    pub fn matches(&self, current: Option<&Value>) -> bool {
        match self {
            Expectation::Any => true,
            Expectation::Absent => current.is_none_or(|v| v.is_tombstone()),
            Expectation::Equals(expected) => current.is_some_and(|v| v.same_content(expected)),
        }
    }

    pub fn is_unconditional(&self) -> bool {
        matches!(self, Expectation::Any)
    }
}

/// Outcome of a compare-and-swap at home
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CasResult {
    Committed { old: Option<Value> },
    /// The stored value did not match; it is returned for a retry
    Conflict { current: Option<Value> },
}

impl CasResult {
    pub fn is_committed(&self) -> bool {
        matches!(self, CasResult::Committed { .. })
    }
}

const WRITE_LOCKED: i32 = -1;

/// A value as held in a node's store.
///
/// `rwlock` is 0 when free, positive while readers (including an in-progress
/// install) hold it and -1 once a newer value has taken over the key.
pub(crate) struct StoredValue {
    value: RwLock<Value>,
    spilled: AtomicBool,
    rwlock: AtomicI32,
    settled: Notify,
    replicas: Mutex<BTreeSet<u16>>,
}

impl StoredValue {
    /// A value just installed by a put, read-locked until its install finishes
    pub(crate) fn installing(value: Value) -> Self {
        Self::with_lock(value, 1)
    }

    /// A value with no outstanding readers, e.g. a cached copy
    pub(crate) fn settled(value: Value) -> Self {
        Self::with_lock(value, 0)
    }

    fn with_lock(value: Value, readers: i32) -> Self {
        Self {
            value: RwLock::new(value),
            spilled: AtomicBool::new(false),
            rwlock: AtomicI32::new(readers),
            settled: Notify::new(),
            replicas: Mutex::new(BTreeSet::new()),
        }
    }

    pub(crate) fn value(&self) -> Value {
        self.value.read().clone()
    }

    pub(crate) fn is_spilled(&self) -> bool {
        self.spilled.load(Ordering::SeqCst)
    }

    /// Drop the in-memory payload of a persisted value
    pub(crate) fn spill(&self) -> bool {
        let mut value = self.value.write();
        if value.backend == Backend::Memory || value.payload.is_none() {
            return false;
        }
        value.payload = None;
        self.spilled.store(true, Ordering::SeqCst);
        true
    }

    pub(crate) fn restore(&self, loaded: Value) {
        let mut value = self.value.write();
        value.payload = loaded.payload;
        self.spilled.store(false, Ordering::SeqCst);
    }

    pub(crate) fn lock_count(&self) -> i32 {
        self.rwlock.load(Ordering::SeqCst)
    }

    /// Take a reader lock; fails once the value has been superseded
    pub(crate) fn read_lock(&self) -> bool {
        let mut current = self.rwlock.load(Ordering::SeqCst);
        loop {
            if current == WRITE_LOCKED {
                return false;
            }
            match self.rwlock.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Release one reader
    pub(crate) fn lower(&self) {
        let mut current = self.rwlock.load(Ordering::SeqCst);
        while current > 0 {
            match self.rwlock.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.settled.notify_waiters();
    }

    /// Wait for every reader to leave, then mark the value superseded
    pub(crate) async fn wait_and_write_lock(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self
                .rwlock
                .compare_exchange(0, WRITE_LOCKED, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) | Err(WRITE_LOCKED) => return,
                Err(_) => notified.await,
            }
        }
    }

    /// Wait until no install or read of this value is in flight
    pub(crate) async fn wait_till_settled(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.rwlock.load(Ordering::SeqCst) <= 0 {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn add_replica(&self, idx: u16) {
        self.replicas.lock().insert(idx);
    }

    pub(crate) fn replicas(&self) -> Vec<u16> {
        self.replicas.lock().iter().copied().collect()
    }
}

impl std::fmt::Debug for StoredValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredValue")
            .field("value", &*self.value.read())
            .field("rwlock", &self.lock_count())
            .field("spilled", &self.is_spilled())
            .finish()
    }
}
