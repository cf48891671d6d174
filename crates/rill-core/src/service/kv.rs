// Key/value store
// Home-routed get/put/remove with replica tracking and invalidation

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use rill_common::{Result, RillError};

use crate::service::cloud::Cloud;
use crate::service::futures::Futures;
use crate::service::key::Key;
use crate::service::persist::Persist;
use crate::service::rpc::{CallOptions, Priority, RemoteTask, TaskContext, TaskOutcome};
use crate::service::runtime::ClusterRuntime;
use crate::service::value::{Backend, CasResult, Expectation, StoredValue, Value};

/// This node's slice of the store: values it is home for plus cached copies
pub(crate) struct KvStore {
    pub(crate) store: DashMap<Key, Arc<StoredValue>>,
    persist: Option<Arc<dyn Persist>>,
    put_locks: DashMap<Key, Arc<Mutex<()>>>,
}

impl KvStore {
    pub(crate) fn new(persist: Option<Arc<dyn Persist>>) -> Self {
        Self {
            store: DashMap::new(),
            persist,
            put_locks: DashMap::new(),
        }
    }

    pub(crate) fn get_stored(&self, key: &Key) -> Option<Arc<StoredValue>> {
        self.store.get(key).map(|e| e.clone())
    }

    /// Keep a copy fetched from home unless something newer got here first
    pub(crate) fn cache_if_absent(&self, key: Key, value: Value) {
        self.store
            .entry(key)
            .or_insert_with(|| Arc::new(StoredValue::settled(value)));
    }

    pub(crate) fn cache(&self, key: Key, value: Value) {
        self.store.insert(key, Arc::new(StoredValue::settled(value)));
    }

    pub(crate) fn forget(&self, key: &Key) -> bool {
        self.store.remove(key).is_some()
    }

    /// The stored value with its payload loaded back if it was spilled
    pub(crate) async fn materialize(&self, key: &Key, stored: &StoredValue) -> Result<Value> {
        if !stored.is_spilled() {
            return Ok(stored.value());
        }
        let persist = self.persist.as_ref().ok_or_else(|| {
            RillError::InternalError(format!("value of {} spilled without a store", key))
        })?;
        match persist.load(key).await? {
            Some(loaded) => {
                trace!(key = %key, "Reloaded spilled value");
                stored.restore(loaded);
                Ok(stored.value())
            }
            None => Err(RillError::InternalError(format!(
                "spilled value of {} missing from the store",
                key
            ))),
        }
    }

    async fn write_through(&self, key: &Key, new: &Value, old: Option<&Value>) -> Result<()> {
        let Some(persist) = &self.persist else {
            if new.backend != Backend::Memory {
                return Err(RillError::ConfigError(format!(
                    "no store configured for {:?} values",
                    new.backend
                )));
            }
            return Ok(());
        };
        if new.backend == persist.backend() && !new.is_tombstone() {
            persist.store(key, new).await
        } else if old.is_some_and(|o| o.backend == persist.backend()) {
            persist.delete(key).await
        } else {
            Ok(())
        }
    }

    fn put_lock(&self, key: &Key) -> Arc<Mutex<()>> {
        self.put_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_put_lock(&self, key: &Key) {
        // Nobody but the map and the releasing caller holds it
        self.put_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) <= 2);
    }

    pub(crate) fn len(&self) -> usize {
        self.store.len()
    }
}

/// Fetch the current value from its home, registering the caller as a replica
#[derive(Debug, Serialize, Deserialize)]
pub struct GetKey {
    pub key: Key,
}

impl RemoteTask for GetKey {
    const TYPE_NAME: &'static str = "rill.GetKey";
    const PRIORITY: Priority = Priority::High;
    type Output = Option<Value>;

    async fn execute(self, ctx: TaskContext) -> Result<TaskOutcome<Option<Value>>> {
        let rt = ctx.runtime;
        loop {
            let Some(stored) = rt.kv.get_stored(&self.key) else {
                return Ok(TaskOutcome::new(None));
            };
            // A superseded value is already replaced in the map
            if !stored.read_lock() {
                tokio::task::yield_now().await;
                continue;
            }
            let value = match rt.kv.materialize(&self.key, &stored).await {
                Ok(value) => value,
                Err(e) => {
                    stored.lower();
                    return Err(e);
                }
            };
            if value.is_tombstone() {
                stored.lower();
                return Ok(TaskOutcome::new(None));
            }
            if ctx.sender != rt.address() {
                stored.add_replica(rt.nodes.intern(ctx.sender).unique_idx());
            }
            // Held until the reader confirms, so invalidation cannot overtake the reply
            return Ok(TaskOutcome::with_ack_ack(Some(value), move || stored.lower()));
        }
    }
}

/// Compare-and-swap a value at its home
#[derive(Debug, Serialize, Deserialize)]
pub struct PutKey {
    pub key: Key,
    pub value: Value,
    pub expect: Expectation,
    /// The sender keeps the new value cached and becomes a replica
    pub cache_at_sender: bool,
}

impl RemoteTask for PutKey {
    const TYPE_NAME: &'static str = "rill.PutKey";
    type Output = CasResult;

    async fn execute(self, ctx: TaskContext) -> Result<TaskOutcome<CasResult>> {
        let rt = ctx.runtime;
        rt.ensure_home(&self.key)?;
        let replica = self
            .cache_at_sender
            .then(|| rt.nodes.intern(ctx.sender).unique_idx());
        let expect = self.expect;
        let swap = rt
            .cas_on_home(&self.key, self.value, replica, Some(ctx.sender), |_, current| {
                expect.matches(current)
            })
            .await?;
        match swap {
            // The next put of this key waits until the sender has cached ours
            HomeSwap::Committed {
                old,
                hold: Some(hold),
                ..
            } => Ok(TaskOutcome::with_ack_ack(
                CasResult::Committed { old },
                move || drop(hold),
            )),
            swap => Ok(TaskOutcome::new(swap.into_cas())),
        }
    }
}

/// Drop a cached copy
#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateKey {
    pub key: Key,
}

impl RemoteTask for InvalidateKey {
    const TYPE_NAME: &'static str = "rill.InvalidateKey";
    const PRIORITY: Priority = Priority::High;
    type Output = ();

    async fn execute(self, ctx: TaskContext) -> Result<TaskOutcome<()>> {
        if ctx.runtime.kv.forget(&self.key) {
            trace!(key = %self.key, home = %ctx.sender, "Invalidated cached value");
        }
        Ok(TaskOutcome::new(()))
    }
}

/// Reader lock on a just-installed value, released on drop
pub(crate) struct ReadHold(Arc<StoredValue>);

impl Drop for ReadHold {
    fn drop(&mut self) {
        self.0.lower();
    }
}

/// What a home-node swap did
pub(crate) enum HomeSwap {
    Committed {
        old: Option<Value>,
        new: Value,
        /// Present when the swap recorded a replica for the writer
        hold: Option<ReadHold>,
    },
    Conflict {
        current: Option<Value>,
    },
}

impl HomeSwap {
    fn into_cas(self) -> CasResult {
        match self {
            HomeSwap::Committed { old, .. } => CasResult::Committed { old },
            HomeSwap::Conflict { current } => CasResult::Conflict { current },
        }
    }
}

fn live(value: Value) -> Option<Value> {
    (!value.is_tombstone()).then_some(value)
}

impl ClusterRuntime {
    fn home_of(&self, key: &Key, cloud: &Cloud) -> Result<SocketAddr> {
        key.home(cloud)
            .ok_or_else(|| RillError::InternalError(format!("no home for {}: cloud is empty", key)))
    }

    pub(crate) fn ensure_home(&self, key: &Key) -> Result<()> {
        let home = self.home_of(key, &self.cloud())?;
        if home != self.address() {
            return Err(RillError::IllegalArgument(format!(
                "{} is homed on {}, not {}",
                key,
                home,
                self.address()
            )));
        }
        Ok(())
    }

    /// Current value of `key`, from the local store or its home
    pub async fn get(self: &Arc<Self>, key: &Key) -> Result<Option<Value>> {
        let cloud = self.lock_cloud("first key/value access").await?;
        if let Some(stored) = self.kv.get_stored(key) {
            return Ok(live(self.kv.materialize(key, &stored).await?));
        }
        let home = self.home_of(key, &cloud)?;
        if home == self.address() {
            return Ok(None);
        }

        let kv = self.kv.clone();
        let cached = key.clone();
        let options = CallOptions::new()
            .coalesce(key.bytes().clone())
            .on_ack(move |value: &Option<Value>| {
                if let Some(value) = value {
                    kv.cache_if_absent(cached, value.clone());
                }
            });
        let handle = self
            .call_with(home, GetKey { key: key.clone() }, options)
            .await?;
        Ok(handle.get().await?.and_then(live))
    }

    /// Unconditional write; returns the value it replaced
    pub async fn put(self: &Arc<Self>, key: &Key, value: Value) -> Result<Option<Value>> {
        match self.put_if_match(key, value, Expectation::Any).await? {
            CasResult::Committed { old } => Ok(old),
            CasResult::Conflict { .. } => Err(RillError::InternalError(format!(
                "unconditional put of {} reported a conflict",
                key
            ))),
        }
    }

    /// Delete `key`; returns the value it held
    pub async fn remove(self: &Arc<Self>, key: &Key) -> Result<Option<Value>> {
        match self
            .put_if_match(key, Value::tombstone(), Expectation::Any)
            .await?
        {
            CasResult::Committed { old } => Ok(old),
            CasResult::Conflict { .. } => Err(RillError::InternalError(format!(
                "unconditional remove of {} reported a conflict",
                key
            ))),
        }
    }

    /// Write `value` only if the stored value satisfies `expect`
    pub async fn put_if_match(
        self: &Arc<Self>,
        key: &Key,
        value: Value,
        expect: Expectation,
    ) -> Result<CasResult> {
        let cloud = self.lock_cloud("first key/value write").await?;
        let home = self.home_of(key, &cloud)?;
        if home == self.address() {
            let result = self
                .cas_on_home(key, value, None, None, |_, current| expect.matches(current))
                .await?;
            return Ok(result.into_cas());
        }

        // Puts from this node to one key leave in order
        let lock = self.kv.put_lock(key);
        let result = {
            let _guard = lock.lock().await;
            let cache_here = expect.is_unconditional() && !value.is_tombstone();
            let mut options = CallOptions::new();
            if cache_here {
                // Cached before the ACKACK frees home to invalidate it
                let kv = self.kv.clone();
                let cached = key.clone();
                let value = value.clone();
                options = options.on_ack(move |result: &CasResult| {
                    if result.is_committed() {
                        kv.cache(cached, value);
                    }
                });
            }
            let task = PutKey {
                key: key.clone(),
                value,
                expect,
                cache_at_sender: cache_here,
            };
            let result = match self.call_with(home, task, options).await {
                Ok(handle) => handle.get().await,
                Err(e) => Err(e),
            };
            if !(cache_here && matches!(result, Ok(CasResult::Committed { .. }))) {
                self.kv.forget(key);
            }
            result
        };
        self.kv.release_put_lock(key);
        drop(lock);
        result
    }

    /// Swap in `value` at home when `accept(current entry, current value)`
    /// holds, then invalidate every replica of the value it replaced.
    ///
    /// `replica` is recorded on the new value before it becomes visible;
    /// `skip` is left out of the invalidation round.
    pub(crate) async fn cas_on_home(
        self: &Arc<Self>,
        key: &Key,
        value: Value,
        replica: Option<u16>,
        skip: Option<SocketAddr>,
        accept: impl Fn(Option<&Arc<StoredValue>>, Option<&Value>) -> bool,
    ) -> Result<HomeSwap> {
        let new = Arc::new(StoredValue::installing(value.clone()));
        let hold = replica.map(|idx| {
            new.add_replica(idx);
            new.read_lock();
            ReadHold(new.clone())
        });

        let (old, old_value) = loop {
            let current = self.kv.get_stored(key);
            let current_value = match &current {
                Some(stored) => self.kv.materialize(key, stored).await.map(live)?,
                None => None,
            };
            if !accept(current.as_ref(), current_value.as_ref()) {
                return Ok(HomeSwap::Conflict {
                    current: current_value,
                });
            }
            let swapped = match self.kv.store.entry(key.clone()) {
                dashmap::Entry::Occupied(mut e) => match &current {
                    Some(stored) if Arc::ptr_eq(e.get(), stored) => {
                        e.insert(new.clone());
                        true
                    }
                    _ => false,
                },
                dashmap::Entry::Vacant(e) => {
                    if current.is_none() {
                        e.insert(new.clone());
                        true
                    } else {
                        false
                    }
                }
            };
            if swapped {
                break (current, current_value);
            }
            trace!(key = %key, "Lost a swap race, retrying");
        };

        let settled = self.settle_swap(key, &value, old.as_ref(), old_value.as_ref(), skip).await;
        new.lower();
        if value.is_tombstone() {
            self.kv.store.remove_if(key, |_, v| Arc::ptr_eq(v, &new));
        }
        settled?;
        debug!(key = %key, tombstone = value.is_tombstone(), "Committed value at home");
        Ok(HomeSwap::Committed {
            old: old_value,
            new: value,
            hold,
        })
    }

    async fn settle_swap(
        self: &Arc<Self>,
        key: &Key,
        value: &Value,
        old: Option<&Arc<StoredValue>>,
        old_value: Option<&Value>,
        skip: Option<SocketAddr>,
    ) -> Result<()> {
        if let Err(e) = self.kv.write_through(key, value, old_value).await {
            warn!(key = %key, error = %e, "Write-through failed");
            return Err(e);
        }
        let Some(old) = old else {
            return Ok(());
        };

        // Waits out readers and any earlier put still invalidating
        old.wait_and_write_lock().await;
        let pending = Futures::new();
        for idx in old.replicas() {
            let Some(node) = self.nodes.by_index(idx) else {
                continue;
            };
            let addr = node.addr();
            if addr == self.address() || Some(addr) == skip {
                continue;
            }
            let handle = self.call(addr, InvalidateKey { key: key.clone() }).await?;
            pending.add(handle);
            metrics::counter!("rill_kv_invalidations_total").increment(1);
        }
        if !pending.is_empty() {
            trace!(key = %key, replicas = pending.len(), "Waiting for invalidations");
        }
        pending.block_for_pending().await
    }

    /// Drop the in-memory payload of a persisted value this node is home for
    pub async fn spill(self: &Arc<Self>, key: &Key) -> Result<bool> {
        self.lock_cloud("key/value spill").await?;
        self.ensure_home(key)?;
        if self.kv.persist.is_none() {
            return Ok(false);
        }
        Ok(self.kv.get_stored(key).is_some_and(|stored| stored.spill()))
    }

    /// Whether a value or cached copy of `key` sits on this node
    pub fn is_local(&self, key: &Key) -> bool {
        self.kv.get_stored(key).is_some()
    }

    /// Number of values and cached copies on this node
    pub fn local_key_count(&self) -> usize {
        self.kv.len()
    }
}
