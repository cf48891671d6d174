// Atomic transactions
// Compare-and-swap retry loop run on a key's home node

use std::sync::Arc;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, trace};

use rill_common::Result;

use crate::service::key::Key;
use crate::service::kv::HomeSwap;
use crate::service::rpc::{RemoteTask, TaskContext, TaskOutcome};
use crate::service::runtime::ClusterRuntime;
use crate::service::value::Value;

/// A read-modify-write transaction shipped to the home of its key.
///
/// `atomic` may run several times when other writers win the race; returning
/// `None` aborts without writing. `on_success` runs once, on the home node,
/// with the value the commit replaced.
pub trait Atomic: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Cluster-wide name of this transaction type
    const TYPE_NAME: &'static str;

    fn atomic(&self, old: Option<&Value>) -> Option<Value>;

    fn on_success(&self, _old: Option<&Value>) {}
}

/// How a transaction ended
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicOutcome {
    Committed { old: Option<Value>, new: Value },
    /// The transaction declined to write; `current` is what it last saw
    Aborted { current: Option<Value> },
}

impl AtomicOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, AtomicOutcome::Committed { .. })
    }

    /// Value of the key once the transaction finished
    pub fn value(&self) -> Option<&Value> {
        match self {
            AtomicOutcome::Committed { new, .. } => Some(new),
            AtomicOutcome::Aborted { current } => current.as_ref(),
        }
    }
}

/// Carries a transaction to the home node
#[derive(Debug, Serialize, Deserialize)]
pub struct AtomicTask<A> {
    pub key: Key,
    pub tx: A,
}

impl<A: Atomic> RemoteTask for AtomicTask<A> {
    const TYPE_NAME: &'static str = A::TYPE_NAME;
    type Output = AtomicOutcome;

    async fn execute(self, ctx: TaskContext) -> Result<TaskOutcome<AtomicOutcome>> {
        let rt = ctx.runtime;
        rt.ensure_home(&self.key)?;
        rt.run_atomic(&self.key, &self.tx).await.map(TaskOutcome::new)
    }
}

impl ClusterRuntime {
    /// Run `tx` against `key` on its home node until it commits or aborts
    pub async fn atomic<A: Atomic>(self: &Arc<Self>, key: &Key, tx: A) -> Result<AtomicOutcome> {
        let cloud = self.lock_cloud("first atomic transaction").await?;
        let home = key.home(&cloud).ok_or_else(|| {
            rill_common::RillError::InternalError(format!("no home for {}: cloud is empty", key))
        })?;
        let outcome = self
            .call(home, AtomicTask {
                key: key.clone(),
                tx,
            })
            .await?
            .get()
            .await?;
        if home != self.address() {
            // Whatever was cached here predates the transaction
            self.kv.forget(key);
        }
        Ok(outcome)
    }

    pub(crate) async fn run_atomic<A: Atomic>(
        self: &Arc<Self>,
        key: &Key,
        tx: &A,
    ) -> Result<AtomicOutcome> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let observed = self.kv.get_stored(key);
            let old = match &observed {
                Some(stored) => {
                    let value = self.kv.materialize(key, stored).await?;
                    (!value.is_tombstone()).then_some(value)
                }
                None => None,
            };

            let Some(new) = tx.atomic(old.as_ref()) else {
                // An abort still orders after the commit it observed
                if let Some(stored) = &observed {
                    stored.wait_till_settled().await;
                }
                trace!(key = %key, attempts, "Transaction aborted");
                return Ok(AtomicOutcome::Aborted { current: old });
            };

            let swap = self
                .cas_on_home(key, new, None, None, |current, _| {
                    match (current, &observed) {
                        (Some(c), Some(o)) => Arc::ptr_eq(c, o),
                        (None, None) => true,
                        _ => false,
                    }
                })
                .await?;
            match swap {
                HomeSwap::Committed { old, new, .. } => {
                    tx.on_success(old.as_ref());
                    debug!(key = %key, attempts, "Transaction committed");
                    return Ok(AtomicOutcome::Committed { old, new });
                }
                HomeSwap::Conflict { .. } => {
                    trace!(key = %key, attempts, "Transaction lost a race, retrying");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct SetIfEmpty(String);

    impl Atomic for SetIfEmpty {
        const TYPE_NAME: &'static str = "test.SetIfEmpty";

        fn atomic(&self, old: Option<&Value>) -> Option<Value> {
            match old {
                Some(_) => None,
                None => Some(Value::from_bytes(self.0.clone())),
            }
        }
    }

    #[test]
    fn test_transaction_function() {
        let tx = SetIfEmpty("a".to_string());
        assert_eq!(tx.atomic(None), Some(Value::from_bytes("a")));
        assert_eq!(tx.atomic(Some(&Value::from_bytes("b"))), None);
        assert_eq!(
            <AtomicTask<SetIfEmpty> as RemoteTask>::TYPE_NAME,
            "test.SetIfEmpty"
        );
    }

    #[test]
    fn test_outcome_value() {
        let committed = AtomicOutcome::Committed {
            old: None,
            new: Value::from_bytes("n"),
        };
        assert!(committed.is_committed());
        assert_eq!(committed.value(), Some(&Value::from_bytes("n")));

        let aborted = AtomicOutcome::Aborted { current: None };
        assert!(!aborted.is_committed());
        assert!(aborted.value().is_none());
    }
}
