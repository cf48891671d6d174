// Type tag resolution
// Tasks and resolver that ask the cloud leader for serialization tags

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use rill_api::codec::TypeResolver;
use rill_common::{Result, RillError};

use crate::service::rpc::{Priority, RemoteTask, TaskContext, TaskOutcome};
use crate::service::runtime::ClusterRuntime;

/// Ask the leader for the tag of a type name, assigning one if needed
#[derive(Debug, Serialize, Deserialize)]
pub struct TypeIdLookup {
    pub name: String,
}

impl RemoteTask for TypeIdLookup {
    const TYPE_NAME: &'static str = "rill.TypeIdLookup";
    const PRIORITY: Priority = Priority::High;
    type Output = u16;

    async fn execute(self, ctx: TaskContext) -> Result<TaskOutcome<u16>> {
        let rt = ctx.runtime;
        if !rt.is_leader() {
            return Err(RillError::InternalError(format!(
                "{} is not the cloud leader",
                rt.address()
            )));
        }
        rt.types.assign(&self.name).map(TaskOutcome::new)
    }
}

/// Ask the leader which type name a tag stands for
#[derive(Debug, Serialize, Deserialize)]
pub struct TypeNameLookup {
    pub id: u16,
}

impl RemoteTask for TypeNameLookup {
    const TYPE_NAME: &'static str = "rill.TypeNameLookup";
    const PRIORITY: Priority = Priority::High;
    type Output = String;

    async fn execute(self, ctx: TaskContext) -> Result<TaskOutcome<String>> {
        ctx.runtime
            .types
            .name_of(self.id)
            .map(TaskOutcome::new)
            .ok_or(RillError::UnknownTypeId(self.id))
    }
}

/// Resolves unknown tags through the leader of the current cloud
pub(crate) struct LeaderResolver {
    rt: Arc<ClusterRuntime>,
}

impl LeaderResolver {
    pub(crate) fn new(rt: Arc<ClusterRuntime>) -> Self {
        Self { rt }
    }
}

#[async_trait]
impl TypeResolver for LeaderResolver {
    async fn resolve_id(&self, name: &str) -> Result<u16> {
        // Tags must come from a leader every member agrees on
        let cloud = self.rt.lock_cloud("type tag being allocated").await?;
        let leader = cloud
            .leader()
            .map(|n| n.addr())
            .ok_or_else(|| RillError::InternalError("cloud has no leader".to_string()))?;
        if leader == self.rt.address() {
            return self.rt.types.assign(name);
        }
        debug!(type_name = %name, leader = %leader, "Resolving type tag");
        self.rt
            .call(
                leader,
                TypeIdLookup {
                    name: name.to_string(),
                },
            )
            .await?
            .get()
            .await
    }

    async fn resolve_name(&self, id: u16) -> Result<String> {
        let cloud = self.rt.cloud();
        let leader = cloud
            .leader()
            .map(|n| n.addr())
            .ok_or(RillError::UnknownTypeId(id))?;
        if leader == self.rt.address() {
            return self.rt.types.name_of(id).ok_or(RillError::UnknownTypeId(id));
        }
        debug!(id, leader = %leader, "Resolving type name");
        self.rt.call(leader, TypeNameLookup { id }).await?.get().await
    }
}
