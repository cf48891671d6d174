//! Serialization collaborator
//!
//! Payloads are bincode-encoded. Every task type that crosses the wire is
//! identified by a small integer tag; the core task types have fixed tags and
//! every other type gets its tag from the cloud leader on first use, through a
//! [`TypeResolver`].

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use rill_common::{Result, RillError};

/// First tag handed out by the leader for non-bootstrap types
pub const FIRST_DYNAMIC_TAG: u16 = 128;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| RillError::SerializationError(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| RillError::SerializationError(e.to_string()))
}

/// Cluster-wide lookup of tags this node does not know yet
#[async_trait]
pub trait TypeResolver: Send + Sync {
    /// Ask the authority for the tag of `name`, assigning one if needed
    async fn resolve_id(&self, name: &str) -> Result<u16>;

    /// Ask the authority which type name `id` stands for
    async fn resolve_name(&self, id: u16) -> Result<String>;
}

#[derive(Default)]
struct TypeTable {
    by_name: HashMap<String, u16>,
    by_id: HashMap<u16, String>,
    next: u16,
}

/// Bidirectional `type name <-> tag` table
pub struct TypeMap {
    table: RwLock<TypeTable>,
}

impl TypeMap {
    /// Build a map whose bootstrap types get tags `1..=names.len()` in order
    pub fn with_bootstrap(names: &[&str]) -> Self {
        let mut table = TypeTable {
            next: FIRST_DYNAMIC_TAG,
            ..Default::default()
        };
        for (i, name) in names.iter().enumerate() {
            let id = (i + 1) as u16;
            table.by_name.insert(name.to_string(), id);
            table.by_id.insert(id, name.to_string());
        }
        Self {
            table: RwLock::new(table),
        }
    }

    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.table.read().by_name.get(name).copied()
    }

    pub fn name_of(&self, id: u16) -> Option<String> {
        self.table.read().by_id.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Authority side: return the existing tag or hand out the next free one
    pub fn assign(&self, name: &str) -> Result<u16> {
        let mut table = self.table.write();
        if let Some(id) = table.by_name.get(name) {
            return Ok(*id);
        }
        let id = table.next;
        let next = id
            .checked_add(1)
            .filter(|_| !table.by_id.contains_key(&id))
            .ok_or_else(|| {
                RillError::InternalError(format!("no type tag left for '{}'", name))
            })?;
        table.next = next;
        table.by_name.insert(name.to_string(), id);
        table.by_id.insert(id, name.to_string());
        debug!(type_name = %name, id, "Assigned type tag");
        Ok(id)
    }

    /// Record a mapping learnt from the authority
    pub fn install(&self, name: &str, id: u16) -> Result<()> {
        let mut table = self.table.write();
        match (table.by_name.get(name), table.by_id.get(&id)) {
            (Some(known), _) if *known != id => Err(RillError::InternalError(format!(
                "type '{}' already tagged {}, refusing {}",
                name, known, id
            ))),
            (_, Some(known)) if known != name => Err(RillError::InternalError(format!(
                "tag {} already names '{}', refusing '{}'",
                id, known, name
            ))),
            _ => {
                table.by_name.insert(name.to_string(), id);
                table.by_id.insert(id, name.to_string());
                if id >= table.next {
                    table.next = id.saturating_add(1);
                }
                Ok(())
            }
        }
    }

    /// Local hit, or resolve through `resolver` and remember the answer
    pub async fn id_for(&self, name: &str, resolver: &dyn TypeResolver) -> Result<u16> {
        if let Some(id) = self.id_of(name) {
            return Ok(id);
        }
        let id = resolver.resolve_id(name).await?;
        self.install(name, id)?;
        Ok(id)
    }

    pub async fn name_for(&self, id: u16, resolver: &dyn TypeResolver) -> Result<String> {
        if let Some(name) = self.name_of(id) {
            return Ok(name);
        }
        let name = resolver.resolve_name(id).await?;
        self.install(&name, id)?;
        Ok(name)
    }
}
