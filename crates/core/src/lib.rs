//! rollwatch core types: identities, snapshots, change events and semantic records.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod config;
pub mod error;
pub mod layout;

pub use config::WatchConfig;
pub use error::{HandlerError, MalformedSnapshotError, SinkError, StartupError, TransportError};
pub use layout::SubEntityLayout;

/// Stable identity of a resource within one resource type.
///
/// Cluster-scoped resources carry an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub namespace: String,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self { namespace: String::new(), name: name.into() }
    }

    /// Read `metadata.namespace`/`metadata.name` from a raw object.
    pub fn from_object(raw: &serde_json::Value) -> Option<Self> {
        let meta = raw.get("metadata")?;
        let name = meta.get("name").and_then(|v| v.as_str())?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("");
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// A named component nested in a resource (e.g. a container in a pod template).
///
/// `fields` holds only the tracked fields; a missing key means the field is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubEntity {
    pub name: String,
    pub fields: BTreeMap<String, String>,
}

impl SubEntity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), fields: BTreeMap::new() }
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn field(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }
}

/// A sub-entity slot that could not be read from the raw object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedEntry {
    /// Position in the source array, `None` when the array itself is unreadable.
    pub index: Option<usize>,
    pub reason: String,
}

/// Immutable point-in-time state of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub identity: ResourceIdentity,
    pub uid: Option<uuid::Uuid>,
    pub resource_version: Option<String>,
    /// Tracked resource-level fields (such as `status.phase`); absent keys are absent values.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    pub sub_entities: SmallVec<[SubEntity; 4]>,
    pub malformed: SmallVec<[MalformedEntry; 1]>,
}

impl ResourceSnapshot {
    pub fn new(identity: ResourceIdentity) -> Self {
        Self {
            identity,
            uid: None,
            resource_version: None,
            fields: BTreeMap::new(),
            sub_entities: SmallVec::new(),
            malformed: SmallVec::new(),
        }
    }

    pub fn with_sub_entity(mut self, sub: SubEntity) -> Self {
        self.sub_entities.push(sub);
        self
    }

    pub fn with_resource_version(mut self, rv: impl Into<String>) -> Self {
        self.resource_version = Some(rv.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn field(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn sub_entity(&self, name: &str) -> Option<&SubEntity> {
        self.sub_entities.iter().find(|s| s.name == name)
    }

    pub fn is_malformed(&self) -> bool {
        !self.malformed.is_empty()
    }
}

pub type SharedSnapshot = Arc<ResourceSnapshot>;

/// Discriminant of a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Add => "add",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// A change notification for one resource. The payload is only reachable
/// after matching on the variant.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Added {
        identity: ResourceIdentity,
        snapshot: SharedSnapshot,
        at: DateTime<Utc>,
    },
    Updated {
        identity: ResourceIdentity,
        old: SharedSnapshot,
        new: SharedSnapshot,
        at: DateTime<Utc>,
    },
    Deleted {
        identity: ResourceIdentity,
        /// Last known state, when the source still had it.
        last: Option<SharedSnapshot>,
        at: DateTime<Utc>,
    },
}

impl ChangeEvent {
    pub fn added(snapshot: SharedSnapshot) -> Self {
        ChangeEvent::Added { identity: snapshot.identity.clone(), snapshot, at: Utc::now() }
    }

    pub fn updated(old: SharedSnapshot, new: SharedSnapshot) -> Self {
        ChangeEvent::Updated { identity: new.identity.clone(), old, new, at: Utc::now() }
    }

    pub fn deleted(identity: ResourceIdentity, last: Option<SharedSnapshot>) -> Self {
        ChangeEvent::Deleted { identity, last, at: Utc::now() }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Added { .. } => ChangeKind::Add,
            ChangeEvent::Updated { .. } => ChangeKind::Update,
            ChangeEvent::Deleted { .. } => ChangeKind::Delete,
        }
    }

    pub fn identity(&self) -> &ResourceIdentity {
        match self {
            ChangeEvent::Added { identity, .. }
            | ChangeEvent::Updated { identity, .. }
            | ChangeEvent::Deleted { identity, .. } => identity,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            ChangeEvent::Added { at, .. } | ChangeEvent::Updated { at, .. } | ChangeEvent::Deleted { at, .. } => *at,
        }
    }
}

/// One tracked field of one sub-entity that differs between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticChangeRecord {
    pub identity: ResourceIdentity,
    pub sub_entity: String,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// One tracked resource-level field that differs between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFieldChange {
    pub identity: ResourceIdentity,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// A sub-entity present on only one side of an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", content = "name", rename_all = "lowercase")]
pub enum StructuralChange {
    Added(String),
    Removed(String),
}

pub mod prelude {
    pub use super::{
        ChangeEvent, ChangeKind, MalformedEntry, ResourceFieldChange, ResourceIdentity, ResourceSnapshot, SemanticChangeRecord,
        SharedSnapshot, ShardPlanner, StructuralChange, SubEntity, SubEntityLayout, FnvShardPlanner,
    };
}

// ---- sharding ----

/// Maps an identity onto one of a fixed number of buckets. Used both for
/// cache shards and for dispatcher worker queues, so one identity always
/// lands on the same lock and the same worker.
pub trait ShardPlanner: Send + Sync {
    fn buckets(&self) -> usize;
    fn plan(&self, identity: &ResourceIdentity) -> usize;
}

/// FNV-1a over `namespace \0 name`, modulo the bucket count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FnvShardPlanner {
    buckets: u16,
}

impl FnvShardPlanner {
    pub fn new(buckets: usize) -> Self {
        Self { buckets: buckets.clamp(1, u16::MAX as usize) as u16 }
    }
}

impl ShardPlanner for FnvShardPlanner {
    fn buckets(&self) -> usize {
        self.buckets as usize
    }

    fn plan(&self, identity: &ResourceIdentity) -> usize {
        if self.buckets <= 1 {
            return 0;
        }
        let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
        let bytes = identity.namespace.bytes().chain(std::iter::once(0u8)).chain(identity.name.bytes());
        for b in bytes {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        (h % self.buckets as u64) as usize
    }
}
