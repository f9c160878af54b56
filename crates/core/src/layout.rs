//! Where sub-entities live inside a resource, and which of their fields are tracked.
//!
//! This module provides:
//! - Built-in presets mapping G/V/K to the sub-entity array path
//! - Field extraction from raw JSON into [`ResourceSnapshot`] values

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{MalformedEntry, MalformedSnapshotError, ResourceIdentity, ResourceSnapshot, SubEntity};

pub const DEFAULT_TRACKED_FIELD: &str = "image";
pub const POD_TEMPLATE_CONTAINERS: &str = "spec.template.spec.containers";
pub const POD_CONTAINERS: &str = "spec.containers";
pub const CRONJOB_CONTAINERS: &str = "spec.jobTemplate.spec.template.spec.containers";
pub const POD_PHASE: &str = "status.phase";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubEntityLayout {
    /// Dotted path to the array of sub-entities.
    pub path: String,
    /// Dotted paths, relative to one sub-entity, of the compared fields.
    pub tracked_fields: Vec<String>,
    /// Dotted paths, relative to the resource root, of compared resource-level fields.
    #[serde(default)]
    pub resource_fields: Vec<String>,
}

impl Default for SubEntityLayout {
    fn default() -> Self {
        Self {
            path: POD_TEMPLATE_CONTAINERS.to_string(),
            tracked_fields: vec![DEFAULT_TRACKED_FIELD.to_string()],
            resource_fields: Vec::new(),
        }
    }
}

/// Sub-entity path for built-in workload kinds; `None` for kinds without a pod spec.
pub fn builtin_path_for(group: &str, version: &str, kind: &str) -> Option<&'static str> {
    match (group, version, kind) {
        ("", "v1", "Pod") => Some(POD_CONTAINERS),
        ("apps", "v1", "Deployment")
        | ("apps", "v1", "StatefulSet")
        | ("apps", "v1", "DaemonSet")
        | ("apps", "v1", "ReplicaSet")
        | ("batch", "v1", "Job") => Some(POD_TEMPLATE_CONTAINERS),
        ("batch", "v1", "CronJob") => Some(CRONJOB_CONTAINERS),
        _ => None,
    }
}

/// Resource-level fields tracked by default for a kind.
pub fn builtin_resource_fields_for(group: &str, version: &str, kind: &str) -> &'static [&'static str] {
    match (group, version, kind) {
        ("", "v1", "Pod") => &[POD_PHASE],
        _ => &[],
    }
}

impl SubEntityLayout {
    pub fn new(path: impl Into<String>, tracked_fields: Vec<String>) -> Self {
        let tracked_fields = if tracked_fields.is_empty() { vec![DEFAULT_TRACKED_FIELD.to_string()] } else { tracked_fields };
        Self { path: path.into(), tracked_fields, resource_fields: Vec::new() }
    }

    /// Preset for a GVK, falling back to the pod-template path for unknown kinds.
    pub fn for_kind(group: &str, version: &str, kind: &str, tracked_fields: Vec<String>) -> Self {
        let path = builtin_path_for(group, version, kind).unwrap_or(POD_TEMPLATE_CONTAINERS);
        let mut layout = Self::new(path, tracked_fields);
        layout.resource_fields = builtin_resource_fields_for(group, version, kind).iter().map(|f| f.to_string()).collect();
        layout
    }

    /// Replace the resource-level fields; an empty list keeps the current ones.
    pub fn with_resource_fields(mut self, fields: Vec<String>) -> Self {
        if !fields.is_empty() {
            self.resource_fields = fields;
        }
        self
    }

    /// Build a snapshot from a raw object.
    ///
    /// Only an unreadable identity fails the whole object; unreadable
    /// sub-entities are recorded in `malformed` and the rest are kept.
    pub fn build_snapshot(&self, raw: &serde_json::Value) -> Result<ResourceSnapshot, MalformedSnapshotError> {
        let identity = ResourceIdentity::from_object(raw).ok_or_else(|| MalformedSnapshotError {
            identity: None,
            index: None,
            reason: "object missing metadata.name".to_string(),
        })?;
        let mut snap = ResourceSnapshot::new(identity);
        if let Some(meta) = raw.get("metadata") {
            snap.uid = meta.get("uid").and_then(|v| v.as_str()).and_then(|s| uuid::Uuid::parse_str(s).ok());
            snap.resource_version = meta.get("resourceVersion").and_then(|v| v.as_str()).map(|s| s.to_string());
        }
        for field in &self.resource_fields {
            if let Some(v) = lookup(raw, field).and_then(render) {
                snap.fields.insert(field.clone(), v);
            }
        }

        let items = match lookup(raw, &self.path) {
            None => return Ok(snap),
            Some(serde_json::Value::Array(items)) => items,
            Some(other) => {
                snap.malformed.push(MalformedEntry {
                    index: None,
                    reason: format!("{} is {}, expected an array", self.path, type_name(other)),
                });
                return Ok(snap);
            }
        };

        for (idx, item) in items.iter().enumerate() {
            let Some(name) = item.get("name").and_then(|v| v.as_str()) else {
                snap.malformed.push(MalformedEntry { index: Some(idx), reason: "sub-entity has no string name".to_string() });
                continue;
            };
            if snap.sub_entity(name).is_some() {
                snap.malformed.push(MalformedEntry { index: Some(idx), reason: format!("duplicate sub-entity name {name}") });
                continue;
            }
            let mut fields = BTreeMap::new();
            for field in &self.tracked_fields {
                if let Some(v) = lookup(item, field).and_then(render) {
                    fields.insert(field.clone(), v);
                }
            }
            snap.sub_entities.push(SubEntity { name: name.to_string(), fields });
        }
        Ok(snap)
    }
}

fn lookup<'a>(v: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.').filter(|s| !s.is_empty()).try_fold(v, |cur, seg| cur.get(seg))
}

/// Strings render as-is, `null` counts as absent, anything else as compact JSON.
fn render(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a bool",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
