//! Schemaless resources and their backend metadata.
//!
//! # Design
//! A [`Resource`] is a shared handle (`Arc<RwLock<..>>`). The client's cache
//! stores clones of the same handle the caller holds, so merging a server
//! response into the cached entry is visible to every holder without
//! reassigning anything. Reference placeholders rely on the same property: a
//! field can point at a `Stub` that is filled in later.
//!
//! Reserved keys (`clazz`, `ffUrl`, `guid`, `objVersion`, ...) are lifted out of
//! the JSON into [`Metadata`] and [`ResourceState`]; everything else is a
//! [`Field`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ClientError;
use crate::types::Reference;

const CLAZZ: &str = "clazz";
const FF_URL: &str = "ffUrl";
const GUID: &str = "guid";
const FF_RL: &str = "ffRL";
const OBJ_VERSION: &str = "objVersion";
const CREATED_BY: &str = "createdBy";
const CREATED_AT: &str = "createdAt";
const UPDATED_BY: &str = "updatedBy";
const UPDATED_AT: &str = "updatedAt";
const FF_REFS: &str = "ffRefs";
const FF_USER_CAN_EDIT: &str = "ffUserCanEdit";

/// Where a resource is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceState {
    /// Built locally, never sent to the backend.
    Draft,
    /// A reference placeholder: the locator is known, the content is not (yet).
    Stub { locator: String },
    /// Known to the backend. `version` is 0 when the server did not report one.
    Persisted { locator: String, version: u64 },
}

impl ResourceState {
    pub fn locator(&self) -> Option<&str> {
        match self {
            ResourceState::Draft => None,
            ResourceState::Stub { locator } | ResourceState::Persisted { locator, .. } => {
                Some(locator)
            }
        }
    }
}

/// Backend-maintained fields other than the locator and version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub clazz: Option<String>,
    pub guid: Option<String>,
    /// The collection the object lives in, e.g. `/Foo`.
    pub collection: Option<String>,
    pub created_by: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub refs: Vec<Reference>,
    pub user_can_edit: Option<bool>,
}

/// A non-metadata member of a resource.
#[derive(Clone)]
pub enum Field {
    Value(Value),
    Resource(Resource),
    Blob(Bytes),
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Value(v) => write!(f, "Value({v})"),
            Field::Resource(r) => match r.locator() {
                Some(locator) => write!(f, "Resource({locator})"),
                None => write!(f, "Resource(<draft>)"),
            },
            Field::Blob(b) => write!(f, "Blob({} bytes)", b.len()),
        }
    }
}

#[derive(Debug, Clone)]
struct ResourceData {
    state: ResourceState,
    meta: Metadata,
    fields: BTreeMap<String, Field>,
    type_hint: Option<String>,
}

/// The JSON body to send for a create/update plus what was split out of it.
#[derive(Debug, Clone, Default)]
pub(crate) struct Persistable {
    pub body: Map<String, Value>,
    pub refs: Vec<Reference>,
    pub blobs: BTreeMap<String, Bytes>,
}

/// Shared handle to a schemaless backend object.
#[derive(Clone)]
pub struct Resource(Arc<RwLock<ResourceData>>);

impl Default for Resource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.0.read();
        f.debug_struct("Resource")
            .field("state", &data.state)
            .field("clazz", &data.meta.clazz)
            .field("fields", &data.fields)
            .finish()
    }
}

impl Resource {
    /// An empty draft.
    pub fn new() -> Self {
        Self::from_data(ResourceData {
            state: ResourceState::Draft,
            meta: Metadata::default(),
            fields: BTreeMap::new(),
            type_hint: None,
        })
    }

    /// An empty draft with its `clazz` already set.
    pub fn with_class(clazz: impl Into<String>) -> Self {
        let resource = Self::new();
        resource.set_clazz(clazz);
        resource
    }

    /// A draft built from a serializable value. The Rust type name becomes the
    /// class hint used by `create` when no `clazz` field is present.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, ClientError> {
        let json = serde_json::to_value(value).map_err(|e| ClientError::Serialization(e.to_string()))?;
        let Value::Object(map) = json else {
            return Err(ClientError::Serialization(
                "resources must serialize to a JSON object".into(),
            ));
        };
        let resource = Self::from_json(map);
        resource.0.write().type_hint = Some(short_type_name::<T>().to_string());
        Ok(resource)
    }

    /// A resource from a backend JSON object; `Persisted` if it carries `ffUrl`.
    pub fn from_json(map: Map<String, Value>) -> Self {
        let resource = Self::new();
        resource.merge_json(map);
        resource
    }

    pub(crate) fn stub(locator: impl Into<String>) -> Self {
        let resource = Self::new();
        resource.0.write().state = ResourceState::Stub {
            locator: locator.into(),
        };
        resource
    }

    fn from_data(data: ResourceData) -> Self {
        Self(Arc::new(RwLock::new(data)))
    }

    /// True when both handles point at the same object.
    pub fn ptr_eq(&self, other: &Resource) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn state(&self) -> ResourceState {
        self.0.read().state.clone()
    }

    pub fn is_draft(&self) -> bool {
        matches!(self.0.read().state, ResourceState::Draft)
    }

    pub fn locator(&self) -> Option<String> {
        self.0.read().state.locator().map(str::to_string)
    }

    pub fn version(&self) -> Option<u64> {
        match self.0.read().state {
            ResourceState::Persisted { version, .. } => Some(version),
            _ => None,
        }
    }

    pub fn metadata(&self) -> Metadata {
        self.0.read().meta.clone()
    }

    pub fn clazz(&self) -> Option<String> {
        self.0.read().meta.clazz.clone()
    }

    pub fn set_clazz(&self, clazz: impl Into<String>) {
        self.0.write().meta.clazz = Some(clazz.into());
    }

    pub fn guid(&self) -> Option<String> {
        self.0.read().meta.guid.clone()
    }

    pub fn references(&self) -> Vec<Reference> {
        self.0.read().meta.refs.clone()
    }

    pub(crate) fn type_hint(&self) -> Option<String> {
        self.0.read().type_hint.clone()
    }

    pub fn field(&self, name: &str) -> Option<Field> {
        self.0.read().fields.get(name).cloned()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.0.read().fields.keys().cloned().collect()
    }

    /// A plain JSON member.
    pub fn get(&self, name: &str) -> Option<Value> {
        match self.0.read().fields.get(name) {
            Some(Field::Value(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// A member holding another resource (embedded or resolved reference).
    pub fn get_resource(&self, name: &str) -> Option<Resource> {
        match self.0.read().fields.get(name) {
            Some(Field::Resource(r)) => Some(r.clone()),
            _ => None,
        }
    }

    pub fn get_blob(&self, name: &str) -> Option<Bytes> {
        match self.0.read().fields.get(name) {
            Some(Field::Blob(b)) => Some(b.clone()),
            _ => None,
        }
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.set_field(name, Field::Value(value.into()));
    }

    pub fn set_resource(&self, name: impl Into<String>, value: &Resource) {
        self.set_field(name, Field::Resource(value.clone()));
    }

    pub fn set_blob(&self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.set_field(name, Field::Blob(value.into()));
    }

    pub fn set_field(&self, name: impl Into<String>, field: Field) {
        self.0.write().fields.insert(name.into(), field);
    }

    pub fn remove(&self, name: &str) -> Option<Field> {
        self.0.write().fields.remove(name)
    }

    /// Copy every member of `map` onto this resource, keeping members the map
    /// does not mention.
    pub(crate) fn merge_json(&self, map: Map<String, Value>) {
        self.0.write().absorb(map);
    }

    /// Replace this resource's content with `map` while keeping its identity.
    pub(crate) fn replace_json(&self, map: Map<String, Value>) {
        let mut data = self.0.write();
        data.meta = Metadata::default();
        data.fields.clear();
        data.absorb(map);
    }

    /// Overwrite this resource with a snapshot of `other`.
    pub(crate) fn copy_from(&self, other: &Resource) {
        if self.ptr_eq(other) {
            return;
        }
        let snapshot = other.0.read().clone();
        *self.0.write() = snapshot;
    }

    /// The resource as JSON, metadata included. Referenced resources are
    /// rendered as `{ffUrl}`; embedded drafts are rendered inline. A draft that
    /// embeds one of its own ancestors renders that member as `null`.
    pub fn to_json(&self) -> Value {
        let mut seen = vec![self.key()];
        match self.render(&mut seen, false) {
            Ok(map) => Value::Object(map),
            Err(_) => Value::Null,
        }
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    fn render(&self, seen: &mut Vec<usize>, strict: bool) -> Result<Map<String, Value>, ClientError> {
        let data = self.0.read();
        let mut out = data.metadata_json();
        for (name, field) in &data.fields {
            match field {
                Field::Value(v) => {
                    out.insert(name.clone(), v.clone());
                }
                Field::Resource(r) => {
                    let rendered = match r.locator() {
                        Some(locator) => {
                            let mut m = Map::new();
                            m.insert(FF_URL.into(), Value::String(locator));
                            Value::Object(m)
                        }
                        None => r.embed(seen, strict)?,
                    };
                    out.insert(name.clone(), rendered);
                }
                Field::Blob(_) => {}
            }
        }
        if !data.meta.refs.is_empty() {
            if let Ok(refs) = serde_json::to_value(&data.meta.refs) {
                out.insert(FF_REFS.into(), refs);
            }
        }
        Ok(out)
    }

    /// Render this draft inside the resource that holds it.
    fn embed(&self, seen: &mut Vec<usize>, strict: bool) -> Result<Value, ClientError> {
        if seen.contains(&self.key()) {
            if strict {
                return Err(ClientError::Serialization("cyclic resource graph".into()));
            }
            return Ok(Value::Null);
        }
        seen.push(self.key());
        let rendered = self.render(seen, strict);
        seen.pop();
        rendered.map(Value::Object)
    }

    /// Deserialize the resource's JSON view into a typed value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_value(self.to_json()).map_err(|e| ClientError::Serialization(e.to_string()))
    }

    /// Split the resource for sending: members pointing at persisted resources
    /// become `ffRefs` entries, non-empty blobs are set aside for a separate
    /// upload, everything else is serialized in place.
    /// Fails when embedded drafts point back at one another.
    pub(crate) fn persistable(&self) -> Result<Persistable, ClientError> {
        let mut seen = vec![self.key()];
        let data = self.0.read();
        let mut out = Persistable {
            body: data.metadata_json(),
            ..Persistable::default()
        };
        for (name, field) in &data.fields {
            match field {
                Field::Value(v) => {
                    out.body.insert(name.clone(), v.clone());
                }
                Field::Resource(r) => match r.locator() {
                    Some(locator) => out.refs.push(Reference::object(name.clone(), locator)),
                    None => {
                        out.body.insert(name.clone(), r.embed(&mut seen, true)?);
                    }
                },
                Field::Blob(b) if !b.is_empty() => {
                    out.blobs.insert(name.clone(), b.clone());
                }
                Field::Blob(_) => {}
            }
        }
        if !out.refs.is_empty() {
            if let Ok(refs) = serde_json::to_value(&out.refs) {
                out.body.insert(FF_REFS.into(), refs);
            }
        }
        Ok(out)
    }
}

impl ResourceData {
    fn absorb(&mut self, mut map: Map<String, Value>) {
        let locator = map.remove(FF_URL).and_then(into_string);
        let version = map.remove(OBJ_VERSION).and_then(|v| as_u64(&v));
        match (locator, version) {
            (Some(locator), Some(version)) => {
                self.state = ResourceState::Persisted { locator, version };
            }
            (Some(locator), None) => {
                let version = match &self.state {
                    ResourceState::Persisted { locator: old, version } if *old == locator => *version,
                    _ => 0,
                };
                self.state = ResourceState::Persisted { locator, version };
            }
            (None, Some(version)) => {
                if let ResourceState::Persisted { version: v, .. } = &mut self.state {
                    *v = version;
                }
            }
            (None, None) => {}
        }

        if let Some(v) = map.remove(CLAZZ).and_then(into_string) {
            self.meta.clazz = Some(v);
        }
        if let Some(v) = map.remove(GUID).and_then(into_string) {
            self.meta.guid = Some(v);
        }
        if let Some(v) = map.remove(FF_RL).and_then(into_string) {
            self.meta.collection = Some(v);
        }
        if let Some(v) = map.remove(CREATED_BY).and_then(into_string) {
            self.meta.created_by = Some(v);
        }
        if let Some(v) = map.remove(UPDATED_BY).and_then(into_string) {
            self.meta.updated_by = Some(v);
        }
        if let Some(v) = map.remove(CREATED_AT).and_then(|v| timestamp(&v)) {
            self.meta.created_at = Some(v);
        }
        if let Some(v) = map.remove(UPDATED_AT).and_then(|v| timestamp(&v)) {
            self.meta.updated_at = Some(v);
        }
        if let Some(v) = map.remove(FF_USER_CAN_EDIT).and_then(|v| v.as_bool()) {
            self.meta.user_can_edit = Some(v);
        }
        if let Some(Value::Array(items)) = map.remove(FF_REFS) {
            self.meta.refs = items
                .into_iter()
                .filter_map(|item| match serde_json::from_value(item) {
                    Ok(r) => Some(r),
                    Err(err) => {
                        tracing::warn!(%err, "ignoring malformed ffRefs entry");
                        None
                    }
                })
                .collect();
        }

        for (key, value) in map {
            self.fields.insert(key, Field::Value(value));
        }
    }

    fn metadata_json(&self) -> Map<String, Value> {
        let mut out = Map::new();
        let meta = &self.meta;
        if let Some(v) = &meta.clazz {
            out.insert(CLAZZ.into(), Value::String(v.clone()));
        }
        match &self.state {
            ResourceState::Draft => {}
            ResourceState::Stub { locator } => {
                out.insert(FF_URL.into(), Value::String(locator.clone()));
            }
            ResourceState::Persisted { locator, version } => {
                out.insert(FF_URL.into(), Value::String(locator.clone()));
                out.insert(OBJ_VERSION.into(), Value::from(*version));
            }
        }
        if let Some(v) = &meta.guid {
            out.insert(GUID.into(), Value::String(v.clone()));
        }
        if let Some(v) = &meta.collection {
            out.insert(FF_RL.into(), Value::String(v.clone()));
        }
        if let Some(v) = &meta.created_by {
            out.insert(CREATED_BY.into(), Value::String(v.clone()));
        }
        if let Some(v) = meta.created_at {
            out.insert(CREATED_AT.into(), Value::from(v.timestamp_millis()));
        }
        if let Some(v) = &meta.updated_by {
            out.insert(UPDATED_BY.into(), Value::String(v.clone()));
        }
        if let Some(v) = meta.updated_at {
            out.insert(UPDATED_AT.into(), Value::from(v.timestamp_millis()));
        }
        if let Some(v) = meta.user_can_edit {
            out.insert(FF_USER_CAN_EDIT.into(), Value::Bool(v));
        }
        out
    }
}

fn into_string(v: Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

fn as_u64(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

/// Backend timestamps are epoch milliseconds; RFC 3339 strings are accepted too.
fn timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Foo {
        #[serde(rename = "fooParameter")]
        foo_parameter: String,
    }

    #[test]
    fn typed_values_carry_their_type_name() {
        let r = Resource::from_serializable(&Foo {
            foo_parameter: "x".into(),
        })
        .unwrap();
        assert_eq!(r.type_hint().as_deref(), Some("Foo"));
        assert_eq!(r.get("fooParameter"), Some(json!("x")));
        assert!(r.is_draft());
        assert!(r.clazz().is_none());
    }

    #[test]
    fn non_object_values_are_rejected() {
        let err = Resource::from_serializable(&42).unwrap_err();
        assert!(matches!(err, ClientError::Serialization(_)));
    }

    #[test]
    fn server_json_lifts_metadata() {
        let r = Resource::from_json(obj(json!({
            "clazz": "Foo",
            "ffUrl": "/ff/resources/Foo/g1",
            "guid": "g1",
            "ffRL": "/Foo",
            "objVersion": 3,
            "createdBy": "u1",
            "createdAt": 1_700_000_000_000_i64,
            "updatedAt": "2024-01-02T03:04:05Z",
            "ffUserCanEdit": true,
            "ffRefs": [{"name": "bar", "type": "FFO", "url": "/ff/resources/Bar/b1"}],
            "fooParameter": "x"
        })));
        assert_eq!(
            r.state(),
            ResourceState::Persisted {
                locator: "/ff/resources/Foo/g1".into(),
                version: 3
            }
        );
        let meta = r.metadata();
        assert_eq!(meta.clazz.as_deref(), Some("Foo"));
        assert_eq!(meta.collection.as_deref(), Some("/Foo"));
        assert_eq!(meta.created_at.unwrap().timestamp_millis(), 1_700_000_000_000);
        assert_eq!(meta.updated_at.unwrap().timestamp(), 1_704_164_645);
        assert_eq!(meta.user_can_edit, Some(true));
        assert_eq!(meta.refs, vec![Reference::object("bar", "/ff/resources/Bar/b1")]);
        assert_eq!(r.field_names(), vec!["fooParameter".to_string()]);
    }

    #[test]
    fn merge_keeps_unmentioned_members_and_replace_drops_them() {
        let r = Resource::new();
        r.set("a", 1);
        r.set("b", 2);
        r.merge_json(obj(json!({"ffUrl": "/x/1", "objVersion": 1, "b": 3})));
        assert_eq!(r.get("a"), Some(json!(1)));
        assert_eq!(r.get("b"), Some(json!(3)));

        r.replace_json(obj(json!({"ffUrl": "/x/1", "objVersion": 2, "c": 4})));
        assert_eq!(r.get("a"), None);
        assert_eq!(r.get("c"), Some(json!(4)));
        assert_eq!(r.version(), Some(2));
    }

    #[test]
    fn locator_without_version_keeps_known_version() {
        let r = Resource::from_json(obj(json!({"ffUrl": "/x/1", "objVersion": 5})));
        r.merge_json(obj(json!({"ffUrl": "/x/1"})));
        assert_eq!(r.version(), Some(5));
    }

    #[test]
    fn persistable_splits_references_and_blobs() {
        let bar = Resource::from_json(obj(json!({"ffUrl": "/ff/resources/Bar/b1", "objVersion": 1})));
        let embedded = Resource::new();
        embedded.set("inner", true);

        let foo = Resource::with_class("Foo");
        foo.set("fooParameter", "x");
        foo.set_resource("bar", &bar);
        foo.set_resource("embedded", &embedded);
        foo.set_blob("pic", Bytes::from_static(b"\x89PNG"));
        foo.set_blob("empty", Bytes::new());

        let p = foo.persistable().unwrap();
        assert_eq!(p.refs, vec![Reference::object("bar", "/ff/resources/Bar/b1")]);
        assert_eq!(p.blobs.len(), 1);
        assert_eq!(p.blobs["pic"].as_ref(), b"\x89PNG");
        assert_eq!(
            Value::Object(p.body),
            json!({
                "clazz": "Foo",
                "fooParameter": "x",
                "embedded": {"inner": true},
                "ffRefs": [{"name": "bar", "type": "FFO", "url": "/ff/resources/Bar/b1"}]
            })
        );
    }

    #[test]
    fn persistable_omits_stale_server_refs() {
        let r = Resource::from_json(obj(json!({
            "ffUrl": "/x/1",
            "objVersion": 1,
            "ffRefs": [{"name": "pic", "type": "FFB", "url": "/x/1/pic"}]
        })));
        let p = r.persistable().unwrap();
        assert!(p.refs.is_empty());
        assert!(!p.body.contains_key("ffRefs"));
        assert_eq!(p.body["objVersion"], json!(1));
    }

    #[test]
    fn drafts_pointing_at_each_other_cannot_be_persisted() {
        let parent = Resource::with_class("Parent");
        let child = Resource::with_class("Child");
        parent.set_resource("child", &child);
        child.set_resource("parent", &parent);

        let err = parent.persistable().unwrap_err();
        assert_eq!(err, ClientError::Serialization("cyclic resource graph".into()));
        assert_eq!(
            parent.to_json(),
            json!({"clazz": "Parent", "child": {"clazz": "Child", "parent": null}})
        );

        let selfish = Resource::new();
        selfish.set_resource("me", &selfish);
        assert!(selfish.persistable().is_err());
    }

    #[test]
    fn shared_draft_is_not_a_cycle() {
        let shared = Resource::new();
        shared.set("n", 1);
        let root = Resource::new();
        root.set_resource("left", &shared);
        root.set_resource("right", &shared);
        let p = root.persistable().unwrap();
        assert_eq!(p.body["left"], json!({"n": 1}));
        assert_eq!(p.body["right"], json!({"n": 1}));
    }

    #[test]
    fn clones_share_identity() {
        let a = Resource::new();
        let b = a.clone();
        b.set("x", "y");
        assert!(a.ptr_eq(&b));
        assert_eq!(a.get("x"), Some(json!("y")));
        assert!(!a.ptr_eq(&Resource::new()));
    }

    #[test]
    fn typed_round_trip_through_resource() {
        let r = Resource::from_json(obj(json!({"ffUrl": "/Foo/1", "fooParameter": "hello"})));
        let foo: Foo = r.deserialize().unwrap();
        assert_eq!(foo.foo_parameter, "hello");
    }
}
