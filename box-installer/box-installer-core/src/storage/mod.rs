//! Backend store boundary.
//!
//! The installer talks to the document store only through [`Backend`]. All
//! calls are synchronous from the installer's point of view; an async store
//! is expected to block inside its implementation.

pub mod memory;

pub use memory::MemoryStore;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Read;
use uuid::Uuid;

/// Kind of a node in a box's collection tree.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    WebDav,
    StructuredData,
    Service,
    File,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::WebDav => "WebDav",
            ResourceKind::StructuredData => "StructuredData",
            ResourceKind::Service => "Service",
            ResourceKind::File => "File",
        }
    }

    pub fn is_collection(&self) -> bool {
        !matches!(self, ResourceKind::File)
    }
}

/// Namespace a record or link lives in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Cell-level control objects (boxes, roles, relations, external roles).
    Cell(String),
    /// Schema objects of a structured-data collection.
    Schema(Uuid),
    /// User records of a structured-data collection.
    Data(Uuid),
}

/// Address of one record: entity set plus key predicate.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub entity_set: String,
    pub key: String,
}

impl EntityRef {
    pub fn new(entity_set: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            entity_set: entity_set.into(),
            key: key.into(),
        }
    }
}

/// Backend identity of a materialized collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionHandle {
    pub id: Uuid,
    pub path: String,
    pub kind: ResourceKind,
}

/// One user record in a bulk create call.
#[derive(Clone, Debug, PartialEq)]
pub struct BulkItem {
    pub entity_set: String,
    pub id: String,
    pub fields: Map<String, Value>,
}

pub trait Backend: Send + Sync {
    /// Create a control or schema record and return its key predicate.
    fn create_record(&self, scope: &Scope, entity_set: &str, fields: Map<String, Value>)
        -> Result<String>;

    /// Create user records in one call. The outer error fails the whole
    /// call; the inner results are per-item outcomes in input order.
    fn bulk_create(&self, collection: &CollectionHandle, items: &[BulkItem])
        -> Result<Vec<Result<()>>>;

    fn create_link(&self, scope: &Scope, source: &EntityRef, nav: &str, target: &EntityRef)
        -> Result<()>;

    /// Root collection of an existing box.
    fn box_root(&self, cell: &str, box_name: &str) -> Result<CollectionHandle>;

    fn create_collection(&self, parent: &CollectionHandle, name: &str, kind: ResourceKind)
        -> Result<CollectionHandle>;

    fn apply_acl(&self, node: Uuid, acl: &str) -> Result<()>;

    fn apply_dead_properties(&self, node: Uuid, properties: &[String]) -> Result<()>;

    fn put_file(
        &self,
        parent: &CollectionHandle,
        name: &str,
        content_type: &str,
        content: &mut dyn Read,
    ) -> Result<Uuid>;

    fn child_count(&self, collection: &CollectionHandle) -> Result<usize>;
}

fn string_field<'a>(fields: &'a Map<String, Value>, name: &str) -> Result<&'a str> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("missing key field {}", name))
}

/// Key predicate of a control or schema record.
pub fn entity_key(entity_set: &str, fields: &Map<String, Value>) -> Result<String> {
    let name = |field: &str| string_field(fields, field);
    let key = match entity_set {
        "Relation" | "Role" => format!(
            "(Name='{}',_Box.Name='{}')",
            name("Name")?,
            name("_Box.Name")?
        ),
        "ExtRole" => format!(
            "(ExtRole='{}',_Relation.Name='{}',_Relation._Box.Name='{}')",
            name("ExtRole")?,
            name("_Relation.Name")?,
            name("_Relation._Box.Name")?
        ),
        "Property" | "AssociationEnd" => format!(
            "(Name='{}',_EntityType.Name='{}')",
            name("Name")?,
            name("_EntityType.Name")?
        ),
        "ComplexTypeProperty" => format!(
            "(Name='{}',_ComplexType.Name='{}')",
            name("Name")?,
            name("_ComplexType.Name")?
        ),
        _ => format!("(Name='{}')", name("Name")?),
    };
    Ok(key)
}

/// Key predicate of a user record.
pub fn data_key(id: &str) -> String {
    format!("('{}')", id)
}

static RESOURCE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^[^/\\:*?"<>|\s\x00-\x1f]{1,256}$"#).expect("valid regex"));

/// Naming rule shared by collections and files.
pub fn is_valid_resource_name(name: &str) -> bool {
    name != "." && name != ".." && RESOURCE_NAME.is_match(name)
}

/// Path of `name` inside the collection at `parent`.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}
