//! In-memory reference backend.
//!
//! Holds cells, boxes, records, links and the collection tree in maps behind
//! a single lock. Suitable for tests and single-process deployments.

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use uuid::Uuid;

use super::{
    data_key, entity_key, join_path, Backend, BulkItem, CollectionHandle, EntityRef, ResourceKind,
    Scope,
};

/// A collection or file in a box's tree.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub path: String,
    pub parent: Option<Uuid>,
    pub kind: ResourceKind,
    pub children: Vec<Uuid>,
    pub acl: Option<String>,
    pub properties: Vec<String>,
    pub content_type: Option<String>,
    pub content: Vec<u8>,
}

impl Node {
    fn new(name: &str, path: String, parent: Option<Uuid>, kind: ResourceKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            path,
            parent,
            kind,
            children: Vec::new(),
            acl: None,
            properties: Vec::new(),
            content_type: None,
            content: Vec::new(),
        }
    }

    fn handle(&self) -> CollectionHandle {
        CollectionHandle {
            id: self.id,
            path: self.path.clone(),
            kind: self.kind,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub scope: Scope,
    pub source: EntityRef,
    pub nav: String,
    pub target: EntityRef,
}

type EntitySets = HashMap<String, BTreeMap<String, Map<String, Value>>>;

#[derive(Default)]
struct Inner {
    cells: HashSet<String>,
    boxes: HashMap<(String, String), Uuid>,
    records: HashMap<Scope, EntitySets>,
    links: Vec<Link>,
    nodes: HashMap<Uuid, Node>,
}

impl Inner {
    fn node(&self, id: Uuid) -> Result<&Node> {
        self.nodes.get(&id).ok_or_else(|| anyhow!("no such resource {}", id))
    }

    fn node_mut(&mut self, id: Uuid) -> Result<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| anyhow!("no such resource {}", id))
    }

    fn child_named(&self, parent: &Node, name: &str) -> Option<&Node> {
        parent
            .children
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .find(|child| child.name == name)
    }

    fn contains(&self, scope: &Scope, entity: &EntityRef) -> bool {
        self.records
            .get(scope)
            .and_then(|sets| sets.get(&entity.entity_set))
            .map(|set| set.contains_key(&entity.key))
            .unwrap_or(false)
    }

    fn check_scope(&self, scope: &Scope) -> Result<()> {
        match scope {
            Scope::Cell(cell) if self.cells.contains(cell) => Ok(()),
            Scope::Cell(cell) => Err(anyhow!("no such cell {}", cell)),
            Scope::Schema(id) | Scope::Data(id) => match self.node(*id)?.kind {
                ResourceKind::StructuredData => Ok(()),
                _ => Err(anyhow!("resource {} is not a structured-data collection", id)),
            },
        }
    }

    fn attach(&mut self, parent: Uuid, node: Node) -> Result<Uuid> {
        let id = node.id;
        self.node_mut(parent)?.children.push(id);
        self.nodes.insert(id, node);
        Ok(id)
    }
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn create_cell(&self, name: &str) {
        self.inner.write().cells.insert(name.to_string());
    }

    pub fn cell_exists(&self, name: &str) -> bool {
        self.inner.read().cells.contains(name)
    }

    pub fn box_exists(&self, cell: &str, box_name: &str) -> bool {
        self.inner
            .read()
            .boxes
            .contains_key(&(cell.to_string(), box_name.to_string()))
    }

    /// Identity recorded on the box's `__id` field.
    pub fn box_id(&self, cell: &str, box_name: &str) -> Option<Uuid> {
        let key = format!("(Name='{}')", box_name);
        self.record(&Scope::Cell(cell.to_string()), "Box", &key)
            .and_then(|fields| fields.get("__id").and_then(Value::as_str).map(str::to_string))
            .and_then(|id| Uuid::parse_str(&id).ok())
    }

    /// Name of a box in `cell` whose `Schema` field is `schema`.
    pub fn box_with_schema(&self, cell: &str, schema: &str) -> Option<String> {
        self.records(&Scope::Cell(cell.to_string()), "Box")
            .into_iter()
            .find(|fields| fields.get("Schema").and_then(Value::as_str) == Some(schema))
            .and_then(|fields| fields.get("Name").and_then(Value::as_str).map(str::to_string))
    }

    pub fn record(&self, scope: &Scope, entity_set: &str, key: &str) -> Option<Map<String, Value>> {
        self.inner
            .read()
            .records
            .get(scope)
            .and_then(|sets| sets.get(entity_set))
            .and_then(|set| set.get(key))
            .cloned()
    }

    pub fn records(&self, scope: &Scope, entity_set: &str) -> Vec<Map<String, Value>> {
        self.inner
            .read()
            .records
            .get(scope)
            .and_then(|sets| sets.get(entity_set))
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn links(&self) -> Vec<Link> {
        self.inner.read().links.clone()
    }

    /// Look up a node by its path relative to the box root.
    pub fn node(&self, cell: &str, box_name: &str, path: &str) -> Option<Node> {
        let inner = self.inner.read();
        let root = *inner.boxes.get(&(cell.to_string(), box_name.to_string()))?;
        let mut current = inner.nodes.get(&root)?;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = inner.child_named(current, segment)?;
        }
        Some(current.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryStore {
    fn create_record(
        &self,
        scope: &Scope,
        entity_set: &str,
        fields: Map<String, Value>,
    ) -> Result<String> {
        let key = entity_key(entity_set, &fields)?;
        let mut inner = self.inner.write();
        inner.check_scope(scope)?;
        if inner.contains(scope, &EntityRef::new(entity_set, key.clone())) {
            return Err(anyhow!("{}{} already exists", entity_set, key));
        }
        if let (Scope::Cell(cell), "Box") = (scope, entity_set) {
            let name = fields
                .get("Name")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("box name missing"))?
                .to_string();
            let root = Node::new(&name, "/".to_string(), None, ResourceKind::WebDav);
            inner.boxes.insert((cell.clone(), name), root.id);
            inner.nodes.insert(root.id, root);
        }
        inner
            .records
            .entry(scope.clone())
            .or_default()
            .entry(entity_set.to_string())
            .or_default()
            .insert(key.clone(), fields);
        Ok(key)
    }

    fn bulk_create(
        &self,
        collection: &CollectionHandle,
        items: &[BulkItem],
    ) -> Result<Vec<Result<()>>> {
        let mut inner = self.inner.write();
        let schema = Scope::Schema(collection.id);
        let data = Scope::Data(collection.id);
        inner.check_scope(&data)?;

        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            let entity_type = EntityRef::new("EntityType", format!("(Name='{}')", item.entity_set));
            if !inner.contains(&schema, &entity_type) {
                outcomes.push(Err(anyhow!("no such entity set {}", item.entity_set)));
                continue;
            }
            let key = data_key(&item.id);
            if inner.contains(&data, &EntityRef::new(item.entity_set.clone(), key.clone())) {
                outcomes.push(Err(anyhow!("{}{} already exists", item.entity_set, key)));
                continue;
            }
            let mut fields = item.fields.clone();
            fields.insert("__id".to_string(), Value::String(item.id.clone()));
            inner
                .records
                .entry(data.clone())
                .or_default()
                .entry(item.entity_set.clone())
                .or_default()
                .insert(key, fields);
            outcomes.push(Ok(()));
        }
        Ok(outcomes)
    }

    fn create_link(
        &self,
        scope: &Scope,
        source: &EntityRef,
        nav: &str,
        target: &EntityRef,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        for endpoint in [source, target] {
            if !inner.contains(scope, endpoint) {
                return Err(anyhow!("{}{} not found", endpoint.entity_set, endpoint.key));
            }
        }
        let link = Link {
            scope: scope.clone(),
            source: source.clone(),
            nav: nav.to_string(),
            target: target.clone(),
        };
        if inner.links.contains(&link) {
            return Err(anyhow!("link {} from {}{} already exists", nav, source.entity_set, source.key));
        }
        inner.links.push(link);
        Ok(())
    }

    fn box_root(&self, cell: &str, box_name: &str) -> Result<CollectionHandle> {
        let inner = self.inner.read();
        let id = inner
            .boxes
            .get(&(cell.to_string(), box_name.to_string()))
            .ok_or_else(|| anyhow!("no such box {}/{}", cell, box_name))?;
        Ok(inner.node(*id)?.handle())
    }

    fn create_collection(
        &self,
        parent: &CollectionHandle,
        name: &str,
        kind: ResourceKind,
    ) -> Result<CollectionHandle> {
        if !kind.is_collection() {
            return Err(anyhow!("{} is not a collection kind", kind.as_str()));
        }
        let mut inner = self.inner.write();
        let parent_node = inner.node(parent.id)?;
        if !parent_node.kind.is_collection() {
            return Err(anyhow!("{} is not a collection", parent_node.path));
        }
        if inner.child_named(parent_node, name).is_some() {
            return Err(anyhow!("{} already exists", join_path(&parent_node.path, name)));
        }
        let node = Node::new(name, join_path(&parent_node.path, name), Some(parent.id), kind);
        let handle = node.handle();
        inner.attach(parent.id, node)?;
        Ok(handle)
    }

    fn apply_acl(&self, node: Uuid, acl: &str) -> Result<()> {
        self.inner.write().node_mut(node)?.acl = Some(acl.to_string());
        Ok(())
    }

    fn apply_dead_properties(&self, node: Uuid, properties: &[String]) -> Result<()> {
        self.inner
            .write()
            .node_mut(node)?
            .properties
            .extend(properties.iter().cloned());
        Ok(())
    }

    fn put_file(
        &self,
        parent: &CollectionHandle,
        name: &str,
        content_type: &str,
        content: &mut dyn Read,
    ) -> Result<Uuid> {
        let mut bytes = Vec::new();
        content.read_to_end(&mut bytes)?;

        let mut inner = self.inner.write();
        let parent_node = inner.node(parent.id)?;
        if parent_node.kind != ResourceKind::WebDav {
            return Err(anyhow!("{} cannot hold files", parent_node.path));
        }
        if inner.child_named(parent_node, name).is_some() {
            return Err(anyhow!("{} already exists", join_path(&parent_node.path, name)));
        }
        let mut node = Node::new(
            name,
            join_path(&parent_node.path, name),
            Some(parent.id),
            ResourceKind::File,
        );
        node.content_type = Some(content_type.to_string());
        node.content = bytes;
        inner.attach(parent.id, node)
    }

    fn child_count(&self, collection: &CollectionHandle) -> Result<usize> {
        Ok(self.inner.read().node(collection.id)?.children.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn store_with_box() -> (MemoryStore, CollectionHandle) {
        let store = MemoryStore::new();
        store.create_cell("cell1");
        store
            .create_record(
                &Scope::Cell("cell1".into()),
                "Box",
                fields(json!({"Name": "box1", "__id": Uuid::nil().to_string()})),
            )
            .unwrap();
        let root = store.box_root("cell1", "box1").unwrap();
        (store, root)
    }

    #[test]
    fn test_box_lookup_by_schema() {
        let store = MemoryStore::new();
        store.create_cell("cell1");
        store
            .create_record(
                &Scope::Cell("cell1".into()),
                "Box",
                fields(json!({"Name": "box1", "Schema": "https://app.example/"})),
            )
            .unwrap();
        assert_eq!(
            store.box_with_schema("cell1", "https://app.example/").as_deref(),
            Some("box1")
        );
        assert!(store.box_with_schema("cell1", "https://other.example/").is_none());
        assert!(store.box_with_schema("cell2", "https://app.example/").is_none());
    }

    #[test]
    fn test_box_creation_registers_root() {
        let (store, root) = store_with_box();
        assert!(store.box_exists("cell1", "box1"));
        assert_eq!(store.box_id("cell1", "box1"), Some(Uuid::nil()));
        assert_eq!(root.path, "/");
        assert_eq!(root.kind, ResourceKind::WebDav);
    }

    #[test]
    fn test_record_in_unknown_cell_rejected() {
        let store = MemoryStore::new();
        let result = store.create_record(
            &Scope::Cell("nope".into()),
            "Role",
            fields(json!({"Name": "r", "_Box.Name": "b"})),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_record_rejected() {
        let (store, _) = store_with_box();
        let scope = Scope::Cell("cell1".into());
        let role = fields(json!({"Name": "staff", "_Box.Name": "box1"}));
        store.create_record(&scope, "Role", role.clone()).unwrap();
        assert!(store.create_record(&scope, "Role", role).is_err());
    }

    #[test]
    fn test_collection_tree_and_files() {
        let (store, root) = store_with_box();
        let dav = store.create_collection(&root, "docs", ResourceKind::WebDav).unwrap();
        assert_eq!(dav.path, "/docs");
        assert!(store.create_collection(&root, "docs", ResourceKind::WebDav).is_err());

        let mut content: &[u8] = b"hello";
        store.put_file(&dav, "a.txt", "text/plain", &mut content).unwrap();
        assert_eq!(store.child_count(&dav).unwrap(), 1);

        let file = store.node("cell1", "box1", "/docs/a.txt").unwrap();
        assert_eq!(file.content, b"hello");
        assert_eq!(file.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn test_bulk_create_reports_per_item_outcomes() {
        let (store, root) = store_with_box();
        let odata = store
            .create_collection(&root, "data", ResourceKind::StructuredData)
            .unwrap();
        store
            .create_record(&Scope::Schema(odata.id), "EntityType", fields(json!({"Name": "Sales"})))
            .unwrap();

        let items = vec![
            BulkItem { entity_set: "Sales".into(), id: "1".into(), fields: Map::new() },
            BulkItem { entity_set: "Sales".into(), id: "1".into(), fields: Map::new() },
            BulkItem { entity_set: "Missing".into(), id: "2".into(), fields: Map::new() },
        ];
        let outcomes = store.bulk_create(&odata, &items).unwrap();
        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].is_err());
        assert!(outcomes[2].is_err());
        assert_eq!(store.records(&Scope::Data(odata.id), "Sales").len(), 1);
    }

    #[test]
    fn test_link_requires_both_endpoints() {
        let (store, _) = store_with_box();
        let scope = Scope::Cell("cell1".into());
        let role = store
            .create_record(&scope, "Role", fields(json!({"Name": "staff", "_Box.Name": "box1"})))
            .unwrap();
        let relation = EntityRef::new("Relation", "(Name='friends',_Box.Name='box1')");
        let role = EntityRef::new("Role", role);

        assert!(store.create_link(&scope, &role, "_Relation", &relation).is_err());
        store
            .create_record(&scope, "Relation", fields(json!({"Name": "friends", "_Box.Name": "box1"})))
            .unwrap();
        store.create_link(&scope, &role, "_Relation", &relation).unwrap();
        assert_eq!(store.links().len(), 1);
    }
}
