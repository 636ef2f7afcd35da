//! Import of `bar/90_contents/`: collection content, schemas and user data.
//!
//! Each entry is routed by the collection tree built from the rootprops
//! descriptor. Entries inside a structured-data collection are buffered per
//! collection and flushed when the stream leaves that collection, when the
//! bulk batch is full, and at the end of the archive.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};

use super::bulk::{BulkLoader, BulkRequest};
use super::cursor::ArchiveEntry;
use super::hierarchy::{parent_path, resource_name, SOURCE_COLLECTION};
use super::job::{DoneSet, CONTENTS_DIR};
use super::links::{self, PendingLink};
use super::materialize::{self, MaterializedTree};
use super::rootprops::CollectionDescriptor;
use super::schema::{self, Schema};
use super::RunContext;
use crate::error::{ErrorKind, InstallError, InstallResult};
use crate::messages;
use crate::storage::{is_valid_resource_name, join_path, ResourceKind};

pub const SCHEMA_ENTRY: &str = "00_metadata.xml";
pub const RELATION_DATA_ENTRY: &str = "10_relationdata.json";
pub const DATA_DIR: &str = "90_data/";
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

static DATA_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+\.json$").expect("valid regex"));

static CONTENT_TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9!#$&^_.+-]*/[A-Za-z0-9][A-Za-z0-9!#$&^_.+-]*(\s*;.*)?$")
        .expect("valid regex")
});

/// Box-relative path of an entry under `bar/90_contents/`.
pub fn box_path(entry_name: &str) -> Option<String> {
    let rest = entry_name.strip_prefix(CONTENTS_DIR)?;
    let rest = rest.trim_end_matches('/');
    Some(format!("/{}", rest))
}

/// True when the stream is leaving the structured-data collection whose
/// records are currently buffered.
pub fn leaves_collection(current: Option<&str>, next: Option<&str>) -> bool {
    matches!(current, Some(current) if next != Some(current))
}

/// Schema entry of the first structured-data collection that never
/// received one.
pub fn first_missing_schema(tree: &MaterializedTree, done: &DoneSet) -> Option<String> {
    tree.collections
        .values()
        .filter(|handle| handle.kind == ResourceKind::StructuredData)
        .map(|handle| {
            format!(
                "{}{}/{}",
                CONTENTS_DIR,
                handle.path.trim_start_matches('/'),
                SCHEMA_ENTRY
            )
        })
        .find(|entry| !done.contains(entry))
}

/// Where an entry under `bar/90_contents/` goes.
#[derive(Clone, Debug, PartialEq)]
pub enum Route {
    /// The `bar/90_contents/` marker itself.
    Marker,
    /// Directory entry of a declared collection.
    Collection(String),
    /// Entry inside a structured-data collection; `rel` is relative to it.
    Data { collection: String, rel: String },
    /// A file stored under the WebDAV collection at `parent`.
    File {
        parent: String,
        name: String,
        declared: Option<CollectionDescriptor>,
    },
}

/// Resolve an entry against the collection tree. `None` means the entry
/// has nowhere to go.
pub fn route(entry_name: &str, is_dir: bool, tree: &MaterializedTree) -> Option<Route> {
    let path = box_path(entry_name)?;
    if path == "/" {
        return Some(Route::Marker);
    }
    if is_dir && tree.collections.contains_key(&path) {
        return Some(Route::Collection(path));
    }
    if !is_dir {
        if let Some(declared) = tree.files.get(&path) {
            return Some(Route::File {
                parent: parent_path(&path)?.to_string(),
                name: resource_name(&path).to_string(),
                declared: Some(declared.clone()),
            });
        }
    }

    let mut ancestor = parent_path(&path)?;
    while ancestor != "/" {
        if let Some(handle) = tree.collections.get(ancestor) {
            let direct = parent_path(&path) == Some(ancestor);
            return match handle.kind {
                ResourceKind::StructuredData => {
                    let mut rel = path[ancestor.len() + 1..].to_string();
                    if is_dir {
                        rel.push('/');
                    }
                    Some(Route::Data {
                        collection: ancestor.to_string(),
                        rel,
                    })
                }
                ResourceKind::Service if direct && !is_dir => Some(Route::File {
                    parent: join_path(ancestor, SOURCE_COLLECTION),
                    name: resource_name(&path).to_string(),
                    declared: None,
                }),
                ResourceKind::WebDav if direct && !is_dir => Some(Route::File {
                    parent: ancestor.to_string(),
                    name: resource_name(&path).to_string(),
                    declared: None,
                }),
                _ => None,
            };
        }
        ancestor = parent_path(ancestor)?;
    }
    None
}

/// Kinds of entries inside a structured-data collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataEntry {
    Schema,
    RelationData,
    DataDir,
    EntityDir(String),
    Record(String),
}

pub fn classify(rel: &str) -> Option<DataEntry> {
    match rel {
        SCHEMA_ENTRY => return Some(DataEntry::Schema),
        RELATION_DATA_ENTRY => return Some(DataEntry::RelationData),
        DATA_DIR => return Some(DataEntry::DataDir),
        _ => {}
    }
    let rest = rel.strip_prefix(DATA_DIR)?;
    match rest.split_once('/') {
        Some((entity_type, "")) if !entity_type.is_empty() => {
            Some(DataEntry::EntityDir(entity_type.to_string()))
        }
        Some((entity_type, file))
            if !entity_type.is_empty() && DATA_FILE.is_match(file) =>
        {
            Some(DataEntry::Record(entity_type.to_string()))
        }
        _ => None,
    }
}

/// Buffered state of the structured-data collection being read.
struct DataCollection {
    path: String,
    loader: BulkLoader,
    links: Vec<PendingLink>,
    link_entries: Vec<String>,
}

/// Content import state carried across entries.
#[derive(Default)]
pub struct ContentImporter {
    current: Option<DataCollection>,
    entity_types: HashMap<String, HashSet<String>>,
    relation_data: HashSet<String>,
    data_started: HashSet<String>,
}

impl ContentImporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the structured-data collection with buffered work.
    pub fn current_collection(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.path.as_str())
    }

    /// Process one entry under `bar/90_contents/`.
    pub fn accept(&mut self, entry: &mut ArchiveEntry<'_>, ctx: &mut RunContext) -> InstallResult<()> {
        let name = entry.name().to_string();
        let route = route(&name, entry.is_dir(), &ctx.tree)
            .ok_or_else(|| InstallError::routing(name.as_str()))?;

        let next = match &route {
            Route::Data { collection, .. } => Some(collection.as_str()),
            _ => None,
        };
        if leaves_collection(self.current_collection(), next) {
            self.flush(ctx)?;
        }

        match route {
            Route::Marker => {
                ctx.job.mark_done(CONTENTS_DIR);
                Ok(())
            }
            Route::Collection(_) => {
                ctx.job.mark_done(&name);
                Ok(())
            }
            Route::Data { collection, rel } => self.accept_data(entry, &name, &collection, &rel, ctx),
            Route::File {
                parent,
                name: file_name,
                declared,
            } => {
                ctx.start_entry(&name);
                store_file(entry, &name, &parent, &file_name, declared.as_ref(), ctx)?;
                ctx.complete_entry(&name);
                Ok(())
            }
        }
    }

    fn accept_data(
        &mut self,
        entry: &mut ArchiveEntry<'_>,
        name: &str,
        collection: &str,
        rel: &str,
        ctx: &mut RunContext,
    ) -> InstallResult<()> {
        let kind = classify(rel).ok_or_else(|| InstallError::routing(name))?;
        if self.current.is_none() {
            let handle = ctx
                .tree
                .collections
                .get(collection)
                .cloned()
                .ok_or_else(|| InstallError::routing(name))?;
            self.current = Some(DataCollection {
                path: collection.to_string(),
                loader: BulkLoader::new(handle, ctx.config.bulk_size),
                links: Vec::new(),
                link_entries: Vec::new(),
            });
        }

        match kind {
            DataEntry::Schema => {
                if self.entity_types.contains_key(collection) {
                    return Err(InstallError::structural(name, "schema appears twice"));
                }
                ctx.start_entry(name);
                let text = entry.read_text()?;
                let parsed = Schema::parse(&text, name)?;
                let handle = self.handle(collection, name, ctx)?;
                schema::import(&parsed, &handle, name, ctx)?;
                self.entity_types
                    .insert(collection.to_string(), parsed.entity_type_names());
                ctx.complete_entry(name);
            }
            DataEntry::RelationData => {
                let declared = self.declared_types(collection, name)?;
                if self.data_started.contains(collection) {
                    return Err(InstallError::structural(name, "relation data must precede 90_data"));
                }
                if self.relation_data.contains(collection) {
                    return Err(InstallError::structural(name, "relation data appears twice"));
                }
                ctx.start_entry(name);
                let text = entry.read_text()?;
                let handle = self.handle(collection, name, ctx)?;
                let pending = links::parse_data_links(&text, name, declared, &handle)?;
                self.relation_data.insert(collection.to_string());
                if let Some(current) = self.current.as_mut() {
                    current.links.extend(pending);
                    current.link_entries.push(name.to_string());
                }
            }
            DataEntry::DataDir => {
                self.declared_types(collection, name)?;
                self.data_started.insert(collection.to_string());
                ctx.job.mark_done(name);
            }
            DataEntry::EntityDir(entity_type) => {
                self.check_entity_type(collection, name, &entity_type)?;
                self.data_started.insert(collection.to_string());
                ctx.job.mark_done(name);
            }
            DataEntry::Record(entity_type) => {
                self.check_entity_type(collection, name, &entity_type)?;
                self.data_started.insert(collection.to_string());
                ctx.start_entry(name);
                let text = entry.read_text()?;
                let request = BulkRequest::parse(name, &entity_type, &text)?;
                let full = match self.current.as_mut() {
                    Some(current) => {
                        current.loader.push(request)?;
                        current.loader.is_full()
                    }
                    None => false,
                };
                if full {
                    if let Some(current) = self.current.as_mut() {
                        current.loader.flush(ctx)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle(
        &self,
        collection: &str,
        name: &str,
        ctx: &RunContext,
    ) -> InstallResult<crate::storage::CollectionHandle> {
        ctx.tree
            .collections
            .get(collection)
            .cloned()
            .ok_or_else(|| InstallError::routing(name))
    }

    fn declared_types(&self, collection: &str, name: &str) -> InstallResult<&HashSet<String>> {
        self.entity_types
            .get(collection)
            .ok_or_else(|| InstallError::structural(name, "entry precedes the collection schema"))
    }

    fn check_entity_type(&self, collection: &str, name: &str, entity_type: &str) -> InstallResult<()> {
        if self.declared_types(collection, name)?.contains(entity_type) {
            Ok(())
        } else {
            Err(InstallError::data(
                name,
                format!("entity type {} is not declared", entity_type),
            ))
        }
    }

    /// Write out buffered records, then the buffered links of the current
    /// collection. Relation data entries count as done once their links
    /// exist.
    pub fn flush(&mut self, ctx: &mut RunContext) -> InstallResult<()> {
        let Some(mut current) = self.current.take() else {
            return Ok(());
        };
        current.loader.flush(ctx)?;
        links::create_links(&current.links, ctx)?;
        for entry in &current.link_entries {
            ctx.complete_entry(entry);
        }
        Ok(())
    }
}

fn store_file(
    entry: &mut ArchiveEntry<'_>,
    name: &str,
    parent: &str,
    file_name: &str,
    declared: Option<&CollectionDescriptor>,
    ctx: &mut RunContext,
) -> InstallResult<()> {
    if !is_valid_resource_name(file_name) {
        return Err(InstallError::hierarchy(messages::INVALID_NAME, name));
    }
    let handle = ctx
        .tree
        .collections
        .get(parent)
        .cloned()
        .ok_or_else(|| InstallError::routing(name))?;

    let children = ctx
        .backend
        .child_count(&handle)
        .map_err(|e| InstallError::data(name, e.to_string()))?;
    if children >= ctx.config.max_child_resource_count {
        return Err(InstallError::quota(
            name,
            format!("{} already holds {} resources", handle.path, children),
        ));
    }

    let content_type = declared
        .and_then(|d| d.content_type.as_deref())
        .unwrap_or(DEFAULT_CONTENT_TYPE);
    if !CONTENT_TYPE.is_match(content_type) {
        return Err(InstallError::new(
            ErrorKind::Format,
            messages::INVALID_CONTENT_TYPE,
            name,
            content_type,
        ));
    }

    let node = ctx
        .backend
        .put_file(&handle, file_name, content_type, entry.content())
        .map_err(|e| InstallError::new(ErrorKind::Data, messages::FILE_STORE_FAILED, name, e.to_string()))?;
    if let Some(declared) = declared {
        materialize::apply_properties(node, declared, ctx)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstallConfig;
    use crate::installer::job::InstallJob;
    use crate::progress::{MemoryProgressCache, ProgressCache, ProgressRecord, Reporter};
    use crate::storage::{Backend, CollectionHandle, MemoryStore, Scope};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    const SCHEMA: &str = r#"<edmx:Edmx Version="1.0" xmlns:edmx="http://schemas.microsoft.com/ado/2007/06/edmx">
      <edmx:DataServices>
        <Schema Namespace="UserData" xmlns="http://schemas.microsoft.com/ado/2006/04/edm">
          <EntityType Name="Sales"><Property Name="amount" Type="Edm.Int32"/></EntityType>
        </Schema>
      </edmx:DataServices>
    </edmx:Edmx>"#;

    const RELATION_DATA: &str = "bar/90_contents/data/10_relationdata.json";

    fn tree() -> MaterializedTree {
        let mut tree = MaterializedTree::default();
        for (path, kind) in [
            ("/", ResourceKind::WebDav),
            ("/dav", ResourceKind::WebDav),
            ("/data", ResourceKind::StructuredData),
            ("/svc", ResourceKind::Service),
            ("/svc/__src", ResourceKind::WebDav),
        ] {
            tree.collections.insert(
                path.to_string(),
                CollectionHandle {
                    id: Uuid::new_v4(),
                    path: path.to_string(),
                    kind,
                },
            );
        }
        tree.files.insert(
            "/readme.txt".to_string(),
            CollectionDescriptor {
                path: "/readme.txt".into(),
                kind: ResourceKind::File,
                acl: None,
                properties: Vec::new(),
                content_type: Some("text/plain".into()),
            },
        );
        tree
    }

    #[test]
    fn test_leaves_collection() {
        assert!(!leaves_collection(None, Some("/data")));
        assert!(!leaves_collection(Some("/data"), Some("/data")));
        assert!(leaves_collection(Some("/data"), Some("/other")));
        assert!(leaves_collection(Some("/data"), None));
    }

    #[test]
    fn test_route_collections_and_files() {
        let tree = tree();
        assert_eq!(route("bar/90_contents/", true, &tree), Some(Route::Marker));
        assert_eq!(
            route("bar/90_contents/dav/", true, &tree),
            Some(Route::Collection("/dav".into()))
        );
        assert_eq!(
            route("bar/90_contents/dav/a.txt", false, &tree),
            Some(Route::File {
                parent: "/dav".into(),
                name: "a.txt".into(),
                declared: None
            })
        );
        match route("bar/90_contents/readme.txt", false, &tree) {
            Some(Route::File { parent, declared, .. }) => {
                assert_eq!(parent, "/");
                assert!(declared.is_some());
            }
            other => panic!("unexpected route {:?}", other),
        }
        assert_eq!(route("bar/90_contents/stray.txt", false, &tree), None);
        assert_eq!(route("bar/90_contents/dav/sub/a.txt", false, &tree), None);
    }

    #[test]
    fn test_route_service_source() {
        let tree = tree();
        assert_eq!(
            route("bar/90_contents/svc/hello.js", false, &tree),
            Some(Route::File {
                parent: "/svc/__src".into(),
                name: "hello.js".into(),
                declared: None
            })
        );
        assert_eq!(
            route("bar/90_contents/svc/__src/hello.js", false, &tree),
            Some(Route::File {
                parent: "/svc/__src".into(),
                name: "hello.js".into(),
                declared: None
            })
        );
    }

    #[test]
    fn test_route_structured_data() {
        let tree = tree();
        assert_eq!(
            route("bar/90_contents/data/90_data/Sales/", true, &tree),
            Some(Route::Data {
                collection: "/data".into(),
                rel: "90_data/Sales/".into()
            })
        );
        assert_eq!(
            route("bar/90_contents/data/00_metadata.xml", false, &tree),
            Some(Route::Data {
                collection: "/data".into(),
                rel: "00_metadata.xml".into()
            })
        );
    }

    #[test]
    fn test_classify_data_entries() {
        assert_eq!(classify("00_metadata.xml"), Some(DataEntry::Schema));
        assert_eq!(classify("10_relationdata.json"), Some(DataEntry::RelationData));
        assert_eq!(classify("90_data/"), Some(DataEntry::DataDir));
        assert_eq!(classify("90_data/Sales/"), Some(DataEntry::EntityDir("Sales".into())));
        assert_eq!(classify("90_data/Sales/12.json"), Some(DataEntry::Record("Sales".into())));
        assert_eq!(classify("90_data/Sales/a.json"), None);
        assert_eq!(classify("90_data/Sales/1/2.json"), None);
        assert_eq!(classify("20_other.json"), None);
    }

    #[test]
    fn test_first_missing_schema() {
        let tree = tree();
        let mut done = DoneSet::default();
        assert_eq!(
            first_missing_schema(&tree, &done).as_deref(),
            Some("bar/90_contents/data/00_metadata.xml")
        );
        done.insert("bar/90_contents/data/00_metadata.xml");
        assert_eq!(first_missing_schema(&tree, &done), None);
        assert_eq!(first_missing_schema(&MaterializedTree::default(), &DoneSet::default()), None);
    }

    #[test]
    fn test_relation_data_accepted_once_per_collection() {
        let store = MemoryStore::new();
        store.create_cell("cell1");
        let fields = json!({"Name": "box1", "__id": Uuid::nil().to_string()});
        store
            .create_record(&Scope::Cell("cell1".into()), "Box", fields.as_object().cloned().unwrap())
            .unwrap();
        let root = store.box_root("cell1", "box1").unwrap();
        let data = store
            .create_collection(&root, "data", ResourceKind::StructuredData)
            .unwrap();

        let mut tree = MaterializedTree::default();
        tree.collections.insert("/".into(), root);
        tree.collections.insert("/data".into(), data);
        let config = InstallConfig::default();
        let job = InstallJob::new("cell1", "box1", "/tmp/unused.bar");
        let cache: Arc<dyn ProgressCache> = Arc::new(MemoryProgressCache::new(Duration::from_secs(60)));
        let reporter = Reporter::new(ProgressRecord::new(job.box_id, "cell1", "box1", 3), cache);
        let mut ctx = RunContext {
            job,
            reporter,
            backend: &store,
            config: &config,
            tree,
        };

        let mut importer = ContentImporter::new();
        let mut schema = ArchiveEntry::in_memory("bar/90_contents/data/00_metadata.xml", SCHEMA.as_bytes());
        importer.accept(&mut schema, &mut ctx).unwrap();
        let mut first = ArchiveEntry::in_memory(RELATION_DATA, br#"{"Links":[]}"#);
        importer.accept(&mut first, &mut ctx).unwrap();

        let mut second = ArchiveEntry::in_memory(RELATION_DATA, br#"{"Links":[]}"#);
        let err = importer.accept(&mut second, &mut ctx).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Structural);
        assert_eq!(err.path, RELATION_DATA);

        importer.flush(&mut ctx).unwrap();
        assert_eq!(ctx.job.counter, 2);
    }

    #[test]
    fn test_content_type_pattern() {
        assert!(CONTENT_TYPE.is_match("text/plain"));
        assert!(CONTENT_TYPE.is_match("application/json; charset=utf-8"));
        assert!(CONTENT_TYPE.is_match(DEFAULT_CONTENT_TYPE));
        assert!(!CONTENT_TYPE.is_match("plain"));
        assert!(!CONTENT_TYPE.is_match("text/"));
    }
}
