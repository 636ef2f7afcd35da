//! Top-level descriptor entries under `bar/00_meta/`.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::hierarchy;
use super::job::{EXT_ROLES, LINKS, MANIFEST, RELATIONS, ROLES, ROOTPROPS};
use super::links::{self, PendingLink};
use super::materialize;
use super::rootprops::{self, CollectionDescriptor};
use super::RunContext;
use crate::error::{InstallError, InstallResult};
use crate::storage::{entity_key, EntityRef, Scope};

/// Box manifest (`00_manifest.json`).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Manifest {
    pub bar_version: String,
    pub box_version: String,
    pub default_path: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
}

impl Manifest {
    pub fn parse(name: &str, text: &str) -> InstallResult<Self> {
        serde_json::from_str(text).map_err(|e| InstallError::format(name, e.to_string()))
    }
}

/// Control object types that links may connect.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub enum LinkType {
    Relation,
    Role,
    ExtRole,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Relation => "Relation",
            LinkType::Role => "Role",
            LinkType::ExtRole => "ExtRole",
        }
    }
}

/// One record of `70_links.json`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct MetaLink {
    pub from_type: LinkType,
    pub from_name: Map<String, Value>,
    pub to_type: LinkType,
    pub to_name: Map<String, Value>,
}

/// A parsed descriptor entry, dispatched once on its archive name.
#[derive(Clone, Debug)]
pub enum Descriptor {
    Manifest(Manifest),
    Relations(Vec<Map<String, Value>>),
    Roles(Vec<Map<String, Value>>),
    ExtRoles(Vec<Map<String, Value>>),
    Links(Vec<MetaLink>),
    Rootprops(Vec<CollectionDescriptor>),
}

impl Descriptor {
    pub fn parse(name: &str, text: &str) -> InstallResult<Self> {
        match name {
            MANIFEST => Manifest::parse(name, text).map(Descriptor::Manifest),
            RELATIONS => {
                let records = record_array(name, text, "Relations")?;
                require_fields(name, &records, &["Name"])?;
                Ok(Descriptor::Relations(records))
            }
            ROLES => {
                let records = record_array(name, text, "Roles")?;
                require_fields(name, &records, &["Name"])?;
                Ok(Descriptor::Roles(records))
            }
            EXT_ROLES => {
                let records = record_array(name, text, "ExtRoles")?;
                require_fields(name, &records, &["ExtRole", "_Relation.Name"])?;
                Ok(Descriptor::ExtRoles(records))
            }
            LINKS => {
                let records = record_array(name, text, "Links")?;
                let links = records
                    .into_iter()
                    .enumerate()
                    .map(|(index, record)| parse_meta_link(name, index, record))
                    .collect::<InstallResult<Vec<_>>>()?;
                Ok(Descriptor::Links(links))
            }
            ROOTPROPS => Ok(Descriptor::Rootprops(rootprops::parse(text, name)?)),
            _ => Err(InstallError::structural(name, "unknown entry")),
        }
    }

    /// Apply the descriptor's effects to the backend.
    pub fn apply(self, name: &str, ctx: &mut RunContext) -> InstallResult<()> {
        let box_name = ctx.job.box_name.clone();
        match self {
            Descriptor::Manifest(manifest) => create_box(name, manifest, ctx),
            Descriptor::Relations(records) => {
                create_records(name, "Relation", records, "_Box.Name", &box_name, ctx)
            }
            Descriptor::Roles(records) => {
                create_records(name, "Role", records, "_Box.Name", &box_name, ctx)
            }
            Descriptor::ExtRoles(records) => create_records(
                name,
                "ExtRole",
                records,
                "_Relation._Box.Name",
                &box_name,
                ctx,
            ),
            Descriptor::Links(records) => {
                let scope = ctx.cell_scope();
                let pending = records
                    .iter()
                    .map(|link| pending_meta_link(name, link, &scope, &box_name))
                    .collect::<InstallResult<Vec<_>>>()?;
                links::create_links(&pending, ctx)
            }
            Descriptor::Rootprops(descriptors) => {
                let hierarchy = hierarchy::validate(descriptors)?;
                ctx.tree = materialize::materialize(&hierarchy, ctx)?;
                Ok(())
            }
        }
    }
}

/// Parse `{"<field>": [ {..}, .. ]}`; the root must hold exactly that field.
pub(crate) fn record_array(
    name: &str,
    text: &str,
    field: &str,
) -> InstallResult<Vec<Map<String, Value>>> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| InstallError::format(name, e.to_string()))?;
    let Value::Object(mut root) = value else {
        return Err(InstallError::format(name, "root must be an object"));
    };
    if root.len() != 1 || !root.contains_key(field) {
        return Err(InstallError::format(name, format!("root must only contain {}", field)));
    }
    let Some(Value::Array(items)) = root.remove(field) else {
        return Err(InstallError::format(name, format!("{} must be an array", field)));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(record) => Ok(record),
            _ => Err(InstallError::format(
                name,
                format!("{}[{}] must be an object", field, index),
            )),
        })
        .collect()
}

fn require_fields(name: &str, records: &[Map<String, Value>], fields: &[&str]) -> InstallResult<()> {
    for (index, record) in records.iter().enumerate() {
        for field in fields {
            match record.get(*field) {
                Some(Value::String(s)) if !s.is_empty() => {}
                _ => {
                    return Err(InstallError::format(
                        name,
                        format!("record {} requires {}", index, field),
                    ))
                }
            }
        }
    }
    Ok(())
}

fn parse_meta_link(name: &str, index: usize, record: Map<String, Value>) -> InstallResult<MetaLink> {
    let link: MetaLink = serde_json::from_value(Value::Object(record))
        .map_err(|e| InstallError::format(name, format!("link {}: {}", index, e)))?;
    for (side, names) in [("FromName", &link.from_name), ("ToName", &link.to_name)] {
        if names.is_empty() || names.values().any(Value::is_null) {
            return Err(InstallError::format(
                name,
                format!("link {}: {} must name its target", index, side),
            ));
        }
    }
    Ok(link)
}

/// Address of a control object named by a link side, owned by `box_name`.
fn control_ref(
    name: &str,
    link_type: LinkType,
    names: &Map<String, Value>,
    box_name: &str,
) -> InstallResult<EntityRef> {
    let mut fields = names.clone();
    let owner = match link_type {
        LinkType::ExtRole => "_Relation._Box.Name",
        LinkType::Relation | LinkType::Role => "_Box.Name",
    };
    fields.insert(owner.to_string(), Value::String(box_name.to_string()));
    let key = entity_key(link_type.as_str(), &fields)
        .map_err(|e| InstallError::format(name, e.to_string()))?;
    Ok(EntityRef::new(link_type.as_str(), key))
}

fn pending_meta_link(
    name: &str,
    link: &MetaLink,
    scope: &Scope,
    box_name: &str,
) -> InstallResult<PendingLink> {
    Ok(PendingLink {
        scope: scope.clone(),
        source: control_ref(name, link.from_type, &link.from_name, box_name)?,
        nav: format!("_{}", link.to_type.as_str()),
        target: control_ref(name, link.to_type, &link.to_name, box_name)?,
        origin: name.to_string(),
    })
}

fn create_box(name: &str, manifest: Manifest, ctx: &mut RunContext) -> InstallResult<()> {
    let mut fields = Map::new();
    fields.insert("Name".into(), Value::String(ctx.job.box_name.clone()));
    fields.insert("__id".into(), Value::String(ctx.job.box_id.to_string()));
    if let Some(schema) = &manifest.schema {
        fields.insert("Schema".into(), Value::String(schema.clone()));
    }
    fields.insert("BoxVersion".into(), Value::String(manifest.box_version.clone()));
    fields.insert("DefaultPath".into(), Value::String(manifest.default_path.clone()));

    ctx.backend
        .create_record(&ctx.cell_scope(), "Box", fields)
        .map_err(|e| InstallError::data(name, e.to_string()))?;
    ctx.reporter.set_schema(manifest.schema);
    Ok(())
}

fn create_records(
    name: &str,
    entity_set: &str,
    records: Vec<Map<String, Value>>,
    owner_field: &str,
    box_name: &str,
    ctx: &mut RunContext,
) -> InstallResult<()> {
    let scope = ctx.cell_scope();
    for mut record in records {
        record.insert(owner_field.to_string(), Value::String(box_name.to_string()));
        ctx.backend
            .create_record(&scope, entity_set, record)
            .map_err(|e| InstallError::data(name, e.to_string()))?;
    }
    Ok(())
}
