//! Import of a structured-data collection's schema document (`00_metadata.xml`).
//!
//! The document is an EDMX/CSDL description. Only the parts that define
//! types are read: entity types, complex types, their properties and
//! associations between entity types. Elements are matched by local name.

use roxmltree::{Document, Node};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use super::RunContext;
use crate::error::{InstallError, InstallResult};
use crate::messages;
use crate::storage::{entity_key, CollectionHandle, EntityRef, Scope};

const PRIMITIVE_PREFIX: &str = "Edm.";
const MULTIPLICITIES: [&str; 3] = ["0..1", "1", "*"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyDef {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub collection_kind: Option<String>,
}

impl PropertyDef {
    /// Complex type this property refers to, if it is not primitive.
    pub fn complex_type(&self) -> Option<&str> {
        if self.type_name.starts_with(PRIMITIVE_PREFIX) {
            None
        } else {
            Some(self.type_name.as_str())
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeDef {
    pub name: String,
    pub properties: Vec<PropertyDef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssociationEndDef {
    pub entity_type: String,
    pub role: String,
    pub multiplicity: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssociationDef {
    pub name: String,
    pub ends: [AssociationEndDef; 2],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schema {
    pub complex_types: Vec<TypeDef>,
    pub entity_types: Vec<TypeDef>,
    pub associations: Vec<AssociationDef>,
}

fn attr<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.attributes()
        .find(|a| a.name() == name)
        .map(|a| a.value())
}

fn children<'a, 'input>(node: Node<'a, 'input>, name: &'static str) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

/// Strip a schema namespace qualifier (`UserData.Address` -> `Address`).
fn local_type(type_name: &str, namespaces: &HashSet<String>) -> String {
    if type_name.starts_with(PRIMITIVE_PREFIX) {
        return type_name.to_string();
    }
    match type_name.rsplit_once('.') {
        Some((namespace, local)) if namespaces.contains(namespace) => local.to_string(),
        _ => type_name.to_string(),
    }
}

impl Schema {
    /// Parse and validate a schema document.
    pub fn parse(xml: &str, path: &str) -> InstallResult<Self> {
        let doc = Document::parse(xml).map_err(|e| InstallError::format(path, e.to_string()))?;
        let schemas: Vec<Node> = doc
            .descendants()
            .filter(|n| n.is_element() && n.tag_name().name() == "Schema")
            .collect();
        if schemas.is_empty() {
            return Err(InstallError::format(path, "no Schema element"));
        }
        let namespaces: HashSet<String> = schemas
            .iter()
            .filter_map(|s| attr(*s, "Namespace"))
            .map(str::to_string)
            .collect();

        let mut schema = Schema::default();
        for node in &schemas {
            for complex in children(*node, "ComplexType") {
                schema.complex_types.push(parse_type(complex, path, &namespaces)?);
            }
            for entity in children(*node, "EntityType") {
                schema.entity_types.push(parse_type(entity, path, &namespaces)?);
            }
            for association in children(*node, "Association") {
                schema
                    .associations
                    .push(parse_association(association, path, &namespaces)?);
            }
        }
        schema.validate(path)?;
        Ok(schema)
    }

    pub fn entity_type_names(&self) -> HashSet<String> {
        self.entity_types.iter().map(|t| t.name.clone()).collect()
    }

    fn validate(&self, path: &str) -> InstallResult<()> {
        let complex: HashSet<&str> = self.complex_types.iter().map(|t| t.name.as_str()).collect();
        let entities: HashSet<&str> = self.entity_types.iter().map(|t| t.name.as_str()).collect();

        for type_def in self.complex_types.iter().chain(&self.entity_types) {
            for property in &type_def.properties {
                if let Some(target) = property.complex_type() {
                    if !complex.contains(target) {
                        return Err(InstallError::schema_reference(
                            path,
                            format!("{}.{} has undeclared type {}", type_def.name, property.name, target),
                        ));
                    }
                }
            }
        }
        for association in &self.associations {
            for end in &association.ends {
                if !entities.contains(end.entity_type.as_str()) {
                    return Err(InstallError::schema_reference(
                        path,
                        format!("{} refers to undeclared entity type {}", association.name, end.entity_type),
                    ));
                }
            }
        }
        self.check_complex_cycles(path)
    }

    /// Reject complex types that contain themselves, directly or not.
    fn check_complex_cycles(&self, path: &str) -> InstallResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let edges: HashMap<&str, Vec<&str>> = self
            .complex_types
            .iter()
            .map(|t| {
                let targets = t.properties.iter().filter_map(PropertyDef::complex_type).collect();
                (t.name.as_str(), targets)
            })
            .collect();

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        for &start in edges.keys() {
            if marks.contains_key(start) {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            marks.insert(start, Mark::Visiting);
            while let Some((current, next)) = stack.pop() {
                let targets = edges.get(current).map(Vec::as_slice).unwrap_or(&[]);
                if let Some(&target) = targets.get(next) {
                    stack.push((current, next + 1));
                    match marks.get(target) {
                        Some(Mark::Visiting) => {
                            return Err(InstallError::format(
                                path,
                                format!("circular complex type reference through {}", target),
                            ))
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(target, Mark::Visiting);
                            stack.push((target, 0));
                        }
                    }
                } else {
                    marks.insert(current, Mark::Done);
                }
            }
        }
        Ok(())
    }
}

fn parse_type(node: Node, path: &str, namespaces: &HashSet<String>) -> InstallResult<TypeDef> {
    let name = attr(node, "Name")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| InstallError::format(path, "type without Name"))?;
    let mut properties = Vec::new();
    for property in children(node, "Property") {
        let property_name = attr(property, "Name")
            .ok_or_else(|| InstallError::format(path, format!("property of {} without Name", name)))?;
        if property_name.starts_with('_') {
            continue;
        }
        let type_name = attr(property, "Type").ok_or_else(|| {
            InstallError::format(path, format!("{}.{} without Type", name, property_name))
        })?;
        let collection_kind = attr(property, "CollectionKind").map(str::to_string);
        if let Some(kind) = &collection_kind {
            if kind != "None" && kind != "List" {
                return Err(InstallError::format(
                    path,
                    format!("{}.{} has unsupported CollectionKind {}", name, property_name, kind),
                ));
            }
        }
        properties.push(PropertyDef {
            name: property_name.to_string(),
            type_name: local_type(type_name, namespaces),
            nullable: attr(property, "Nullable").map(|v| v != "false").unwrap_or(true),
            default_value: attr(property, "DefaultValue").map(str::to_string),
            collection_kind,
        });
    }
    Ok(TypeDef {
        name: name.to_string(),
        properties,
    })
}

fn parse_association(
    node: Node,
    path: &str,
    namespaces: &HashSet<String>,
) -> InstallResult<AssociationDef> {
    let name = attr(node, "Name").unwrap_or_default().to_string();
    let ends = children(node, "End")
        .map(|end| {
            let role = attr(end, "Role").unwrap_or_default();
            let (role_type, role_name) = role
                .split_once(':')
                .filter(|(t, r)| !t.is_empty() && !r.is_empty() && !r.contains(':'))
                .ok_or_else(|| InstallError::format(path, format!("invalid association role '{}'", role)))?;
            let multiplicity = attr(end, "Multiplicity").unwrap_or_default();
            if !MULTIPLICITIES.contains(&multiplicity) {
                return Err(InstallError::format(
                    path,
                    format!("invalid multiplicity '{}' in {}", multiplicity, name),
                ));
            }
            let entity_type = attr(end, "Type")
                .map(|t| local_type(t, namespaces))
                .unwrap_or_else(|| role_type.to_string());
            Ok(AssociationEndDef {
                entity_type,
                role: role_name.to_string(),
                multiplicity: multiplicity.to_string(),
            })
        })
        .collect::<InstallResult<Vec<_>>>()?;
    let ends: [AssociationEndDef; 2] = ends
        .try_into()
        .map_err(|_| InstallError::format(path, format!("association {} needs two ends", name)))?;
    Ok(AssociationDef { name, ends })
}

fn property_record(owner_field: &str, owner: &str, property: &PropertyDef) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("Name".into(), Value::String(property.name.clone()));
    fields.insert(owner_field.into(), Value::String(owner.to_string()));
    fields.insert("Type".into(), Value::String(property.type_name.clone()));
    fields.insert("Nullable".into(), Value::Bool(property.nullable));
    fields.insert(
        "DefaultValue".into(),
        property.default_value.clone().map(Value::String).unwrap_or(Value::Null),
    );
    fields.insert(
        "CollectionKind".into(),
        Value::String(property.collection_kind.clone().unwrap_or_else(|| "None".into())),
    );
    fields
}

fn named(name: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("Name".into(), Value::String(name.to_string()));
    fields
}

/// Create the schema's records in dependency order: complex types, entity
/// types, then associations.
pub fn import(
    schema: &Schema,
    collection: &CollectionHandle,
    entry: &str,
    ctx: &mut RunContext,
) -> InstallResult<()> {
    let scope = Scope::Schema(collection.id);

    for complex in &schema.complex_types {
        create_record(ctx, &scope, entry, "ComplexType", named(&complex.name))?;
        report_type(ctx, collection, "ComplexType", &complex.name);
    }
    for complex in &schema.complex_types {
        for property in &complex.properties {
            let fields = property_record("_ComplexType.Name", &complex.name, property);
            create_record(ctx, &scope, entry, "ComplexTypeProperty", fields)?;
        }
    }
    for entity in &schema.entity_types {
        create_record(ctx, &scope, entry, "EntityType", named(&entity.name))?;
        for property in &entity.properties {
            let fields = property_record("_EntityType.Name", &entity.name, property);
            create_record(ctx, &scope, entry, "Property", fields)?;
        }
        report_type(ctx, collection, "EntityType", &entity.name);
    }
    for association in &schema.associations {
        let mut refs = Vec::with_capacity(2);
        for end in &association.ends {
            let mut fields = named(&end.role);
            fields.insert("_EntityType.Name".into(), Value::String(end.entity_type.clone()));
            fields.insert("Multiplicity".into(), Value::String(end.multiplicity.clone()));
            let key = entity_key("AssociationEnd", &fields)
                .map_err(|e| InstallError::format(entry, e.to_string()))?;
            create_record(ctx, &scope, entry, "AssociationEnd", fields)?;
            refs.push(EntityRef::new("AssociationEnd", key));
        }
        ctx.backend
            .create_link(&scope, &refs[0], "_AssociationEnd", &refs[1])
            .map_err(|e| InstallError::link(entry, e.to_string()))?;
        report_type(ctx, collection, "Association", &association.name);
    }
    Ok(())
}

fn create_record(
    ctx: &RunContext,
    scope: &Scope,
    entry: &str,
    entity_set: &str,
    fields: Map<String, Value>,
) -> InstallResult<()> {
    ctx.backend
        .create_record(scope, entity_set, fields)
        .map(|_| ())
        .map_err(|e| InstallError::data(entry, e.to_string()))
}

fn report_type(ctx: &mut RunContext, collection: &CollectionHandle, kind: &str, name: &str) {
    let path = format!(
        "/{}/{}{}/{}('{}')",
        ctx.job.cell,
        ctx.job.box_name,
        collection.path,
        kind,
        name
    );
    ctx.reporter
        .report(false, messages::ENTRY_COMPLETED, &path, "");
}
