//! Link creation for control objects (`70_links.json`) and user data
//! (`10_relationdata.json`).

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

use super::metadata::record_array;
use super::RunContext;
use crate::error::{InstallError, InstallResult};
use crate::messages;
use crate::storage::{data_key, CollectionHandle, EntityRef, Scope};

/// A link waiting to be created, with the archive entry it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingLink {
    pub scope: Scope,
    pub source: EntityRef,
    pub nav: String,
    pub target: EntityRef,
    pub origin: String,
}

/// Create links one at a time, in order. Progress is reported every
/// `links_output_stream_size` links and once at the end.
pub fn create_links(links: &[PendingLink], ctx: &mut RunContext) -> InstallResult<()> {
    let every = ctx.config.links_output_stream_size.max(1);
    let total = links.len();
    for (index, link) in links.iter().enumerate() {
        ctx.backend
            .create_link(&link.scope, &link.source, &link.nav, &link.target)
            .map_err(|e| {
                let detail = format!(
                    "{}{} -> {}{}: {}",
                    link.source.entity_set, link.source.key, link.target.entity_set, link.target.key, e
                );
                InstallError::link(link.origin.as_str(), detail)
            })?;
        let done = index + 1;
        if done % every == 0 && done != total {
            ctx.reporter.report(
                false,
                messages::ENTRY_PROCESSING,
                &link.origin,
                &format!("links {} / {}", done, total),
            );
        }
    }
    if let Some(last) = links.last() {
        ctx.reporter.report(
            false,
            messages::ENTRY_PROCESSING,
            &last.origin,
            &format!("links {} / {}", total, total),
        );
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DataLink {
    from_type: String,
    from_id: DataId,
    to_type: String,
    to_id: DataId,
}

#[derive(Deserialize)]
struct DataId {
    #[serde(rename = "__id")]
    id: String,
}

/// Parse a collection's `10_relationdata.json` into pending links between
/// user records. Both ends must name entity types declared by the schema.
pub fn parse_data_links(
    text: &str,
    origin: &str,
    entity_types: &HashSet<String>,
    collection: &CollectionHandle,
) -> InstallResult<Vec<PendingLink>> {
    let records = record_array(origin, text, "Links")?;
    let scope = Scope::Data(collection.id);
    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            let link: DataLink = serde_json::from_value(Value::Object(record))
                .map_err(|e| InstallError::format(origin, format!("link {}: {}", index, e)))?;
            for entity_type in [&link.from_type, &link.to_type] {
                if !entity_types.contains(entity_type) {
                    return Err(InstallError::schema_reference(
                        origin,
                        format!("link {}: entity type {} is not declared", index, entity_type),
                    ));
                }
            }
            Ok(PendingLink {
                scope: scope.clone(),
                source: EntityRef::new(link.from_type.clone(), data_key(&link.from_id.id)),
                nav: format!("_{}", link.to_type),
                target: EntityRef::new(link.to_type, data_key(&link.to_id.id)),
                origin: origin.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::ResourceKind;
    use uuid::Uuid;

    const ORIGIN: &str = "bar/90_contents/data/10_relationdata.json";

    fn collection() -> CollectionHandle {
        CollectionHandle {
            id: Uuid::nil(),
            path: "/data".into(),
            kind: ResourceKind::StructuredData,
        }
    }

    fn declared(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_parse_data_links() {
        let text = r#"{"Links":[
            {"FromType":"Sales","FromId":{"__id":"s1"},"ToType":"Product","ToId":{"__id":"p1"}}
        ]}"#;
        let links = parse_data_links(text, ORIGIN, &declared(&["Sales", "Product"]), &collection()).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].source, EntityRef::new("Sales", "('s1')"));
        assert_eq!(links[0].target, EntityRef::new("Product", "('p1')"));
        assert_eq!(links[0].nav, "_Product");
        assert_eq!(links[0].scope, Scope::Data(Uuid::nil()));
        assert_eq!(links[0].origin, ORIGIN);
    }

    #[test]
    fn test_undeclared_entity_type() {
        let text = r#"{"Links":[
            {"FromType":"Sales","FromId":{"__id":"s1"},"ToType":"Missing","ToId":{"__id":"m1"}}
        ]}"#;
        let err = parse_data_links(text, ORIGIN, &declared(&["Sales"]), &collection()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaReference);
        assert_eq!(err.path, ORIGIN);
    }

    #[test]
    fn test_missing_id() {
        let text = r#"{"Links":[{"FromType":"Sales","FromId":{},"ToType":"Sales","ToId":{"__id":"x"}}]}"#;
        let err = parse_data_links(text, ORIGIN, &declared(&["Sales"]), &collection()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Format);
    }
}
