//! Creation of the declared collection tree.

use std::collections::BTreeMap;
use uuid::Uuid;

use super::hierarchy::{parent_path, resource_name, Hierarchy};
use super::rootprops::{AclFragment, CollectionDescriptor};
use super::RunContext;
use crate::error::{InstallError, InstallResult};
use crate::messages;
use crate::storage::{CollectionHandle, ResourceKind};

/// Handles of created collections and the declared bare files, both keyed
/// by box-relative path.
#[derive(Clone, Debug, Default)]
pub struct MaterializedTree {
    pub collections: BTreeMap<String, CollectionHandle>,
    pub files: BTreeMap<String, CollectionDescriptor>,
}

/// Rebase a role-class URL onto `base_url`, substituting the target cell and
/// box for the first and third path segments.
pub fn role_base(
    original: &str,
    base_url: &str,
    cell: &str,
    box_name: &str,
) -> Option<String> {
    let (_, after_scheme) = original.split_once("://")?;
    let path = &after_scheme[after_scheme.find('/')?..];
    let mut segments: Vec<&str> = path.split('/').collect();
    if segments.len() < 4 {
        return None;
    }
    segments[1] = cell;
    segments[3] = box_name;
    Some(format!("{}{}", base_url.trim_end_matches('/'), segments.join("/")))
}

/// Create every non-root collection parent-first, then apply ACLs and dead
/// properties. Bare files are only recorded; their content arrives later.
pub fn materialize(hierarchy: &Hierarchy, ctx: &mut RunContext) -> InstallResult<MaterializedTree> {
    let mut tree = MaterializedTree::default();
    let mut ordered: Vec<&CollectionDescriptor> = hierarchy.values().collect();
    ordered.sort_by_key(|d| (depth(&d.path), d.path.clone()));

    for descriptor in ordered {
        let path = descriptor.path.as_str();
        if descriptor.kind == ResourceKind::File {
            tree.files.insert(path.to_string(), descriptor.clone());
            continue;
        }
        let handle = match parent_path(path) {
            None => ctx
                .backend
                .box_root(&ctx.job.cell, &ctx.job.box_name)
                .map_err(|e| InstallError::data(path, e.to_string()))?,
            Some(parent) => {
                let parent = tree
                    .collections
                    .get(parent)
                    .ok_or_else(|| InstallError::hierarchy(messages::MISSING_PARENT, path))?;
                ctx.backend
                    .create_collection(parent, resource_name(path), descriptor.kind)
                    .map_err(|e| InstallError::data(path, e.to_string()))?
            }
        };
        apply_properties(handle.id, descriptor, ctx)?;
        ctx.reporter
            .report(false, messages::ENTRY_PROCESSING, path, descriptor.kind.as_str());
        tree.collections.insert(path.to_string(), handle);
    }
    Ok(tree)
}

/// Apply a descriptor's ACL and dead properties to a created node.
pub fn apply_properties(
    node: Uuid,
    descriptor: &CollectionDescriptor,
    ctx: &mut RunContext,
) -> InstallResult<()> {
    let path = descriptor.path.as_str();
    if let Some(acl) = &descriptor.acl {
        let xml = render_acl(acl, path, ctx)?;
        ctx.backend
            .apply_acl(node, &xml)
            .map_err(|e| InstallError::data(path, e.to_string()))?;
    }
    if !descriptor.properties.is_empty() {
        ctx.backend
            .apply_dead_properties(node, &descriptor.properties)
            .map_err(|e| InstallError::data(path, e.to_string()))?;
    }
    Ok(())
}

fn render_acl(acl: &AclFragment, path: &str, ctx: &RunContext) -> InstallResult<String> {
    let Some(original) = acl.base.as_deref() else {
        return Ok(acl.render(None));
    };
    let base = role_base(original, &ctx.config.base_url, &ctx.job.cell, &ctx.job.box_name)
        .ok_or_else(|| InstallError::format(path, format!("invalid role base {}", original)))?;
    Ok(acl.render(Some(&base)))
}

fn depth(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_base_rewrites_cell_and_box() {
        assert_eq!(
            role_base(
                "https://old.example/oldcell/__role/__/",
                "http://localhost:3000/",
                "cell1",
                "box1"
            )
            .unwrap(),
            "http://localhost:3000/cell1/__role/box1/"
        );
        assert!(role_base("https://old.example/cell", "http://h", "c", "b").is_none());
        assert!(role_base("not a url", "http://h", "c", "b").is_none());
    }

    #[test]
    fn test_depth_orders_parents_first() {
        assert_eq!(depth("/"), 0);
        assert_eq!(depth("/a"), 1);
        assert_eq!(depth("/a/b"), 2);
    }
}
