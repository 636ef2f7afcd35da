//! Structural validation of the declared collection tree.

use std::collections::BTreeMap;

use super::rootprops::CollectionDescriptor;
use crate::error::{InstallError, InstallResult};
use crate::messages;
use crate::storage::{is_valid_resource_name, join_path, ResourceKind};

pub const SOURCE_COLLECTION: &str = "__src";

/// Validated tree, keyed by path relative to the box root.
pub type Hierarchy = BTreeMap<String, CollectionDescriptor>;

/// Immediate parent of a box-relative path; `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(index) => Some(&path[..index]),
        None => None,
    }
}

/// Last segment of a box-relative path.
pub fn resource_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Check that the descriptors form a single consistent tree. Depends only on
/// the descriptors, never on the order they appeared in the archive.
pub fn validate(descriptors: Vec<CollectionDescriptor>) -> InstallResult<Hierarchy> {
    let mut hierarchy = Hierarchy::new();
    for descriptor in descriptors {
        if hierarchy.contains_key(&descriptor.path) {
            return Err(InstallError::hierarchy(messages::DUPLICATE_PATH, descriptor.path));
        }
        hierarchy.insert(descriptor.path.clone(), descriptor);
    }

    for (path, descriptor) in &hierarchy {
        let Some(parent) = parent_path(path) else {
            if descriptor.kind != ResourceKind::WebDav {
                return Err(InstallError::hierarchy(messages::UNKNOWN_RESOURCE_TYPE, path.as_str()));
            }
            continue;
        };
        let parent = hierarchy
            .get(parent)
            .ok_or_else(|| InstallError::hierarchy(messages::MISSING_PARENT, path.as_str()))?;
        let name = resource_name(path);
        match parent.kind {
            ResourceKind::StructuredData => {
                return Err(InstallError::hierarchy(messages::STRUCTURED_DATA_CHILD, path.as_str()));
            }
            ResourceKind::Service
                if name != SOURCE_COLLECTION || descriptor.kind != ResourceKind::WebDav =>
            {
                return Err(InstallError::hierarchy(messages::SERVICE_CHILD, path.as_str()));
            }
            ResourceKind::File => {
                return Err(InstallError::hierarchy(messages::FILE_CHILD, path.as_str()));
            }
            _ => {}
        }
        if !is_valid_resource_name(name) {
            return Err(InstallError::hierarchy(messages::INVALID_NAME, path.as_str()));
        }
    }

    for (path, descriptor) in &hierarchy {
        if descriptor.kind == ResourceKind::Service
            && !hierarchy.contains_key(&join_path(path, SOURCE_COLLECTION))
        {
            return Err(InstallError::hierarchy(messages::MISSING_SOURCE, path.as_str()));
        }
    }
    Ok(hierarchy)
}
