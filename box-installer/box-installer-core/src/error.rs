//! Failure taxonomy for install runs.

use serde::Serialize;
use thiserror::Error;

use crate::messages;

/// Category of an install failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Structural,
    Format,
    Hierarchy,
    Routing,
    SchemaReference,
    Data,
    Link,
    Io,
    Quota,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Structural => "structural",
            ErrorKind::Format => "format",
            ErrorKind::Hierarchy => "hierarchy",
            ErrorKind::Routing => "routing",
            ErrorKind::SchemaReference => "schema-reference",
            ErrorKind::Data => "data",
            ErrorKind::Link => "link",
            ErrorKind::Io => "io",
            ErrorKind::Quota => "quota",
            ErrorKind::Internal => "internal",
        }
    }
}

/// A fatal install error: what went wrong, where, and the catalogue code.
#[derive(Debug, Clone, Error)]
#[error("{} error at '{path}': {detail}", .kind.as_str())]
pub struct InstallError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub path: String,
    pub detail: String,
}

pub type InstallResult<T> = std::result::Result<T, InstallError>;

impl InstallError {
    pub fn new(
        kind: ErrorKind,
        code: &'static str,
        path: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn structural(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Structural, messages::INVALID_STRUCTURE, path, detail)
    }

    pub fn format(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Format, messages::INVALID_FORMAT, path, detail)
    }

    pub fn hierarchy(code: &'static str, path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(ErrorKind::Hierarchy, code, path.clone(), path)
    }

    pub fn routing(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(ErrorKind::Routing, messages::UNROUTABLE_ENTRY, path.clone(), path)
    }

    pub fn schema_reference(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::SchemaReference,
            messages::UNDECLARED_REFERENCE,
            path,
            detail,
        )
    }

    pub fn data(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Data, messages::INVALID_DATA, path, detail)
    }

    pub fn link(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Link, messages::LINK_FAILED, path, detail)
    }

    pub fn io(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Io, messages::IO_ERROR, path, err.to_string())
    }

    pub fn quota(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Quota, messages::CHILD_QUOTA, path, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, messages::UNEXPECTED_FAILURE, "", detail)
    }

    /// Catalogue message for this error.
    pub fn message(&self) -> String {
        messages::render(self.code, &self.detail)
    }
}
