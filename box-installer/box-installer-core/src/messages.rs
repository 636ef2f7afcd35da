//! Message catalogue for install progress and failure reporting.
//!
//! Codes in the `PL-BI-0xxx` range describe the whole run, `PL-BI-1xxx` a
//! single archive entry, and `PL-BI-2xxx` the detail of a failure.

pub const INSTALL_COMPLETED: &str = "PL-BI-0000";
pub const INSTALL_FAILED: &str = "PL-BI-0001";
pub const INSTALL_STARTED: &str = "PL-BI-1000";
pub const ENTRY_STARTED: &str = "PL-BI-1001";
pub const ENTRY_PROCESSING: &str = "PL-BI-1002";
pub const ENTRY_COMPLETED: &str = "PL-BI-1003";
pub const ENTRY_FAILED: &str = "PL-BI-1004";
pub const UNEXPECTED_FAILURE: &str = "PL-BI-1005";

pub const IO_ERROR: &str = "PL-BI-2000";
pub const INVALID_STRUCTURE: &str = "PL-BI-2001";
pub const INVALID_FORMAT: &str = "PL-BI-2002";
pub const INVALID_DATA: &str = "PL-BI-2003";
pub const FILE_STORE_FAILED: &str = "PL-BI-2004";
pub const INVALID_CONTENT_TYPE: &str = "PL-BI-2005";
pub const UNROUTABLE_ENTRY: &str = "PL-BI-2006";
pub const ACL_NAMESPACE: &str = "PL-BI-2007";
pub const HREF_COUNT: &str = "PL-BI-2008";
pub const HREF_EMPTY: &str = "PL-BI-2009";
pub const HREF_SCHEME: &str = "PL-BI-2010";
pub const DUPLICATE_PATH: &str = "PL-BI-2011";
pub const MISSING_PARENT: &str = "PL-BI-2012";
pub const STRUCTURED_DATA_CHILD: &str = "PL-BI-2013";
pub const SERVICE_CHILD: &str = "PL-BI-2014";
pub const FILE_CHILD: &str = "PL-BI-2015";
pub const MISSING_SOURCE: &str = "PL-BI-2016";
pub const INVALID_NAME: &str = "PL-BI-2017";
pub const UNKNOWN_RESOURCE_TYPE: &str = "PL-BI-2018";
pub const UNDECLARED_REFERENCE: &str = "PL-BI-2019";
pub const LINK_FAILED: &str = "PL-BI-2020";
pub const CHILD_QUOTA: &str = "PL-BI-2021";

/// Message template for a code; `{0}` is replaced by the report detail.
pub fn template(code: &str) -> &'static str {
    match code {
        INSTALL_COMPLETED => "Box installation completed.",
        INSTALL_FAILED => "Box installation failed ({0}).",
        INSTALL_STARTED => "Box installation started.",
        ENTRY_STARTED => "Installation of entry started.",
        ENTRY_PROCESSING => "Installation in progress ({0}).",
        ENTRY_COMPLETED => "Installation of entry completed.",
        ENTRY_FAILED => "Installation of entry failed ({0}).",
        UNEXPECTED_FAILURE => "Unexpected failure ({0}).",
        IO_ERROR => "Failed to read the archive ({0}).",
        INVALID_STRUCTURE => "Invalid archive structure ({0}).",
        INVALID_FORMAT => "Invalid file format ({0}).",
        INVALID_DATA => "Invalid data ({0}).",
        FILE_STORE_FAILED => "Failed to store file ({0}).",
        INVALID_CONTENT_TYPE => "Invalid content type ({0}).",
        UNROUTABLE_ENTRY => "Entry is not declared in the collection hierarchy ({0}).",
        ACL_NAMESPACE => "ACL element must be in the DAV: namespace ({0}).",
        HREF_COUNT => "Exactly one href is required per response ({0}).",
        HREF_EMPTY => "href must not be empty ({0}).",
        HREF_SCHEME => "href must start with the box scheme ({0}).",
        DUPLICATE_PATH => "Path is declared more than once ({0}).",
        MISSING_PARENT => "Parent collection is not declared ({0}).",
        STRUCTURED_DATA_CHILD => "Structured-data collection cannot have children ({0}).",
        SERVICE_CHILD => "Service collection can only contain a WebDAV __src collection ({0}).",
        FILE_CHILD => "File cannot have children ({0}).",
        MISSING_SOURCE => "Service collection has no __src collection ({0}).",
        INVALID_NAME => "Invalid resource name ({0}).",
        UNKNOWN_RESOURCE_TYPE => "Unknown resource type ({0}).",
        UNDECLARED_REFERENCE => "Reference to an undeclared type ({0}).",
        LINK_FAILED => "Failed to create link ({0}).",
        CHILD_QUOTA => "Collection child resource limit reached ({0}).",
        _ => "{0}",
    }
}

/// Render the message for `code` with `detail` substituted.
pub fn render(code: &str, detail: &str) -> String {
    template(code).replace("{0}", detail)
}
