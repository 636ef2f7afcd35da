//! Fixed layout and ordering rules for top-level entries.

use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{Read, Seek};

use super::cursor::EntryCursor;
use super::job::InstallJob;
use crate::error::{InstallError, InstallResult};

static ORDER_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r".*/+([0-9][0-9])_.*").expect("valid regex"));

/// Two-digit ordering prefix of an entry's basename.
pub fn order_prefix(name: &str) -> Option<&str> {
    ORDER_PREFIX
        .captures(name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Consume one entry and fail unless it is named `name`.
pub fn expect_named<R: Read + Seek>(cursor: &mut EntryCursor<R>, name: &str) -> InstallResult<()> {
    match cursor.next_entry()? {
        Some(entry) if entry.name() == name => Ok(()),
        Some(entry) => Err(InstallError::structural(
            entry.name(),
            format!("expected {}", name),
        )),
        None => Err(InstallError::structural(name, "archive ended early")),
    }
}

/// Validate a top-level descriptor entry against the ledger, the ordering
/// of previously accepted entries and the size limit.
pub fn check_order_and_size(
    name: &str,
    size: u64,
    job: &InstallJob,
    max_entry_bytes: u64,
) -> InstallResult<()> {
    if !job.ledger.contains(name) {
        return Err(InstallError::structural(name, "unknown entry"));
    }
    if job.done.contains(name) {
        return Err(InstallError::structural(name, "entry appears twice"));
    }
    let prefix = order_prefix(name)
        .ok_or_else(|| InstallError::structural(name, "missing order prefix"))?;
    match job.done.last().and_then(order_prefix) {
        None if prefix != "00" => {
            return Err(InstallError::structural(name, "first entry must have prefix 00"));
        }
        Some(last) if prefix < last => {
            return Err(InstallError::structural(
                name,
                format!("entry out of order after prefix {}", last),
            ));
        }
        _ => {}
    }
    if size > max_entry_bytes {
        return Err(InstallError::structural(
            name,
            format!("entry size {} exceeds {} bytes", size, max_entry_bytes),
        ));
    }
    Ok(())
}
