//! Batched creation of user records from `90_data/<entityType>/<N>.json`.

use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

use super::RunContext;
use crate::error::{InstallError, InstallResult};
use crate::messages;
use crate::storage::{BulkItem, CollectionHandle};

/// One user record and the archive entry it was read from.
#[derive(Clone, Debug, PartialEq)]
pub struct BulkRequest {
    pub item: BulkItem,
    pub path: String,
}

impl BulkRequest {
    /// Parse a data entry. A missing `__id` is replaced by a generated one.
    pub fn parse(path: &str, entity_set: &str, text: &str) -> InstallResult<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| InstallError::format(path, e.to_string()))?;
        let Value::Object(mut fields) = value else {
            return Err(InstallError::format(path, "record must be an object"));
        };
        let id = match fields.remove("__id") {
            None | Some(Value::Null) => Uuid::new_v4().simple().to_string(),
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(_) => return Err(InstallError::format(path, "__id must be a non-empty string")),
        };
        Ok(Self {
            item: BulkItem {
                entity_set: entity_set.to_string(),
                id,
                fields,
            },
            path: path.to_string(),
        })
    }

    fn unique_key(&self) -> String {
        format!("{}:{}", self.item.entity_set, self.item.id)
    }
}

/// Pending records of one structured-data collection.
pub struct BulkLoader {
    collection: CollectionHandle,
    batch: Vec<BulkRequest>,
    keys: HashSet<String>,
    batch_size: usize,
}

impl BulkLoader {
    pub fn new(collection: CollectionHandle, batch_size: usize) -> Self {
        Self {
            collection,
            batch: Vec::new(),
            keys: HashSet::new(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn collection(&self) -> &CollectionHandle {
        &self.collection
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.batch.len() >= self.batch_size
    }

    /// Queue a record. Keys stay reserved across flushes so a duplicate
    /// anywhere in the collection is caught before its backend call.
    pub fn push(&mut self, request: BulkRequest) -> InstallResult<()> {
        if !self.keys.insert(request.unique_key()) {
            return Err(InstallError::data(
                request.path.as_str(),
                format!("duplicate record {}", request.unique_key()),
            ));
        }
        self.batch.push(request);
        Ok(())
    }

    /// Send the batch in one backend call and report every outcome. The
    /// first failed record aborts the run after all outcomes are reported.
    pub fn flush(&mut self, ctx: &mut RunContext) -> InstallResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        let items: Vec<BulkItem> = batch.iter().map(|r| r.item.clone()).collect();
        tracing::debug!(
            collection = %self.collection.path,
            records = items.len(),
            "flushing bulk batch"
        );
        let outcomes = ctx
            .backend
            .bulk_create(&self.collection, &items)
            .map_err(|e| InstallError::data(batch[0].path.as_str(), e.to_string()))?;
        if outcomes.len() != batch.len() {
            return Err(InstallError::internal(format!(
                "bulk create returned {} outcomes for {} records",
                outcomes.len(),
                batch.len()
            )));
        }

        let mut first_error = None;
        for (request, outcome) in batch.iter().zip(outcomes) {
            match outcome {
                Ok(()) => ctx.complete_entry(&request.path),
                Err(e) => {
                    let detail = e.to_string();
                    ctx.reporter
                        .report(true, messages::ENTRY_FAILED, &request.path, &detail);
                    if first_error.is_none() {
                        first_error = Some(InstallError::data(request.path.as_str(), detail));
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
