use chrono::Utc;
use std::sync::Arc;

use super::{InstallStatus, ProgressCache, ProgressMessage, ProgressRecord};
use crate::error::InstallError;
use crate::events::{Event, EventBus};
use crate::messages;

/// Single sink for per-entry outcomes of one install run.
///
/// Owns the run's [`ProgressRecord`]. Error reports and terminal transitions
/// always persist it; ordinary reports persist it only when progress
/// publishing is enabled.
pub struct Reporter {
    record: ProgressRecord,
    cache: Arc<dyn ProgressCache>,
    events: Option<EventBus>,
    publish_progress: bool,
    request_key: Option<String>,
}

impl Reporter {
    pub fn new(record: ProgressRecord, cache: Arc<dyn ProgressCache>) -> Self {
        Self {
            record,
            cache,
            events: None,
            publish_progress: true,
            request_key: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_publish_progress(mut self, publish: bool) -> Self {
        self.publish_progress = publish;
        self
    }

    pub fn with_request_key(mut self, key: Option<String>) -> Self {
        self.request_key = key;
        self
    }

    pub fn record(&self) -> &ProgressRecord {
        &self.record
    }

    pub fn into_record(self) -> ProgressRecord {
        self.record
    }

    pub fn set_schema(&mut self, schema: Option<String>) {
        self.record.schema = schema;
    }

    /// Mark the run as started and persist the record.
    pub fn start(&mut self) {
        self.record.status = InstallStatus::Running;
        self.record.started_at = Some(Utc::now());
        self.emit(false, messages::INSTALL_STARTED, "", "");
        self.persist();
    }

    /// Count one more processed entry.
    pub fn entry_processed(&mut self) {
        self.record.processed += 1;
    }

    pub fn report(&mut self, is_error: bool, code: &str, path: &str, detail: &str) {
        let message = self.emit(is_error, code, path, detail);
        if is_error {
            self.record.message = Some(ProgressMessage::new(code, message));
            self.persist();
        } else if self.publish_progress {
            self.persist();
        }
    }

    pub fn complete(&mut self) {
        self.emit(false, messages::INSTALL_COMPLETED, "", "");
        self.finish(InstallStatus::Completed);
    }

    /// Record `err` as the run's failure and end the run.
    pub fn fail(&mut self, err: &InstallError) {
        self.report(true, err.code, &err.path, &err.detail);
        self.emit(true, messages::INSTALL_FAILED, &err.path, err.code);
        self.finish(InstallStatus::Failed);
    }

    fn finish(&mut self, status: InstallStatus) {
        self.record.status = status;
        self.record.ended_at = Some(Utc::now());
        self.persist();
        if let Some(events) = &self.events {
            events.publish(Event::InstallFinished {
                box_id: self.record.box_id,
                status,
            });
        }
    }

    fn emit(&self, is_error: bool, code: &str, path: &str, detail: &str) -> String {
        let message = messages::render(code, detail);
        let line = format!("\"{}\",\"{}\",\"{}\"", code, path, message);
        if is_error {
            tracing::error!(box_id = %self.record.box_id, "{}", line);
        } else {
            tracing::info!(box_id = %self.record.box_id, "{}", line);
        }
        if let Some(events) = &self.events {
            events.publish(Event::InstallProgress {
                request_key: self.request_key.clone(),
                action: code.to_string(),
                object: path.to_string(),
                result: message.clone(),
            });
        }
        message
    }

    fn persist(&self) {
        if let Err(e) = self.cache.put(&self.record.cache_key(), &self.record) {
            tracing::warn!(box_id = %self.record.box_id, "failed to store progress: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::MemoryProgressCache;
    use std::time::Duration;
    use uuid::Uuid;

    fn reporter(publish: bool) -> (Reporter, Arc<MemoryProgressCache>) {
        let cache = Arc::new(MemoryProgressCache::new(Duration::from_secs(60)));
        let record = ProgressRecord::new(Uuid::new_v4(), "cell", "box", 10);
        let reporter = Reporter::new(record, cache.clone()).with_publish_progress(publish);
        (reporter, cache)
    }

    #[test]
    fn test_progress_not_published_when_disabled() {
        let (mut reporter, cache) = reporter(false);
        let key = reporter.record().cache_key();
        reporter.start();
        reporter.entry_processed();
        reporter.report(false, messages::ENTRY_COMPLETED, "bar/00_meta/00_manifest.json", "");

        let stored = cache.get(&key).unwrap().unwrap();
        assert_eq!(stored.status, InstallStatus::Running);
        assert_eq!(stored.processed, 0);
    }

    #[test]
    fn test_error_report_always_persists() {
        let (mut reporter, cache) = reporter(false);
        let key = reporter.record().cache_key();
        reporter.start();
        reporter.entry_processed();
        reporter.report(true, messages::INVALID_FORMAT, "bar/00_meta/20_roles.json", "bad json");

        let stored = cache.get(&key).unwrap().unwrap();
        assert_eq!(stored.processed, 1);
        let message = stored.message.unwrap();
        assert_eq!(message.code, messages::INVALID_FORMAT);
        assert_eq!(message.message.lang, "en");
        assert_eq!(message.message.value, "Invalid file format (bad json).");
    }

    #[test]
    fn test_fail_sets_terminal_state() {
        let cache = Arc::new(MemoryProgressCache::new(Duration::from_secs(60)));
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let record = ProgressRecord::new(Uuid::new_v4(), "cell", "box", 10);
        let mut reporter = Reporter::new(record, cache.clone()).with_events(events);
        reporter.start();
        reporter.fail(&InstallError::routing("bar/90_contents/stray.txt"));

        let stored = cache.get(&reporter.record().cache_key()).unwrap().unwrap();
        assert_eq!(stored.status, InstallStatus::Failed);
        assert!(stored.ended_at.is_some());
        assert_eq!(stored.message.unwrap().code, messages::UNROUTABLE_ENTRY);

        let mut finished = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::InstallFinished { status, .. } = event {
                assert_eq!(status, InstallStatus::Failed);
                finished = true;
            }
        }
        assert!(finished);
    }
}
