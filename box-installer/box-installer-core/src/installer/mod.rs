//! Sequential install of one bulk archive into a box.
//!
//! An install run reads the archive front to back exactly once:
//!
//! 1. `bar/` and `bar/00_meta/` markers, in that order.
//! 2. Descriptor entries under `bar/00_meta/` in ascending prefix order. The
//!    manifest creates the box; the rootprops descriptor creates its
//!    collection tree.
//! 3. Content under `bar/90_contents/`, routed by that tree.
//!
//! Every failure is fatal. The archive file is removed when the run ends,
//! whatever the outcome.

pub mod bulk;
pub mod contents;
pub mod cursor;
pub mod hierarchy;
pub mod job;
pub mod links;
pub mod materialize;
pub mod metadata;
pub mod rootprops;
pub mod schema;
pub mod structure;

use std::fs::File;
use std::io::BufReader;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::InstallConfig;
use crate::error::{InstallError, InstallResult};
use crate::events::EventBus;
use crate::messages;
use crate::progress::{ProgressCache, ProgressRecord, Reporter};
use crate::storage::{Backend, Scope};

use self::contents::{first_missing_schema, ContentImporter};
use self::cursor::EntryCursor;
use self::job::{DoneSet, InstallJob, CONTENTS_DIR, META_DIR, ROOT_DIR};
use self::materialize::MaterializedTree;
use self::metadata::Descriptor;

/// Mutable state of one run, passed explicitly to every stage.
pub struct RunContext<'a> {
    pub job: InstallJob,
    pub reporter: Reporter,
    pub backend: &'a dyn Backend,
    pub config: &'a InstallConfig,
    pub tree: MaterializedTree,
}

impl<'a> RunContext<'a> {
    pub fn cell_scope(&self) -> Scope {
        Scope::Cell(self.job.cell.clone())
    }

    pub fn start_entry(&mut self, name: &str) {
        self.reporter
            .report(false, messages::ENTRY_STARTED, name, "");
    }

    /// Count an entry as applied and report it.
    pub fn complete_entry(&mut self, name: &str) {
        self.job.mark_done(name);
        self.job.counter += 1;
        self.reporter.entry_processed();
        self.reporter
            .report(false, messages::ENTRY_COMPLETED, name, "");
    }
}

/// Result of a finished run.
#[derive(Debug)]
pub struct InstallOutcome {
    pub record: ProgressRecord,
    pub done: DoneSet,
    pub error: Option<InstallError>,
}

/// Removes the archive file when dropped.
struct ArchiveGuard(PathBuf);

impl Drop for ArchiveGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            tracing::warn!(path = %self.0.display(), "failed to delete archive: {}", e);
        }
    }
}

pub struct Installer {
    backend: Arc<dyn Backend>,
    cache: Arc<dyn ProgressCache>,
    events: Option<EventBus>,
    config: InstallConfig,
}

impl Installer {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<dyn ProgressCache>, config: InstallConfig) -> Self {
        Self {
            backend,
            cache,
            events: None,
            config,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &InstallConfig {
        &self.config
    }

    /// Run one install to completion on the calling thread. Always ends with
    /// a terminal progress record and the archive file deleted.
    pub fn run(&self, job: InstallJob) -> InstallOutcome {
        let guard = ArchiveGuard(job.archive.clone());

        let record = ProgressRecord::new(job.box_id, &job.cell, &job.box_name, job.total_entries);
        let mut reporter = Reporter::new(record, self.cache.clone())
            .with_publish_progress(self.config.publish_progress)
            .with_request_key(job.request_key.clone());
        if let Some(events) = &self.events {
            reporter = reporter.with_events(events.clone());
        }
        reporter.start();

        let archive = job.archive.clone();
        let mut ctx = RunContext {
            job,
            reporter,
            backend: self.backend.as_ref(),
            config: &self.config,
            tree: MaterializedTree::default(),
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| install(&archive, &mut ctx)))
            .unwrap_or_else(|payload| {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                Err(InstallError::internal(detail))
            });
        // delete before the terminal state becomes visible
        drop(guard);

        let RunContext {
            job, mut reporter, ..
        } = ctx;
        let error = match result {
            Ok(()) => {
                reporter.complete();
                None
            }
            Err(err) => {
                reporter.fail(&err);
                Some(err)
            }
        };
        InstallOutcome {
            record: reporter.into_record(),
            done: job.done,
            error,
        }
    }
}

fn install(archive: &Path, ctx: &mut RunContext) -> InstallResult<()> {
    let display = archive.display().to_string();
    let file = File::open(archive).map_err(|e| InstallError::io(display.as_str(), e))?;
    let mut cursor = EntryCursor::new(BufReader::new(file), &display)?;

    structure::expect_named(&mut cursor, ROOT_DIR)?;
    structure::expect_named(&mut cursor, META_DIR)?;

    let max_entry_bytes = ctx.config.max_entry_size_bytes();
    let mut contents: Option<ContentImporter> = None;
    while let Some(mut entry) = cursor.next_entry()? {
        let name = entry.name().to_string();
        if name.starts_with(CONTENTS_DIR) {
            if contents.is_none() {
                if let Some(missing) = ctx.job.ledger.first_missing(&ctx.job.done) {
                    return Err(InstallError::structural(
                        name.as_str(),
                        format!("{} must precede contents", missing),
                    ));
                }
            }
            if entry.size() > max_entry_bytes {
                return Err(InstallError::structural(
                    name.as_str(),
                    format!("entry size {} exceeds {} bytes", entry.size(), max_entry_bytes),
                ));
            }
            contents
                .get_or_insert_with(ContentImporter::new)
                .accept(&mut entry, ctx)?;
            continue;
        }
        if contents.is_some() {
            return Err(InstallError::structural(name.as_str(), "entry follows contents"));
        }

        structure::check_order_and_size(&name, entry.size(), &ctx.job, max_entry_bytes)?;
        ctx.start_entry(&name);
        let text = entry.read_text()?;
        Descriptor::parse(&name, &text)?.apply(&name, ctx)?;
        ctx.complete_entry(&name);
    }

    if let Some(mut contents) = contents {
        contents.flush(ctx)?;
    }
    if let Some(missing) = ctx.job.ledger.first_missing(&ctx.job.done) {
        return Err(InstallError::structural(missing, "required entry missing"));
    }
    match first_missing_schema(&ctx.tree, &ctx.job.done) {
        Some(missing) => Err(InstallError::structural(missing, "structured-data collection has no schema")),
        None => Ok(()),
    }
}
