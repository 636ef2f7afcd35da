//! Forward-only access to archive entries.
//!
//! Entries are read in central-directory order, so sizes always come from
//! the directory record. Local headers written by streaming encoders
//! (general-purpose bit 3, sizes in a trailing data descriptor) are read the
//! same way as any other entry.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use super::job::{MANIFEST, ROOTPROPS};
use super::metadata::Manifest;
use crate::error::{InstallError, InstallResult};

/// Entries the acceptance check requires before a run is started.
const REQUIRED_ENTRIES: [&str; 2] = [MANIFEST, ROOTPROPS];

/// One archive entry. Its content can be read once, and only until the
/// cursor is advanced.
pub struct ArchiveEntry<'a> {
    name: String,
    size: u64,
    is_dir: bool,
    content: Box<dyn Read + 'a>,
}

impl<'a> ArchiveEntry<'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Read the whole content as UTF-8 text.
    pub fn read_text(&mut self) -> InstallResult<String> {
        let mut text = String::new();
        self.content
            .read_to_string(&mut text)
            .map_err(|e| InstallError::io(&self.name, e))?;
        Ok(text)
    }

    pub fn content(&mut self) -> &mut dyn Read {
        &mut self.content
    }

    #[cfg(test)]
    pub(crate) fn in_memory(name: &str, content: &'a [u8]) -> Self {
        Self {
            name: name.to_string(),
            size: content.len() as u64,
            is_dir: name.ends_with('/'),
            content: Box::new(content),
        }
    }
}

/// Sequential reader over a zip archive. Each entry is visited once, in
/// index order; there is no way back.
pub struct EntryCursor<R: Read + Seek> {
    archive: zip::ZipArchive<R>,
    next: usize,
    last: Option<String>,
}

impl<R: Read + Seek> EntryCursor<R> {
    /// Open the archive's central directory. `origin` names the archive in
    /// errors.
    pub fn new(reader: R, origin: &str) -> InstallResult<Self> {
        let archive = zip::ZipArchive::new(reader).map_err(|e| InstallError::io(origin, e))?;
        Ok(Self {
            archive,
            next: 0,
            last: None,
        })
    }

    /// Next entry, or `None` after the last one. Any read failure is fatal:
    /// a partially consumed archive cannot be resumed.
    pub fn next_entry(&mut self) -> InstallResult<Option<ArchiveEntry<'_>>> {
        if self.next >= self.archive.len() {
            return Ok(None);
        }
        let index = self.next;
        self.next += 1;
        let position = self.last.clone().unwrap_or_default();
        let file = self
            .archive
            .by_index(index)
            .map_err(|e| InstallError::io(position, e))?;
        let name = file.name().to_string();
        self.last = Some(name.clone());
        Ok(Some(ArchiveEntry {
            name,
            size: file.size(),
            is_dir: file.is_dir(),
            content: Box::new(file),
        }))
    }
}

/// Summary of an archive gathered before the install run is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub file_entries: u64,
    pub total_bytes: u64,
    pub manifest: Manifest,
}

/// Acceptance check run before an install is queued: entry sizes against
/// the limit, presence of the required descriptors, and a valid manifest.
pub fn prescan(path: &Path, max_entry_bytes: u64) -> InstallResult<ArchiveSummary> {
    let display = path.display().to_string();
    let file = File::open(path).map_err(|e| InstallError::io(&display, e))?;
    let mut archive =
        zip::ZipArchive::new(BufReader::new(file)).map_err(|e| InstallError::io(&display, e))?;

    let mut file_entries = 0;
    let mut total_bytes = 0;
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|e| InstallError::io(&display, e))?;
        if entry.is_dir() {
            continue;
        }
        if entry.size() > max_entry_bytes {
            return Err(InstallError::structural(
                entry.name(),
                format!("entry size {} exceeds {} bytes", entry.size(), max_entry_bytes),
            ));
        }
        file_entries += 1;
        total_bytes += entry.size();
    }

    let names: HashSet<&str> = archive.file_names().collect();
    if let Some(missing) = REQUIRED_ENTRIES.iter().find(|name| !names.contains(*name)) {
        return Err(InstallError::structural(*missing, "required entry missing"));
    }

    let mut text = String::new();
    archive
        .by_name(MANIFEST)
        .map_err(|e| InstallError::io(MANIFEST, e))?
        .read_to_string(&mut text)
        .map_err(|e| InstallError::io(MANIFEST, e))?;
    let manifest = Manifest::parse(MANIFEST, &text)?;

    Ok(ArchiveSummary {
        file_entries,
        total_bytes,
        manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::{Cursor, Write};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::CompressionMethod;

    const MANIFEST_JSON: &str = r#"{"BarVersion":"2","BoxVersion":"1","DefaultPath":"box1","Schema":"https://app.example/"}"#;

    fn archive() -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        zip.add_directory("bar/", options).unwrap();
        zip.start_file("bar/a.txt", options).unwrap();
        zip.write_all(b"first").unwrap();
        zip.start_file("bar/b.txt", options).unwrap();
        zip.write_all(b"second entry").unwrap();
        zip.finish().unwrap().into_inner()
    }

    fn bar_archive(manifest: &str, with_rootprops: bool) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        zip.add_directory("bar/", options).unwrap();
        zip.add_directory("bar/00_meta/", options).unwrap();
        zip.start_file(MANIFEST, options).unwrap();
        zip.write_all(manifest.as_bytes()).unwrap();
        if with_rootprops {
            zip.start_file(ROOTPROPS, options).unwrap();
            zip.write_all(b"<multistatus xmlns=\"DAV:\"/>").unwrap();
        }
        zip.start_file("bar/90_contents/b.txt", options).unwrap();
        zip.write_all(b"second entry").unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_entries_in_archive_order() {
        let bytes = archive();
        let mut cursor = EntryCursor::new(Cursor::new(bytes), "box.bar").unwrap();

        let entry = cursor.next_entry().unwrap().unwrap();
        assert_eq!(entry.name(), "bar/");
        assert!(entry.is_dir());
        drop(entry);

        // unread content is skipped when the cursor advances
        let entry = cursor.next_entry().unwrap().unwrap();
        assert_eq!(entry.name(), "bar/a.txt");
        drop(entry);

        let mut entry = cursor.next_entry().unwrap().unwrap();
        assert_eq!(entry.name(), "bar/b.txt");
        assert_eq!(entry.size(), 12);
        assert_eq!(entry.read_text().unwrap(), "second entry");
        drop(entry);

        assert!(cursor.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_data_descriptor_entries_are_read() {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file("bar/a.txt", options).unwrap();
        zip.write_all(b"streamed content").unwrap();
        let mut bytes = zip.finish().unwrap().into_inner();
        // sizes deferred to a data descriptor, as streaming encoders write them
        bytes[6] |= 0x08;

        let mut cursor = EntryCursor::new(Cursor::new(bytes), "box.bar").unwrap();
        let mut entry = cursor.next_entry().unwrap().unwrap();
        assert_eq!(entry.name(), "bar/a.txt");
        assert_eq!(entry.size(), 16);
        assert_eq!(entry.read_text().unwrap(), "streamed content");
    }

    #[test]
    fn test_truncated_archive_is_io_error() {
        let mut bytes = archive();
        bytes.truncate(60);
        let err = EntryCursor::new(Cursor::new(bytes), "box.bar").err().unwrap();
        assert_eq!(err.kind, ErrorKind::Io);
        assert_eq!(err.path, "box.bar");
    }

    #[test]
    fn test_prescan_counts_files_and_enforces_size() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("box.bar");
        std::fs::write(&path, bar_archive(MANIFEST_JSON, true)).unwrap();

        let summary = prescan(&path, 1024).unwrap();
        assert_eq!(summary.file_entries, 3);
        assert_eq!(summary.manifest.schema.as_deref(), Some("https://app.example/"));

        let err = prescan(&path, 8).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Structural);
    }

    #[test]
    fn test_prescan_requires_descriptors_and_valid_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("box.bar");

        std::fs::write(&path, bar_archive(MANIFEST_JSON, false)).unwrap();
        let err = prescan(&path, 1024).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Structural);
        assert_eq!(err.path, ROOTPROPS);

        std::fs::write(&path, archive()).unwrap();
        assert_eq!(prescan(&path, 1024).unwrap_err().path, MANIFEST);

        std::fs::write(&path, bar_archive(r#"{"BarVersion":"2"}"#, true)).unwrap();
        let err = prescan(&path, 1024).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Format);
        assert_eq!(err.path, MANIFEST);
    }
}
