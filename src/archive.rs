// Copyright (c) 2019 Codethink Ltd.
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{Datelike, Timelike};
use tempfile::TempDir;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{RepackError, Result};

const IO_BUF_SIZE: usize = 1024 * 1024;

/// Entries at least this large need zip64 extensions.
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Metadata carried over from the tar header into the zip entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryMeta {
    pub mode: u32,
    pub mtime: u64,
    pub size: u64,
}

enum Staged {
    File { meta: EntryMeta, blob: PathBuf },
    Symlink { meta: EntryMeta, target: String },
}

/// The backing file plus entry bodies waiting to be zipped. Bodies are
/// staged on disk next to the archive and keyed by name, so writing a name
/// again replaces the earlier entry.
struct Pending {
    file: File,
    staging: TempDir,
    entries: BTreeMap<String, Staged>,
    next_blob: usize,
}

/// A zip archive at a fixed path that is only created once something is
/// written to it. Entries are collected until `close`; the last write of a
/// name wins, as when a later image layer replaces a file.
pub struct ArchiveWriter {
    path: PathBuf,
    pending: Option<Pending>,
    replaced: usize,
}

impl ArchiveWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ArchiveWriter {
            path: path.into(),
            pending: None,
            replaced: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_created(&self) -> bool {
        self.pending.is_some()
    }

    /// Creates the backing file now instead of on the first write.
    pub fn open(&mut self) -> Result<()> {
        ensure_open(&self.path, &mut self.pending).map(|_| ())
    }

    pub fn write_file(&mut self, name: &str, meta: &EntryMeta, body: &mut dyn Read) -> Result<()> {
        let pending = ensure_open(&self.path, &mut self.pending)?;

        let blob = pending.staging.path().join(pending.next_blob.to_string());
        pending.next_blob += 1;
        let staged = File::create(&blob).map_err(|e| RepackError::io("staging", &blob, e))?;
        let mut staged = BufWriter::with_capacity(IO_BUF_SIZE, staged);
        io::copy(body, &mut staged)
            .and_then(|_| staged.flush())
            .map_err(|source| RepackError::Entry {
                path: name.to_string(),
                source,
            })?;

        self.stage(
            name,
            Staged::File {
                meta: *meta,
                blob,
            },
        )
    }

    pub fn write_symlink(&mut self, name: &str, target: &str, meta: &EntryMeta) -> Result<()> {
        ensure_open(&self.path, &mut self.pending)?;
        self.stage(
            name,
            Staged::Symlink {
                meta: *meta,
                target: target.to_string(),
            },
        )
    }

    fn stage(&mut self, name: &str, entry: Staged) -> Result<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        if let Some(old) = pending.entries.insert(name.to_string(), entry) {
            debug!(file = %self.path.display(), name, "Replacing earlier zip entry");
            self.replaced += 1;
            if let Staged::File { blob, .. } = old {
                fs::remove_file(&blob).map_err(|e| RepackError::io("removing staged", &blob, e))?;
            }
        }
        Ok(())
    }

    /// Writes the staged entries out as a zip, then flushes and syncs the
    /// file. Returns whether an archive was written; a writer that never
    /// opened anything closes as a no-op.
    pub fn close(mut self) -> Result<bool> {
        let Some(pending) = self.pending.take() else {
            return Ok(false);
        };

        let mut zip = ZipWriter::new(BufWriter::with_capacity(IO_BUF_SIZE, pending.file));
        for (name, entry) in &pending.entries {
            match entry {
                Staged::File { meta, blob } => {
                    zip.start_file(name.as_str(), file_options(meta))
                        .map_err(|e| RepackError::zip(&self.path, e))?;
                    let mut body =
                        File::open(blob).map_err(|e| RepackError::io("reading staged", blob, e))?;
                    io::copy(&mut body, &mut zip)
                        .map_err(|e| RepackError::io("writing", &self.path, e))?;
                }
                Staged::Symlink { meta, target } => {
                    zip.add_symlink(name.as_str(), target.as_str(), file_options(meta))
                        .map_err(|e| RepackError::zip(&self.path, e))?;
                }
            }
        }

        let buffered = zip.finish().map_err(|e| RepackError::zip(&self.path, e))?;
        let file = buffered
            .into_inner()
            .map_err(|e| RepackError::io("flushing", &self.path, e.into_error()))?;
        file.sync_all()
            .map_err(|e| RepackError::io("syncing", &self.path, e))?;

        let staging = pending.staging.path().to_path_buf();
        pending
            .staging
            .close()
            .map_err(|e| RepackError::io("removing", &staging, e))?;

        debug!(
            file = %self.path.display(),
            entries = pending.entries.len(),
            replaced = self.replaced,
            "Closed zip archive"
        );
        Ok(true)
    }

    /// Closes the writer after `outcome` is known, reporting a close
    /// failure alongside any earlier one.
    pub fn close_after<T>(self, outcome: Result<T>) -> Result<T> {
        let closed = self.close().map(|_| ());
        RepackError::merge_close(outcome, closed)
    }
}

fn ensure_open<'a>(path: &Path, slot: &'a mut Option<Pending>) -> Result<&'a mut Pending> {
    let pending = match slot.take() {
        Some(pending) => pending,
        None => {
            let file = File::create(path).map_err(|e| RepackError::io("creating", path, e))?;
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let staging = tempfile::Builder::new()
                .prefix(".zip-staging-")
                .tempdir_in(dir)
                .map_err(|e| RepackError::io("creating staging directory in", dir, e))?;
            debug!(file = %path.display(), "Created zip archive");
            Pending {
                file,
                staging,
                entries: BTreeMap::new(),
                next_blob: 0,
            }
        }
    };
    Ok(slot.insert(pending))
}

fn file_options(meta: &EntryMeta) -> SimpleFileOptions {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(meta.mode & 0o7777)
        .large_file(meta.size >= ZIP64_THRESHOLD);
    match zip_timestamp(meta.mtime) {
        Some(ts) => options.last_modified_time(ts),
        None => options,
    }
}

/// Zip timestamps only cover 1980..=2107; anything else keeps the default.
fn zip_timestamp(mtime: u64) -> Option<zip::DateTime> {
    let dt = chrono::DateTime::from_timestamp(i64::try_from(mtime).ok()?, 0)?;
    zip::DateTime::from_date_and_time(
        u16::try_from(dt.year()).ok()?,
        dt.month() as u8,
        dt.day() as u8,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second() as u8,
    )
    .ok()
}
