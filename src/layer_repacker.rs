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

//! Converts one image layer (tar or tar.gz) into a Lambda layer zip,
//! feeding function files into the shared deployment package on the way.

use std::io::{self, BufReader, Cursor, Read};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use tar::{Archive, Entry, EntryType};
use tracing::{debug, trace};

use crate::archive::{ArchiveWriter, EntryMeta};
use crate::classifier::{classify, normalize, Target};
use crate::error::{RepackError, Result};

const BLOCK_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Tar,
    TarGzip,
}

/// What a single layer contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerOutcome {
    pub layer_created: bool,
    pub function_entries: usize,
}

enum Attempt {
    Success(LayerOutcome),
    /// Nothing could be decoded; another format may still work.
    DecodeFailure(RepackError),
    /// The archive decoded but broke later; retrying would duplicate output.
    StreamFailure(RepackError),
}

enum WalkFailure {
    Decode(RepackError),
    Stream(RepackError),
}

/// Repacks a layer into a zip at `output`, created only if at least one
/// entry falls under the layer prefix. `open` must hand out a fresh stream
/// of the layer each time it is called: a stream that does not decode as
/// tar is fetched again and read as tar.gz.
pub fn repack_layer<'s, F>(
    mut open: F,
    output: &Path,
    function: &mut ArchiveWriter,
) -> Result<LayerOutcome>
where
    F: FnMut() -> Result<Box<dyn Read + 's>>,
{
    let tar_failure = match attempt(open()?, Format::Tar, output, function) {
        Attempt::Success(outcome) => return Ok(outcome),
        Attempt::StreamFailure(e) => return Err(e),
        Attempt::DecodeFailure(e) => e,
    };

    debug!(file = %output.display(), error = %tar_failure, "Layer is not a plain tar, retrying as tar.gz");

    match attempt(open()?, Format::TarGzip, output, function) {
        Attempt::Success(outcome) => Ok(outcome),
        Attempt::StreamFailure(e) => Err(e),
        Attempt::DecodeFailure(gzip_failure) => Err(RepackError::UnreadableLayer {
            gzip: Box::new(gzip_failure),
            tar: Box::new(tar_failure),
        }),
    }
}

fn attempt<'s>(
    stream: Box<dyn Read + 's>,
    format: Format,
    output: &Path,
    function: &mut ArchiveWriter,
) -> Attempt {
    let (head, rest) = match decode_head(stream, format) {
        Ok(decoded) => decoded,
        Err(e) => return Attempt::DecodeFailure(e),
    };

    let mut layer = ArchiveWriter::new(output);
    let walked = walk(head, rest, &mut layer, function);
    let layer_created = layer.is_created();

    match walked {
        Ok(function_entries) => match layer.close() {
            Ok(_) => Attempt::Success(LayerOutcome {
                layer_created,
                function_entries,
            }),
            Err(e) => Attempt::StreamFailure(e),
        },
        Err(WalkFailure::Decode(e)) => Attempt::DecodeFailure(e),
        Err(WalkFailure::Stream(e)) => {
            let closed = layer.close().map(|_| ());
            Attempt::StreamFailure(e.and_close(closed))
        }
    }
}

/// Reads the first tar block through the decoder for `format`, so input
/// that is not an archive at all is told apart from an archive that
/// breaks part way through.
fn decode_head<'s>(stream: Box<dyn Read + 's>, format: Format) -> Result<(Vec<u8>, Box<dyn Read + 's>)> {
    match format {
        Format::Tar => {
            let mut stream = stream;
            let head = read_block(&mut stream).map_err(|e| RepackError::Decode(e.to_string()))?;
            Ok((head, stream))
        }
        Format::TarGzip => {
            let mut gz = MultiGzDecoder::new(BufReader::new(stream));
            match read_block(&mut gz) {
                Ok(head) => {
                    let rest: Box<dyn Read + 's> = Box::new(gz);
                    Ok((head, rest))
                }
                Err(e) if gz.header().is_none() => Err(RepackError::GzipReader(e.to_string())),
                Err(e) => Err(RepackError::Decode(e.to_string())),
            }
        }
    }
}

fn read_block(reader: &mut dyn Read) -> io::Result<Vec<u8>> {
    let mut block = vec![0u8; BLOCK_SIZE];
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        match reader.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    block.truncate(filled);
    Ok(block)
}

/// Returns the number of entries written to the function package.
fn walk(
    head: Vec<u8>,
    rest: Box<dyn Read + '_>,
    layer: &mut ArchiveWriter,
    function: &mut ArchiveWriter,
) -> std::result::Result<usize, WalkFailure> {
    if head.is_empty() {
        return Ok(0);
    }
    if head.len() < BLOCK_SIZE {
        return Err(WalkFailure::Decode(RepackError::Decode(
            "unexpected EOF".to_string(),
        )));
    }

    let mut archive = Archive::new(Cursor::new(head).chain(rest));
    let entries = archive
        .entries()
        .map_err(|e| WalkFailure::Decode(RepackError::Decode(e.to_string())))?;

    let mut function_entries = 0;
    let mut first = true;
    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) if first => return Err(WalkFailure::Decode(RepackError::Decode(e.to_string()))),
            Err(e) => return Err(WalkFailure::Stream(RepackError::Stream(e))),
        };
        first = false;

        if repack_entry(&mut entry, layer, function).map_err(WalkFailure::Stream)? {
            function_entries += 1;
        }
    }

    Ok(function_entries)
}

enum Body {
    Data,
    Link(String),
    Empty,
}

/// Writes one entry into every archive it belongs in. Returns whether it
/// went into the function package.
fn repack_entry<R: Read>(
    entry: &mut Entry<'_, R>,
    layer: &mut ArchiveWriter,
    function: &mut ArchiveWriter,
) -> Result<bool> {
    let path = entry
        .path()
        .map_err(RepackError::Stream)?
        .to_string_lossy()
        .into_owned();
    let entry_type = entry.header().entry_type();

    let classification = classify(&path, entry_type)?;
    if classification.is_irrelevant() {
        trace!(path = %path, "Skipping layer entry");
        return Ok(false);
    }

    let entry_err = |source: io::Error| RepackError::Entry {
        path: path.clone(),
        source,
    };

    let meta = EntryMeta {
        mode: entry.header().mode().map_err(entry_err)?,
        mtime: entry.header().mtime().unwrap_or(0),
        size: entry.size(),
    };

    let body = match entry_type {
        EntryType::Regular | EntryType::Continuous => Body::Data,
        EntryType::Symlink => Body::Link(link_target(entry, &path)?),
        // Zip has no hard links; point at the target where the runtime
        // will find it.
        EntryType::Link => Body::Link(format!("/{}", normalize(&link_target(entry, &path)?))),
        _ => Body::Empty,
    };

    // Entries bound for more than one archive are buffered so the body is
    // read once.
    let mut buffered = None;
    if matches!(body, Body::Data) && classification.placements.len() > 1 {
        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(entry_err)?;
        buffered = Some(data);
    }

    for placement in &classification.placements {
        let writer = match placement.target {
            Target::Layer => &mut *layer,
            Target::Function => &mut *function,
        };
        match (&body, &buffered) {
            (Body::Data, Some(data)) => writer.write_file(&placement.name, &meta, &mut &data[..])?,
            (Body::Data, None) => writer.write_file(&placement.name, &meta, &mut *entry)?,
            (Body::Link(target), _) => writer.write_symlink(&placement.name, target, &meta)?,
            (Body::Empty, _) => writer.write_file(&placement.name, &meta, &mut io::empty())?,
        }
        trace!(path = %path, name = %placement.name, target = ?placement.target, "Repacked layer entry");
    }

    Ok(classification.contains(Target::Function))
}

fn link_target<R: Read>(entry: &Entry<'_, R>, path: &str) -> Result<String> {
    let target = entry.link_name().map_err(|source| RepackError::Entry {
        path: path.to_string(),
        source,
    })?;
    target
        .map(|t| t.to_string_lossy().into_owned())
        .ok_or_else(|| RepackError::Entry {
            path: path.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidData, "link has no target"),
        })
}
