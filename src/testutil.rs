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

//! Fixtures shared by the unit tests.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use tar::{Builder, EntryType, Header};

use crate::source::{ImageSource, SourceLayer};

pub fn append_file(builder: &mut Builder<Vec<u8>>, path: &str, data: &[u8]) {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(1_600_000_000);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
}

pub fn append_dir(builder: &mut Builder<Vec<u8>>, path: &str) {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_size(0);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, path, io::empty()).unwrap();
}

pub fn append_link(builder: &mut Builder<Vec<u8>>, ty: EntryType, path: &str, target: &str) {
    let mut header = Header::new_gnu();
    header.set_entry_type(ty);
    header.set_size(0);
    header.set_mode(0o777);
    header.set_link_name(target).unwrap();
    header.set_cksum();
    builder.append_data(&mut header, path, io::empty()).unwrap();
}

pub fn append_raw(builder: &mut Builder<Vec<u8>>, ty: EntryType, path: &str) {
    let mut header = Header::new_gnu();
    header.set_entry_type(ty);
    header.set_size(0);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, io::empty()).unwrap();
}

pub fn tar_with(build: impl FnOnce(&mut Builder<Vec<u8>>)) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    build(&mut builder);
    builder.into_inner().unwrap()
}

pub fn tar_of(files: &[(&str, &str)]) -> Vec<u8> {
    tar_with(|b| {
        for (path, data) in files {
            append_file(b, path, data.as_bytes());
        }
    })
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Reads every entry of a zip into name -> content.
pub fn read_zip(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut out = BTreeMap::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        out.insert(file.name().to_string(), content);
    }
    out
}

/// An image held in memory, counting how often each layer is opened.
pub struct MemorySource {
    name: String,
    layers: Vec<SourceLayer>,
    blobs: Vec<Vec<u8>>,
    pub opens: Cell<usize>,
}

impl MemorySource {
    pub fn new(name: &str, blobs: Vec<Vec<u8>>) -> Self {
        let layers = blobs
            .iter()
            .enumerate()
            .map(|(i, blob)| SourceLayer {
                digest: format!("sha256:{}", i + 1),
                media_type: None,
                size: blob.len() as u64,
            })
            .collect();
        MemorySource {
            name: name.to_string(),
            layers,
            blobs,
            opens: Cell::new(0),
        }
    }
}

impl ImageSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn layers(&self) -> &[SourceLayer] {
        &self.layers
    }

    fn open_layer(&self, layer: &SourceLayer) -> io::Result<Box<dyn Read + '_>> {
        self.opens.set(self.opens.get() + 1);
        let index = self
            .layers
            .iter()
            .position(|l| l.digest == layer.digest)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, layer.digest.clone()))?;
        Ok(Box::new(&self.blobs[index][..]))
    }
}
