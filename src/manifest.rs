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

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestFormat {
    Json,
    Yaml,
}

impl ManifestFormat {
    pub fn file_name(self) -> &'static str {
        match self {
            ManifestFormat::Json => "layers.json",
            ManifestFormat::Yaml => "layers.yaml",
        }
    }

    fn encode(self, refs: &[String]) -> Result<Vec<u8>> {
        Ok(match self {
            ManifestFormat::Json => serde_json::to_vec_pretty(refs)?,
            ManifestFormat::Yaml => serde_yaml::to_string(refs)?.into_bytes(),
        })
    }
}

/// Writes the ordered layer references to `output_dir` once per format and
/// returns the written paths. Each file is staged beside its final name
/// and renamed into place, so a failed write never leaves a partial file.
pub fn write_manifest(
    refs: &[String],
    output_dir: &Path,
    formats: &[ManifestFormat],
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(formats.len());

    for &format in formats {
        let path = output_dir.join(format.file_name());
        let data = format
            .encode(refs)
            .with_context(|| format!("Encoding {}", format.file_name()))?;

        let mut staged = NamedTempFile::new_in(output_dir)
            .with_context(|| format!("Creating temporary file in {}", output_dir.display()))?;
        staged
            .write_all(&data)
            .with_context(|| format!("Writing {}", path.display()))?;
        staged
            .persist(&path)
            .with_context(|| format!("Renaming into {}", path.display()))?;

        info!(count = refs.len(), path = %path.display(), "Lambda layer ARNs written");
        written.push(path);
    }

    Ok(written)
}
