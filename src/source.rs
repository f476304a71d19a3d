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

use std::fs;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::util::advise_sequential;

const IO_BUF_SIZE: usize = 1024 * 1024;

/// A layer as listed by the image manifest, lowest layer first.
#[derive(Debug, Clone)]
pub struct SourceLayer {
    pub digest: String,
    pub media_type: Option<String>,
    pub size: u64,
}

/// Where the image layers come from.
pub trait ImageSource {
    fn name(&self) -> &str;

    fn layers(&self) -> &[SourceLayer];

    /// Opens a fresh stream of the raw layer blob. May be called more than
    /// once per layer.
    fn open_layer(&self, layer: &SourceLayer) -> io::Result<Box<dyn Read + '_>>;
}

/// An image stored as an OCI image layout directory.
#[derive(Debug)]
pub struct OciLayoutSource {
    name: String,
    root: PathBuf,
    layers: Vec<SourceLayer>,
}

impl OciLayoutSource {
    pub fn open(root: &Path, index: usize) -> Result<Self> {
        let index_path = root.join("index.json");
        let index_data: serde_json::Value = serde_json::from_reader(
            fs::File::open(&index_path)
                .with_context(|| format!("Opening {}", index_path.display()))?,
        )
        .with_context(|| format!("Parsing {}", index_path.display()))?;

        let manifests = index_data["manifests"]
            .as_array()
            .context("Missing 'manifests' array in index.json")?;
        let image_desc = manifests.get(index).with_context(|| {
            format!(
                "Manifest index {} out of range (index.json lists {})",
                index,
                manifests.len()
            )
        })?;
        let digest_str = image_desc["digest"]
            .as_str()
            .context("Missing 'digest' in manifest descriptor")?;

        let manifest_path = blob_path(root, digest_str)?;
        let image_manifest: serde_json::Value = serde_json::from_reader(
            fs::File::open(&manifest_path)
                .with_context(|| format!("Opening manifest {}", digest_str))?,
        )
        .with_context(|| format!("Parsing manifest {}", digest_str))?;

        let layers = image_manifest["layers"]
            .as_array()
            .context("Missing 'layers' array in image manifest")?
            .iter()
            .enumerate()
            .map(|(i, layer)| {
                let digest = layer["digest"]
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("Missing 'digest' in layer {}", i))?;
                // Validates the digest shape up front.
                blob_path(root, digest)?;
                Ok(SourceLayer {
                    digest: digest.to_string(),
                    media_type: layer["mediaType"].as_str().map(|s| s.to_string()),
                    size: layer["size"].as_u64().unwrap_or(0),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(OciLayoutSource {
            name: root.to_string_lossy().to_string(),
            root: root.to_path_buf(),
            layers,
        })
    }
}

impl ImageSource for OciLayoutSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn layers(&self) -> &[SourceLayer] {
        &self.layers
    }

    fn open_layer(&self, layer: &SourceLayer) -> io::Result<Box<dyn Read + '_>> {
        let path = blob_path(&self.root, &layer.digest)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let file = fs::File::open(path)?;
        advise_sequential(&file);
        Ok(Box::new(BufReader::with_capacity(IO_BUF_SIZE, file)))
    }
}

fn blob_path(root: &Path, digest: &str) -> Result<PathBuf> {
    let (algo, hex) = digest
        .split_once(':')
        .with_context(|| format!("Invalid digest format {:?}: expected 'algorithm:hash'", digest))?;
    if algo.is_empty() || hex.is_empty() || hex.contains('/') || algo.contains('/') {
        anyhow::bail!("Invalid digest format {:?}: expected 'algorithm:hash'", digest);
    }
    Ok(root.join("blobs").join(algo).join(hex))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::tar_of;
    use tempfile::TempDir;

    fn write_blob(root: &Path, data: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        let hex = format!("{:x}", Sha256::digest(data));
        let dir = root.join("blobs").join("sha256");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(&hex), data).unwrap();
        format!("sha256:{}", hex)
    }

    fn write_layout(root: &Path, layers: &[Vec<u8>]) -> Vec<String> {
        let digests: Vec<String> = layers.iter().map(|l| write_blob(root, l)).collect();
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "layers": digests.iter().zip(layers).map(|(d, l)| serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": d,
                "size": l.len(),
            })).collect::<Vec<_>>(),
        });
        let manifest_digest = write_blob(root, &serde_json::to_vec(&manifest).unwrap());
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{ "digest": manifest_digest }],
        });
        fs::write(root.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
        digests
    }

    #[test]
    fn test_lists_layers_in_manifest_order() {
        let dir = TempDir::new().unwrap();
        let layers = vec![tar_of(&[("opt/a", "1")]), tar_of(&[("opt/b", "2")])];
        let digests = write_layout(dir.path(), &layers);

        let source = OciLayoutSource::open(dir.path(), 0).unwrap();
        let listed: Vec<&str> = source.layers().iter().map(|l| l.digest.as_str()).collect();
        assert_eq!(listed, digests.iter().map(|d| d.as_str()).collect::<Vec<_>>());
        assert_eq!(source.layers()[1].size, layers[1].len() as u64);
    }

    #[test]
    fn test_open_layer_twice_yields_same_bytes() {
        let dir = TempDir::new().unwrap();
        let layers = vec![tar_of(&[("opt/a", "1")])];
        write_layout(dir.path(), &layers);
        let source = OciLayoutSource::open(dir.path(), 0).unwrap();
        let layer = &source.layers()[0];

        for _ in 0..2 {
            let mut data = Vec::new();
            source.open_layer(layer).unwrap().read_to_end(&mut data).unwrap();
            assert_eq!(data, layers[0]);
        }
    }

    #[test]
    fn test_index_out_of_range() {
        let dir = TempDir::new().unwrap();
        write_layout(dir.path(), &[tar_of(&[])]);
        let err = OciLayoutSource::open(dir.path(), 3).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_missing_index_json() {
        let dir = TempDir::new().unwrap();
        let err = OciLayoutSource::open(dir.path(), 0).unwrap_err();
        assert!(err.to_string().contains("index.json"));
    }

    #[test]
    fn test_rejects_malformed_digest() {
        assert!(blob_path(Path::new("/img"), "sha256").is_err());
        assert!(blob_path(Path::new("/img"), "sha256:../../etc").is_err());
        assert_eq!(
            blob_path(Path::new("/img"), "sha256:abc").unwrap(),
            Path::new("/img/blobs/sha256/abc")
        );
    }
}
