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
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::archive::ArchiveWriter;
use crate::error::{RepackError, Result};
use crate::layer_repacker::repack_layer;
use crate::source::ImageSource;

pub const FUNCTION_FILE: &str = "function.zip";

/// A Lambda layer archive on local disk, and the image layer it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LambdaLayer {
    pub digest: String,
    pub file: PathBuf,
}

/// The function deployment package shared by every image layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionPackage {
    pub file_count: usize,
    pub file: PathBuf,
}

#[derive(Debug)]
pub struct RepackedImage {
    pub layers: Vec<LambdaLayer>,
    pub function: FunctionPackage,
}

impl RepackedImage {
    /// True when the image had nothing under either reserved prefix.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty() && self.function.file_count == 0
    }
}

/// Converts every layer of `source` into Lambda layer zips named
/// `layer-<N>.zip` (numbered over created archives only) and collects
/// function files into a single `function.zip`. The first failing layer
/// aborts the whole conversion.
pub fn repack_image(source: &dyn ImageSource, output_dir: &Path) -> Result<RepackedImage> {
    info!(image = source.name(), layers = source.layers().len(), "Repacking image");

    fs::create_dir_all(output_dir)
        .map_err(|e| RepackError::io("creating directory", output_dir, e))?;

    let mut function_writer = ArchiveWriter::new(output_dir.join(FUNCTION_FILE));
    function_writer.open()?;
    let function_file = function_writer.path().to_path_buf();

    let repacked = repack_layers(source, output_dir, &mut function_writer);
    let (layers, file_count) = function_writer.close_after(repacked)?;

    let function = FunctionPackage {
        file_count,
        file: function_file,
    };

    info!(image = source.name(), files = file_count, "Extracted Lambda function files");
    if file_count == 0 {
        fs::remove_file(&function.file)
            .map_err(|e| RepackError::io("removing empty", &function.file, e))?;
    } else {
        info!(file = %function.file.display(), "Created Lambda function deployment package");
    }
    info!(image = source.name(), layers = layers.len(), "Created Lambda layer files");

    Ok(RepackedImage { layers, function })
}

fn repack_layers(
    source: &dyn ImageSource,
    output_dir: &Path,
    function_writer: &mut ArchiveWriter,
) -> Result<(Vec<LambdaLayer>, usize)> {
    let mut layers = Vec::new();
    let mut function_files = 0;
    let mut layer_number = 1;

    for layer in source.layers() {
        let file = output_dir.join(format!("layer-{}.zip", layer_number));
        debug!(digest = %layer.digest, media_type = ?layer.media_type, size = layer.size, "Repacking image layer");

        let outcome = repack_layer(
            || {
                source.open_layer(layer).map_err(|e| RepackError::OpenLayer {
                    digest: layer.digest.clone(),
                    source: e,
                })
            },
            &file,
            function_writer,
        )
        .map_err(|e| RepackError::Layer {
            digest: layer.digest.clone(),
            source: Box::new(e),
        })?;

        function_files += outcome.function_entries;
        if outcome.function_entries == 0 {
            info!(digest = %layer.digest, "Did not extract any Lambda function files from image layer (no relevant files found)");
        }

        if outcome.layer_created {
            info!(file = %file.display(), digest = %layer.digest, "Created Lambda layer file from image layer");
            layers.push(LambdaLayer {
                digest: layer.digest.clone(),
                file,
            });
            layer_number += 1;
        } else {
            info!(digest = %layer.digest, "Did not create a Lambda layer file from image layer (no relevant files found)");
        }
    }

    Ok((layers, function_files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use tempfile::TempDir;

    fn scenario_layers() -> Vec<Vec<u8>> {
        vec![
            tar_of(&[("opt/file1", "hello world 1")]),
            gzip(&tar_of(&[("opt/hello/file2", "hello world 2")])),
            tar_of(&[("local/hello", "irrelevant")]),
            tar_of(&[("opt/file1", "hello world 4")]),
        ]
    }

    #[test]
    fn test_layers_numbered_over_created_archives() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new("test-image", scenario_layers());

        let image = repack_image(&source, dir.path()).unwrap();

        let digests: Vec<&str> = image.layers.iter().map(|l| l.digest.as_str()).collect();
        assert_eq!(digests, vec!["sha256:1", "sha256:2", "sha256:4"]);
        for (i, layer) in image.layers.iter().enumerate() {
            assert_eq!(layer.file, dir.path().join(format!("layer-{}.zip", i + 1)));
            assert!(layer.file.exists());
        }
        assert!(!dir.path().join("layer-4.zip").exists());

        assert_eq!(read_zip(&image.layers[0].file)["file1"], b"hello world 1");
        assert_eq!(read_zip(&image.layers[1].file)["hello/file2"], b"hello world 2");
        assert_eq!(read_zip(&image.layers[2].file)["file1"], b"hello world 4");
    }

    #[test]
    fn test_empty_function_package_is_removed() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new("test-image", scenario_layers());

        let image = repack_image(&source, dir.path()).unwrap();
        assert_eq!(image.function.file_count, 0);
        assert!(!image.function.file.exists());
        assert!(!image.is_empty());
    }

    #[test]
    fn test_function_package_spans_layers() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new(
            "test-image",
            vec![
                tar_of(&[("var/task/handler.php", "<?php"), ("opt/bin/php", "bin")]),
                gzip(&tar_of(&[("var/task/src/lib.php", "lib")])),
            ],
        );

        let image = repack_image(&source, dir.path()).unwrap();
        assert_eq!(image.layers.len(), 1);
        assert_eq!(image.function.file_count, 2);
        let function = read_zip(&image.function.file);
        assert_eq!(function["handler.php"], b"<?php");
        assert_eq!(function["src/lib.php"], b"lib");
    }

    #[test]
    fn test_later_layer_replaces_function_file() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new(
            "test-image",
            vec![
                tar_of(&[("var/task/handler.php", "v1"), ("var/task/lib.php", "lib")]),
                tar_of(&[("var/task/handler.php", "v2")]),
            ],
        );

        let image = repack_image(&source, dir.path()).unwrap();
        let function = read_zip(&image.function.file);
        assert_eq!(function.len(), 2);
        assert_eq!(function["handler.php"], b"v2");
        assert_eq!(function["lib.php"], b"lib");
    }

    #[test]
    fn test_nothing_extracted() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new("test-image", vec![tar_of(&[("usr/bin/env", "env")])]);

        let image = repack_image(&source, dir.path()).unwrap();
        assert!(image.is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_creates_output_directory() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("nested").join("output");
        let source = MemorySource::new("test-image", vec![tar_of(&[("opt/a", "a")])]);

        let image = repack_image(&source, &out).unwrap();
        assert_eq!(image.layers[0].file, out.join("layer-1.zip"));
    }

    #[test]
    fn test_bad_layer_aborts_conversion() {
        let dir = TempDir::new().unwrap();
        let source = MemorySource::new(
            "test-image",
            vec![
                tar_of(&[("opt/a", "a")]),
                b"hello world".to_vec(),
                tar_of(&[("opt/b", "b")]),
            ],
        );

        let err = repack_image(&source, dir.path()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("sha256:2"), "{}", msg);
        assert!(msg.contains("could not read layer with tar nor tar.gz"), "{}", msg);
        // layer 1 opened once, layer 2 opened for both formats, layer 3 never
        assert_eq!(source.opens.get(), 3);
        assert!(!dir.path().join("layer-2.zip").exists());
    }
}
