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

//! Publishes Lambda layer archives, reusing an existing layer version
//! whenever one with identical content is already registered.
//!
//! The existence check and the publish are not atomic. Two converters
//! racing on the same content can both publish, which leaves a duplicate
//! version behind and nothing worse.

use std::fs;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::image_repacker::LambdaLayer;
use crate::util::{content_sha256, layer_name};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerVersion {
    pub version: i64,
    pub arn: String,
}

/// One page of a version listing. `next_marker` is set while more pages
/// remain.
#[derive(Debug, Clone, Default)]
pub struct VersionPage {
    pub versions: Vec<LayerVersion>,
    pub next_marker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionContent {
    pub arn: String,
    pub code_sha256: String,
    pub code_size: u64,
}

#[derive(Debug)]
pub struct PublishRequest<'a> {
    pub layer_name: &'a str,
    pub content: &'a [u8],
    pub description: &'a str,
    pub license_info: Option<&'a str>,
    pub compatible_runtimes: &'a [String],
}

/// The remote side of publishing: a store of named, versioned layers.
pub trait LayerRegistry {
    fn list_versions(&self, layer_name: &str, marker: Option<&str>) -> Result<VersionPage>;

    fn version_content(&self, layer_name: &str, version: i64) -> Result<VersionContent>;

    /// Returns the reference (ARN) of the new version.
    fn publish_version(&self, request: &PublishRequest<'_>) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub layer_prefix: String,
    pub source_image_name: String,
    pub description: Option<String>,
    pub license_info: Option<String>,
    pub compatible_runtimes: Vec<String>,
}

impl PublishOptions {
    fn description(&self) -> String {
        match self.description.as_deref() {
            Some(d) if !d.is_empty() => d.to_string(),
            _ => format!(
                "created by {} from image {}",
                env!("CARGO_PKG_NAME"),
                self.source_image_name
            ),
        }
    }

    fn license_info(&self) -> Option<&str> {
        self.license_info.as_deref().filter(|l| !l.is_empty())
    }
}

/// Publishes (or matches) each layer in order and returns their
/// references in the same order. Each local archive is deleted as soon as
/// its reference is known. The first failure stops the pass; layers
/// already published stay published.
pub fn publish_layers(
    registry: &dyn LayerRegistry,
    opts: &PublishOptions,
    layers: &[LambdaLayer],
) -> Result<Vec<String>> {
    let description = opts.description();
    let mut arns = Vec::with_capacity(layers.len());

    for layer in layers {
        let name = layer_name(&opts.layer_prefix, &layer.digest);

        let content = fs::read(&layer.file)
            .with_context(|| format!("Reading Lambda layer file {}", layer.file.display()))?;

        let arn = match find_existing_version(registry, &name, &content)? {
            Some(existing) => {
                info!(file = %layer.file.display(), digest = %layer.digest, arn = %existing, "Matched Lambda layer file to existing Lambda layer");
                existing
            }
            None => {
                let arn = registry
                    .publish_version(&PublishRequest {
                        layer_name: &name,
                        content: &content,
                        description: &description,
                        license_info: opts.license_info(),
                        compatible_runtimes: &opts.compatible_runtimes,
                    })
                    .with_context(|| format!("Publishing Lambda layer {}", name))?;
                info!(file = %layer.file.display(), digest = %layer.digest, arn = %arn, "Published Lambda layer file to Lambda");
                arn
            }
        };
        arns.push(arn);

        fs::remove_file(&layer.file)
            .with_context(|| format!("Removing Lambda layer file {}", layer.file.display()))?;
    }

    Ok(arns)
}

/// Walks every page of versions under `name` looking for one whose stored
/// content has the same size and hash as `content`.
fn find_existing_version(
    registry: &dyn LayerRegistry,
    name: &str,
    content: &[u8],
) -> Result<Option<String>> {
    let hash = content_sha256(content);
    let size = content.len() as u64;
    let mut marker: Option<String> = None;

    loop {
        let page = registry
            .list_versions(name, marker.as_deref())
            .with_context(|| format!("Listing versions of Lambda layer {}", name))?;

        for version in &page.versions {
            let stored = registry
                .version_content(name, version.version)
                .with_context(|| {
                    format!("Getting version {} of Lambda layer {}", version.version, name)
                })?;

            if stored.code_size == size && stored.code_sha256 == hash {
                return Ok(Some(stored.arn));
            }
            debug!(layer = name, version = version.version, arn = %version.arn, "Existing layer version differs");
        }

        match page.next_marker {
            Some(next) => marker = Some(next),
            None => return Ok(None),
        }
    }
}
