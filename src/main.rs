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

mod archive;
mod classifier;
mod config;
mod error;
mod image_repacker;
mod lambda;
mod layer_repacker;
mod logging;
mod manifest;
mod publish;
mod source;
#[cfg(test)]
mod testutil;
mod util;

use std::io::Read;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::config::{Config, LogFormat};
use crate::image_repacker::repack_image;
use crate::lambda::LambdaRegistry;
use crate::publish::{publish_layers, PublishOptions};
use crate::source::{ImageSource, OciLayoutSource};

fn main() -> Result<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;

    let config = Config::from_yaml(&input)?;
    logging::init_logging(config.log_format == LogFormat::Json)?;

    let source = OciLayoutSource::open(&config.image, config.index)
        .with_context(|| format!("Opening image {}", config.image.display()))?;

    let image = repack_image(&source, &config.output_directory)?;
    if image.is_empty() {
        bail!("No compatible layers or function files found in the image (likely nothing found in /opt or /var/task)");
    }

    if config.dry_run {
        for layer in &image.layers {
            info!(file = %layer.file.display(), digest = %layer.digest, "Dry run: keeping Lambda layer file");
        }
        if image.function.file_count > 0 {
            info!(file = %image.function.file.display(), "Dry run: keeping Lambda function deployment package");
        }
        return Ok(());
    }

    let registry = LambdaRegistry::connect(&config.region, config.profile.as_deref())?;
    let opts = PublishOptions {
        layer_prefix: config.layer_namespace.clone(),
        source_image_name: source.name().to_string(),
        description: config.description.clone(),
        license_info: config.license_info.clone(),
        compatible_runtimes: config.compatible_runtimes.clone(),
    };
    let arns = publish_layers(&registry, &opts, &image.layers)?;

    for path in manifest::write_manifest(&arns, &config.output_directory, &config.manifest_formats)? {
        println!("{}", path.display());
    }
    if image.function.file_count > 0 {
        info!(file = %image.function.file.display(), "Lambda function deployment package is ready");
    }

    Ok(())
}
