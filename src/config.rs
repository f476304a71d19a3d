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

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::manifest::ManifestFormat;

/// Runtimes Lambda accepts as a layer's compatible runtime.
pub const SUPPORTED_RUNTIMES: &[&str] = &[
    "nodejs",
    "nodejs4.3",
    "nodejs4.3-edge",
    "nodejs6.10",
    "nodejs8.10",
    "nodejs10.x",
    "nodejs12.x",
    "java8",
    "java11",
    "python2.7",
    "python3.6",
    "python3.7",
    "python3.8",
    "dotnetcore1.0",
    "dotnetcore2.0",
    "dotnetcore2.1",
    "dotnetcore3.1",
    "go1.x",
    "ruby2.5",
    "ruby2.7",
    "provided",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// The job description read from stdin.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Path to an OCI image layout directory.
    pub image: PathBuf,
    #[serde(default)]
    pub index: usize,
    #[serde(default = "default_region")]
    pub region: String,
    pub profile: Option<String>,
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,
    #[serde(default = "default_layer_namespace")]
    pub layer_namespace: String,
    #[serde(default)]
    pub dry_run: bool,
    pub description: Option<String>,
    pub license_info: Option<String>,
    #[serde(default = "default_compatible_runtimes")]
    pub compatible_runtimes: Vec<String>,
    #[serde(default = "default_manifest_formats")]
    pub manifest_formats: Vec<ManifestFormat>,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("./output")
}

fn default_layer_namespace() -> String {
    "img2lambda".to_string()
}

fn default_compatible_runtimes() -> Vec<String> {
    vec!["provided".to_string()]
}

fn default_manifest_formats() -> Vec<ManifestFormat> {
    vec![ManifestFormat::Json]
}

impl Config {
    pub fn from_yaml(input: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(input).context("Parsing configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.as_os_str().is_empty() {
            bail!("image must not be empty");
        }

        if self.layer_namespace.is_empty() {
            bail!("layer-namespace must not be empty");
        }
        if let Some(c) = self
            .layer_namespace
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            bail!(
                "layer-namespace may only contain letters, digits, '-' and '_', got {:?} in {:?}",
                c,
                self.layer_namespace
            );
        }

        for runtime in &self.compatible_runtimes {
            if !SUPPORTED_RUNTIMES.contains(&runtime.as_str()) {
                bail!(
                    "compatible-runtimes: {:?} is not one of the supported runtimes: {}",
                    runtime,
                    SUPPORTED_RUNTIMES.join(", ")
                );
            }
        }

        if self.manifest_formats.is_empty() {
            bail!("manifest-formats must list at least one format");
        }

        Ok(())
    }
}
