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

use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_lambda::error::DisplayErrorContext;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::{LayerVersionContentInput, Runtime};
use aws_sdk_lambda::Client;
use tokio::runtime::Runtime as TokioRuntime;
use tracing::debug;

use crate::publish::{LayerRegistry, LayerVersion, PublishRequest, VersionContent, VersionPage};

/// The Lambda layer service, driven from synchronous code.
pub struct LambdaRegistry {
    runtime: TokioRuntime,
    client: Client,
}

impl LambdaRegistry {
    /// Builds a client from the default credential chain, optionally
    /// narrowed to a named profile.
    pub fn connect(region: &str, profile: Option<&str>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Creating async runtime for Lambda client")?;

        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        let sdk_config = runtime.block_on(loader.load());
        debug!(region, profile = ?profile, "Created Lambda client");

        Ok(LambdaRegistry {
            runtime,
            client: Client::new(&sdk_config),
        })
    }
}

impl LayerRegistry for LambdaRegistry {
    fn list_versions(&self, layer_name: &str, marker: Option<&str>) -> Result<VersionPage> {
        let output = self
            .runtime
            .block_on(
                self.client
                    .list_layer_versions()
                    .layer_name(layer_name)
                    .set_marker(marker.map(|m| m.to_string()))
                    .send(),
            )
            .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(e)))?;

        let versions = output
            .layer_versions()
            .iter()
            .map(|v| LayerVersion {
                version: v.version(),
                arn: v.layer_version_arn().unwrap_or_default().to_string(),
            })
            .collect();

        Ok(VersionPage {
            versions,
            next_marker: output.next_marker().map(|m| m.to_string()),
        })
    }

    fn version_content(&self, layer_name: &str, version: i64) -> Result<VersionContent> {
        let output = self
            .runtime
            .block_on(
                self.client
                    .get_layer_version()
                    .layer_name(layer_name)
                    .version_number(version)
                    .send(),
            )
            .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(e)))?;

        let content = output
            .content()
            .with_context(|| format!("Layer version {} has no content", version))?;

        Ok(VersionContent {
            arn: output
                .layer_version_arn()
                .context("Layer version has no ARN")?
                .to_string(),
            code_sha256: content.code_sha256().unwrap_or_default().to_string(),
            code_size: u64::try_from(content.code_size()).unwrap_or(0),
        })
    }

    fn publish_version(&self, request: &PublishRequest<'_>) -> Result<String> {
        let content = LayerVersionContentInput::builder()
            .zip_file(Blob::new(request.content.to_vec()))
            .build();
        let runtimes = request
            .compatible_runtimes
            .iter()
            .map(|r| Runtime::from(r.as_str()))
            .collect();

        let output = self
            .runtime
            .block_on(
                self.client
                    .publish_layer_version()
                    .layer_name(request.layer_name)
                    .description(request.description)
                    .set_license_info(request.license_info.map(|l| l.to_string()))
                    .set_compatible_runtimes(Some(runtimes))
                    .content(content)
                    .send(),
            )
            .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(e)))?;

        Ok(output
            .layer_version_arn()
            .context("Published layer version has no ARN")?
            .to_string())
    }
}
