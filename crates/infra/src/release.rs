//! Remote release metadata and artifacts.
//!
//! [`CurlReleaseSource`] talks to the release API through the configured
//! download client (curl by default) via the process executor, so requests
//! share the argument-vector guarantees of every other external call.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;
use url::Url;

use mailops_core::{DomainError, ReleaseVersion, Signature};

use crate::process::{CommandOutput, CommandSpec, ProcessError, ProcessExecutor};

/// Header carrying the license/purchase identifier on artifact downloads.
pub const LICENSE_HEADER: &str = "X-LICENSEKEY";

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("{what} request failed with exit status {code:?}")]
    Status { what: &'static str, code: Option<i32> },
    #[error("{what} response unusable: {detail}")]
    Malformed { what: &'static str, detail: String },
    #[error("artifact was not written to {0}")]
    MissingArtifact(String),
    #[error("release API base `{0}` cannot carry a path")]
    BaseUrl(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Parameters of the version query.
#[derive(Debug, Clone)]
pub struct ReleaseQuery {
    pub platform: String,
    pub app_version: ReleaseVersion,
}

pub trait ReleaseSource: Send + Sync {
    /// Latest version published for the querying installation.
    fn latest_version(&self, query: &ReleaseQuery) -> Result<ReleaseVersion, ReleaseError>;

    /// Published integrity signature of `version`'s artifact.
    fn signature(&self, version: &ReleaseVersion) -> Result<Signature, ReleaseError>;

    /// Write `version`'s artifact to `dest`.
    fn download(
        &self,
        version: &ReleaseVersion,
        license_key: &str,
        dest: &Path,
    ) -> Result<(), ReleaseError>;
}

#[derive(Deserialize)]
struct VersionResponse {
    current_version: String,
}

#[derive(Deserialize)]
struct SignatureResponse {
    signature: String,
}

pub struct CurlReleaseSource {
    executor: Arc<dyn ProcessExecutor>,
    program: String,
    api_base: Url,
}

impl CurlReleaseSource {
    pub fn new(executor: Arc<dyn ProcessExecutor>, program: impl Into<String>, api_base: Url) -> Self {
        Self {
            executor,
            program: program.into(),
            api_base,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ReleaseError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|()| ReleaseError::BaseUrl(self.api_base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn version_url(&self, query: &ReleaseQuery) -> Result<Url, ReleaseError> {
        let mut url = self.endpoint(&["site", "version"])?;
        url.query_pairs_mut()
            .append_pair("platform", &query.platform)
            .append_pair("version", &query.app_version.to_string());
        Ok(url)
    }

    pub fn signature_url(&self, version: &ReleaseVersion) -> Result<Url, ReleaseError> {
        self.endpoint(&["download", "update", &version.to_string(), "signature"])
    }

    pub fn artifact_url(&self, version: &ReleaseVersion) -> Result<Url, ReleaseError> {
        self.endpoint(&["download", "update", &version.to_string()])
    }

    fn request(&self) -> CommandSpec {
        CommandSpec::new(self.program.clone()).args(["--silent", "--show-error", "--fail", "--location"])
    }

    fn fetch_json<T: for<'de> Deserialize<'de>>(
        &self,
        what: &'static str,
        url: &Url,
    ) -> Result<T, ReleaseError> {
        debug!(%url, what, "querying release API");
        let output = self.executor.run(&self.request().arg(url.as_str()))?;
        let body = success_body(what, &output)?;
        serde_json::from_str(&body).map_err(|e| ReleaseError::Malformed {
            what,
            detail: e.to_string(),
        })
    }
}

fn success_body(what: &'static str, output: &CommandOutput) -> Result<String, ReleaseError> {
    if !output.is_success() {
        return Err(ReleaseError::Status {
            what,
            code: output.code,
        });
    }
    let body = output.stdout.join("\n");
    if body.trim().is_empty() {
        return Err(ReleaseError::Malformed {
            what,
            detail: "empty body".to_string(),
        });
    }
    Ok(body)
}

fn malformed(what: &'static str) -> impl FnOnce(DomainError) -> ReleaseError {
    move |e| ReleaseError::Malformed {
        what,
        detail: e.to_string(),
    }
}

impl ReleaseSource for CurlReleaseSource {
    fn latest_version(&self, query: &ReleaseQuery) -> Result<ReleaseVersion, ReleaseError> {
        let url = self.version_url(query)?;
        let response: VersionResponse = self.fetch_json("version", &url)?;
        ReleaseVersion::parse(&response.current_version).map_err(malformed("version"))
    }

    fn signature(&self, version: &ReleaseVersion) -> Result<Signature, ReleaseError> {
        let url = self.signature_url(version)?;
        let response: SignatureResponse = self.fetch_json("signature", &url)?;
        Signature::parse(&response.signature).map_err(malformed("signature"))
    }

    fn download(
        &self,
        version: &ReleaseVersion,
        license_key: &str,
        dest: &Path,
    ) -> Result<(), ReleaseError> {
        let url = self.artifact_url(version)?;
        debug!(%url, dest = %dest.display(), "downloading release artifact");
        let spec = self
            .request()
            .arg("--header")
            .arg(format!("{LICENSE_HEADER}: {license_key}"))
            .arg("--output")
            .arg(dest)
            .arg(url.as_str());

        let output = self.executor.run(&spec)?;
        if !output.is_success() {
            return Err(ReleaseError::Status {
                what: "download",
                code: output.code,
            });
        }
        if !dest.is_file() {
            return Err(ReleaseError::MissingArtifact(dest.display().to_string()));
        }
        Ok(())
    }
}

impl core::fmt::Debug for CurlReleaseSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CurlReleaseSource")
            .field("program", &self.program)
            .field("api_base", &self.api_base.as_str())
            .finish()
    }
}
