//! Container registry client
//!
//! Speaks the subset of the distribution API needed to pull an image:
//! the token endpoint, manifests and blobs. All requests carry the bearer
//! token obtained once per run.

use crate::error::{JailError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::fmt;
use std::io::Write;
use std::time::Duration;

/// OCI Distribution Specification media types
pub mod media_types {
    pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const MANIFEST_LIST_V2: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

    /// Accept list for a tag lookup, which may answer with an index
    pub const ACCEPT_ANY: &[&str] = &[OCI_INDEX, MANIFEST_LIST_V2, MANIFEST_V2, OCI_MANIFEST];
    /// Accept list for a platform manifest picked out of an index
    pub const ACCEPT_IMAGE: &[&str] = &[MANIFEST_V2, OCI_MANIFEST];

    /// Layer types that unpack as a plain or gzipped tar
    pub fn is_tar_layer(media_type: &str) -> bool {
        matches!(media_type, OCI_LAYER | OCI_LAYER_TAR | DOCKER_LAYER)
    }
}

/// Token lifetime assumed when the auth server omits `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 60;

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Registry base URL
    pub url: String,
    /// Token endpoint
    pub auth_url: String,
    /// Service name sent to the token endpoint
    pub service: String,
    /// Namespace prepended to bare image names
    pub namespace: String,
    /// Per-request timeout; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "https://registry.hub.docker.com".to_string(),
            auth_url: "https://auth.docker.io/token".to_string(),
            service: "registry.docker.io".to_string(),
            namespace: "library".to_string(),
            timeout: None,
        }
    }
}

impl RegistryConfig {
    /// Full repository path for an image name, e.g. `library/redis`
    pub fn repository(&self, name: &str) -> String {
        if name.contains('/') || self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.namespace, name)
        }
    }
}

/// Bearer token for one run
///
/// Never refreshed: a run that outlives the token will see the registry
/// reject later requests.
#[derive(Clone)]
pub struct AuthToken {
    token: String,
    /// Lifetime in seconds, as reported by the auth server
    pub expires_in: u64,
    /// When the auth server issued the token
    pub issued_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn new(token: impl Into<String>, expires_in: u64, issued_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_in,
            issued_at,
        }
    }

    /// Raw token value
    pub fn secret(&self) -> &str {
        &self.token
    }

    /// `Authorization` header value
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Instant the token stops being valid
    ///
    /// `None` when `expires_in` is too large to represent; such a token
    /// never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.expires_in).ok()?;
        self.issued_at.checked_add_signed(ChronoDuration::try_seconds(secs)?)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Token response from auth server
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    issued_at: Option<DateTime<Utc>>,
}

impl TokenResponse {
    fn into_token(self) -> Result<AuthToken> {
        let token = if !self.token.is_empty() {
            self.token
        } else {
            self.access_token
                .filter(|t| !t.is_empty())
                .ok_or_else(|| JailError::Auth("token response carries no token".to_string()))?
        };

        Ok(AuthToken::new(
            token,
            self.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
            self.issued_at.unwrap_or_else(Utc::now),
        ))
    }
}

/// Parse a token endpoint body
pub fn parse_token_response(body: &[u8]) -> Result<AuthToken> {
    let response: TokenResponse = serde_json::from_slice(body)
        .map_err(|e| JailError::Auth(format!("malformed token response: {}", e)))?;
    response.into_token()
}

/// A manifest body together with the content type the registry declared
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    /// `Content-Type` header without parameters, if present
    pub content_type: Option<String>,
    /// Raw JSON body
    pub body: Vec<u8>,
}

/// Read access to an image registry
///
/// Implemented over HTTP by [`Registry`]; the pull pipeline only talks to
/// this trait.
#[allow(async_fn_in_trait)]
pub trait Distribution {
    /// Obtain a pull token for `name`
    async fn authenticate(&self, name: &str) -> Result<AuthToken>;

    /// Fetch the manifest for `reference` (a tag or a digest)
    async fn fetch_manifest(
        &self,
        name: &str,
        reference: &str,
        accept: &[&str],
        token: &AuthToken,
    ) -> Result<ManifestResponse>;

    /// Stream a blob into `out` as it arrives, returning its length
    async fn fetch_blob(
        &self,
        name: &str,
        digest: &str,
        token: &AuthToken,
        out: &mut impl Write,
    ) -> Result<u64>;
}

/// HTTP registry client
pub struct Registry {
    /// Registry configuration
    config: RegistryConfig,
    /// HTTP client
    client: reqwest::Client,
}

impl Registry {
    /// Create a new registry client
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("runejail/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| JailError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Create a client for Docker Hub
    pub fn docker_hub() -> Result<Self> {
        Self::new(RegistryConfig::default())
    }

    fn manifest_url(&self, name: &str, reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.config.url,
            self.config.repository(name),
            reference
        )
    }

    fn blob_url(&self, name: &str, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.config.url,
            self.config.repository(name),
            digest
        )
    }
}

impl Distribution for Registry {
    async fn authenticate(&self, name: &str) -> Result<AuthToken> {
        let scope = format!("repository:{}:pull", self.config.repository(name));
        let params = [("service", self.config.service.as_str()), ("scope", scope.as_str())];
        tracing::debug!(url = %self.config.auth_url, %scope, "Requesting registry token");

        let response = self
            .client
            .get(&self.config.auth_url)
            .query(&params)
            .send()
            .await
            .map_err(|e| JailError::Auth(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JailError::Auth(format!(
                "token endpoint answered {}",
                response.status()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| JailError::Auth(e.to_string()))?;
        let token = parse_token_response(&body)?;

        tracing::info!(
            "Authenticated with the registry, token valid for {} seconds",
            token.expires_in
        );
        Ok(token)
    }

    async fn fetch_manifest(
        &self,
        name: &str,
        reference: &str,
        accept: &[&str],
        token: &AuthToken,
    ) -> Result<ManifestResponse> {
        let url = self.manifest_url(name, reference);
        tracing::debug!(%url, "Requesting manifest");

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, accept.join(", "))
            .header(AUTHORIZATION, token.bearer())
            .send()
            .await
            .map_err(|e| JailError::ManifestFetch(e.to_string()))?;

        if !response.status().is_success() {
            return Err(JailError::ManifestFetch(format!(
                "{} for {}: {}",
                response.status(),
                url,
                response.text().await.unwrap_or_default()
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let body = response
            .bytes()
            .await
            .map_err(|e| JailError::ManifestFetch(e.to_string()))?;

        Ok(ManifestResponse {
            content_type,
            body: body.to_vec(),
        })
    }

    async fn fetch_blob(
        &self,
        name: &str,
        digest: &str,
        token: &AuthToken,
        out: &mut impl Write,
    ) -> Result<u64> {
        let url = self.blob_url(name, digest);
        tracing::debug!(%url, "Requesting blob");

        let mut response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, token.bearer())
            .send()
            .await
            .map_err(|e| JailError::layer_fetch(digest, e))?;

        if !response.status().is_success() {
            return Err(JailError::layer_fetch(
                digest,
                format!("registry answered {}", response.status()),
            ));
        }

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| JailError::layer_fetch(digest, e))?
        {
            out.write_all(&chunk)
                .map_err(|e| JailError::layer_fetch(digest, format!("writing blob: {}", e)))?;
            written += chunk.len() as u64;
        }

        Ok(written)
    }
}
