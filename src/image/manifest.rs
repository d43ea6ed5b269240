//! Manifest model and resolution
//!
//! A tag lookup answers either with an image manifest or with an index
//! pointing at one manifest per platform. [`ManifestResolver`] collapses
//! that one level of indirection so callers always get an
//! [`ImageManifest`] with its ordered layer list.

use super::registry::{media_types, AuthToken, Distribution};
use crate::error::{JailError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type
    #[serde(default)]
    pub media_type: String,
    /// Digest
    pub digest: String,
    /// Size in bytes
    #[serde(default)]
    pub size: u64,
}

/// Platform specification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Architecture
    #[serde(default)]
    pub architecture: String,
    /// Operating system
    #[serde(default)]
    pub os: String,
    /// Variant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Platform-specific manifest entry of an index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformManifest {
    /// Media type
    #[serde(default)]
    pub media_type: String,
    /// Digest
    pub digest: String,
    /// Size in bytes
    #[serde(default)]
    pub size: u64,
    /// Platform
    #[serde(default)]
    pub platform: Platform,
}

/// Manifest list (multi-arch)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestList {
    pub media_type: String,
    pub manifests: Vec<PlatformManifest>,
}

/// Image manifest; layers are in extraction order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageManifest {
    pub media_type: String,
    pub layers: Vec<Descriptor>,
}

/// Either shape a registry may serve
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manifest {
    List(ManifestList),
    Single(ImageManifest),
}

/// Fields shared by every manifest shape; absent ones stay empty
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Vec<PlatformManifest>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

/// Whether `media_type` denotes an index of per-platform manifests
pub fn is_index(media_type: &str) -> bool {
    media_type == media_types::OCI_INDEX || media_type == media_types::MANIFEST_LIST_V2
}

/// Whether `media_type` denotes a single-platform image manifest
pub fn is_image_manifest(media_type: &str) -> bool {
    media_type == media_types::MANIFEST_V2 || media_type == media_types::OCI_MANIFEST
}

impl Manifest {
    /// Decode a manifest body
    ///
    /// The body's `mediaType` wins; `content_type` is used when the body
    /// does not declare one.
    pub fn parse(body: &[u8], content_type: Option<&str>) -> Result<Self> {
        let raw: RawManifest = serde_json::from_slice(body)
            .map_err(|e| JailError::ManifestFetch(format!("malformed manifest: {}", e)))?;

        let media_type = raw
            .media_type
            .filter(|t| !t.is_empty())
            .or_else(|| content_type.map(str::to_string))
            .ok_or_else(|| JailError::UnsupportedManifest("<none declared>".to_string()))?;

        if is_index(&media_type) {
            Ok(Manifest::List(ManifestList {
                media_type,
                manifests: raw.manifests,
            }))
        } else if is_image_manifest(&media_type) {
            Ok(Manifest::Single(ImageManifest {
                media_type,
                layers: raw.layers,
            }))
        } else {
            Err(JailError::UnsupportedManifest(media_type))
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            Manifest::List(list) => &list.media_type,
            Manifest::Single(image) => &image.media_type,
        }
    }
}

/// Picks the index entry to resolve
pub type SelectionPolicy = fn(&[PlatformManifest]) -> Option<&PlatformManifest>;

/// Default policy: the first entry, whatever its platform
pub fn first_entry(entries: &[PlatformManifest]) -> Option<&PlatformManifest> {
    entries.first()
}

/// Resolves a tag or digest to an image manifest
pub struct ManifestResolver<'a, D> {
    registry: &'a D,
    policy: SelectionPolicy,
}

impl<'a, D: Distribution> ManifestResolver<'a, D> {
    pub fn new(registry: &'a D) -> Self {
        Self {
            registry,
            policy: first_entry,
        }
    }

    /// Use a different index entry selection policy
    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Resolve `reference` for `name` to its canonical image manifest
    pub async fn resolve(
        &self,
        name: &str,
        reference: &str,
        token: &AuthToken,
    ) -> Result<ImageManifest> {
        match self.fetch(name, reference, media_types::ACCEPT_ANY, token).await? {
            Manifest::Single(image) => Ok(image),
            Manifest::List(list) => {
                let entry = (self.policy)(&list.manifests).ok_or_else(|| {
                    JailError::ManifestFetch(format!(
                        "manifest list for {}:{} has no entries",
                        name, reference
                    ))
                })?;
                tracing::info!(
                    digest = %entry.digest,
                    platform = %entry.platform,
                    "Got manifest list, resolving selected entry"
                );

                match self
                    .fetch(name, &entry.digest, media_types::ACCEPT_IMAGE, token)
                    .await?
                {
                    Manifest::Single(image) => Ok(image),
                    Manifest::List(nested) => Err(JailError::UnsupportedManifest(format!(
                        "{} nested inside a manifest list",
                        nested.media_type
                    ))),
                }
            }
        }
    }

    async fn fetch(
        &self,
        name: &str,
        reference: &str,
        accept: &[&str],
        token: &AuthToken,
    ) -> Result<Manifest> {
        tracing::info!("Requesting manifest for {} with reference {}", name, reference);
        let response = self
            .registry
            .fetch_manifest(name, reference, accept, token)
            .await?;
        let manifest = Manifest::parse(&response.body, response.content_type.as_deref())?;
        tracing::info!("Got manifest of type {}", manifest.media_type());
        Ok(manifest)
    }
}
