//! Image pulling
//!
//! This module turns an image reference into a populated root directory:
//! authenticate, resolve the manifest, then unpack its layers in order.

pub mod layer;
pub mod manifest;
pub mod reference;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use layer::LayerMaterializer;
pub use manifest::{
    first_entry, Descriptor, ImageManifest, Manifest, ManifestResolver, PlatformManifest,
    SelectionPolicy,
};
pub use reference::ImageReference;
pub use registry::{AuthToken, Distribution, Registry, RegistryConfig};

use crate::error::Result;
use std::path::Path;

/// Pull `reference` from `registry` and unpack it into `root`
///
/// Each stage runs only if the previous one succeeded; nothing is fetched
/// once a stage fails. Returns the manifest whose layers were unpacked.
pub async fn pull_image<D: Distribution>(
    registry: &D,
    reference: &ImageReference,
    root: &Path,
) -> Result<ImageManifest> {
    tracing::info!("Pulling {} into {}", reference, root.display());

    let token = registry.authenticate(&reference.name).await?;
    let manifest = ManifestResolver::new(registry)
        .resolve(&reference.name, &reference.tag, &token)
        .await?;

    if token.is_expired_at(chrono::Utc::now()) {
        tracing::warn!("Registry token already expired, layer downloads may be rejected");
    }

    LayerMaterializer::new(registry)
        .materialize(&reference.name, &manifest, root, &token)
        .await?;

    Ok(manifest)
}
