//! Layer download and extraction
//!
//! Layers are pulled one at a time and unpacked straight into the jail
//! root in manifest order, so a later layer overwrites whatever an earlier
//! one put at the same path.

use super::manifest::{Descriptor, ImageManifest};
use super::registry::{media_types, AuthToken, Distribution};
use crate::error::{JailError, Result};
use crate::runtime::syscall;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Entry};
use tempfile::NamedTempFile;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Symlinks followed while resolving a single entry path
const MAX_SYMLINK_HOPS: u32 = 40;

/// Pulls and unpacks the layers of an image manifest
pub struct LayerMaterializer<'a, D> {
    registry: &'a D,
}

impl<'a, D: Distribution> LayerMaterializer<'a, D> {
    pub fn new(registry: &'a D) -> Self {
        Self { registry }
    }

    /// Unpack every layer of `manifest` into `root`
    ///
    /// Stops at the first layer that fails; layers already unpacked stay
    /// on disk.
    pub async fn materialize(
        &self,
        name: &str,
        manifest: &ImageManifest,
        root: &Path,
        token: &AuthToken,
    ) -> Result<()> {
        let total = manifest.layers.len();
        for (index, layer) in manifest.layers.iter().enumerate() {
            tracing::info!(digest = %layer.digest, "Pulling layer {}/{}", index + 1, total);
            self.materialize_layer(name, layer, root, token).await?;
        }
        tracing::info!("Unpacked {} layers into {}", total, root.display());
        Ok(())
    }

    async fn materialize_layer(
        &self,
        name: &str,
        layer: &Descriptor,
        root: &Path,
        token: &AuthToken,
    ) -> Result<()> {
        if !layer.media_type.is_empty() && !media_types::is_tar_layer(&layer.media_type) {
            tracing::warn!(
                digest = %layer.digest,
                media_type = %layer.media_type,
                "Unrecognized layer type, unpacking it as tar"
            );
        }

        let mut scratch = tempfile::Builder::new()
            .prefix("runejail-layer-")
            .tempfile()
            .map_err(|e| JailError::extraction(&layer.digest, e))?;

        let mut writer = DigestWriter::new(scratch.as_file_mut());
        let bytes = self
            .registry
            .fetch_blob(name, &layer.digest, token, &mut writer)
            .await?;
        writer
            .flush()
            .map_err(|e| JailError::extraction(&layer.digest, e))?;
        verify_digest(&layer.digest, &writer.finish())?;
        tracing::debug!(digest = %layer.digest, bytes, "Downloaded layer");

        let digest = layer.digest.clone();
        let root: PathBuf = root.to_path_buf();
        tokio::task::spawn_blocking(move || extract_layer(scratch, &root, &digest))
            .await
            .map_err(|e| JailError::extraction(&layer.digest, format!("extraction task: {}", e)))?
    }
}

/// Writer that hashes everything passed through to `inner`
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Lowercase hex sha256 of everything written so far
    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Check a blob's sha256 (lowercase hex) against its `sha256:` digest
///
/// Digests using any other algorithm are accepted unchecked.
pub fn verify_digest(digest: &str, sha256_hex: &str) -> Result<()> {
    match digest.split_once(':') {
        Some(("sha256", expected)) => {
            if sha256_hex.eq_ignore_ascii_case(expected) {
                Ok(())
            } else {
                Err(JailError::layer_fetch(
                    digest,
                    format!("content digest mismatch, got sha256:{}", sha256_hex),
                ))
            }
        }
        _ => {
            tracing::warn!(digest, "Cannot verify digest, accepting layer as is");
            Ok(())
        }
    }
}

/// Unpack a gzipped or plain tar layer held in `scratch`
///
/// `scratch` is consumed so the file goes away on every path out of here.
fn extract_layer(scratch: NamedTempFile, root: &Path, digest: &str) -> Result<()> {
    let file = scratch
        .reopen()
        .map_err(|e| JailError::extraction(digest, e))?;
    let mut reader = BufReader::new(file);
    let compressed = reader
        .fill_buf()
        .map_err(|e| JailError::extraction(digest, e))?
        .starts_with(&GZIP_MAGIC);

    let result = if compressed {
        unpack_archive(&mut Archive::new(GzDecoder::new(reader)), root)
    } else {
        unpack_archive(&mut Archive::new(reader), root)
    };
    result.map_err(|e| JailError::extraction(digest, e))
}

/// Unpack every entry of `archive` under `root`
///
/// Symlinks left by earlier layers are followed as if `root` were `/`,
/// so nothing is ever written outside it.
fn unpack_archive<R: Read>(archive: &mut Archive<R>, root: &Path) -> io::Result<()> {
    archive.set_overwrite(true);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_preserve_ownerships(syscall::geteuid() == 0);
    archive.set_unpack_xattrs(false);

    // Directory modes go on last so a read-only directory cannot block
    // its own children.
    let mut directories = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        if kind.is_pax_global_extensions()
            || kind.is_pax_local_extensions()
            || kind.is_gnu_longname()
            || kind.is_gnu_longlink()
        {
            continue;
        }

        let path = entry.path()?.into_owned();
        let Some(target) = resolve_in_root(root, &path)? else {
            tracing::debug!(path = %path.display(), "Skipping layer entry");
            continue;
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        if kind.is_dir() {
            if let Ok(meta) = fs::symlink_metadata(&target) {
                if !meta.is_dir() {
                    fs::remove_file(&target)?;
                }
            }
            fs::create_dir_all(&target)?;
            directories.push((target, entry));
        } else if kind.is_hard_link() {
            hard_link_in_root(&entry, root, &target)?;
        } else {
            entry.unpack(&target)?;
        }
    }

    directories.sort_by(|a, b| b.0.cmp(&a.0));
    for (target, mut entry) in directories {
        entry.unpack(&target)?;
    }
    Ok(())
}

fn hard_link_in_root<R: Read>(entry: &Entry<'_, R>, root: &Path, target: &Path) -> io::Result<()> {
    let link_name = entry.link_name()?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("hard link {} has no target", target.display()),
        )
    })?;
    let source = resolve_in_root(root, &link_name)?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("hard link {} points at {}", target.display(), link_name.display()),
        )
    })?;

    if let Ok(meta) = fs::symlink_metadata(target) {
        if !meta.is_dir() {
            fs::remove_file(target)?;
        }
    }
    fs::hard_link(&source, target)
}

/// One step of a path walk inside the root
enum Step {
    Up,
    Into(OsString),
}

/// Map an archive path to its location under `root`
///
/// Every component but the last is resolved inside `root`: symlinks are
/// followed with absolute targets taken relative to `root`, and `..`
/// stops at `root`. The last component is left alone so the entry
/// replaces whatever is there. `None` for the root itself and for paths
/// containing `..`.
fn resolve_in_root(root: &Path, path: &Path) -> io::Result<Option<PathBuf>> {
    let mut names = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => names.push(name.to_os_string()),
            Component::ParentDir => return Ok(None),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    let Some(name) = names.pop() else {
        return Ok(None);
    };

    let mut pending: VecDeque<Step> = names.into_iter().map(Step::Into).collect();
    let mut resolved: Vec<OsString> = Vec::new();
    let mut hops = 0;

    while let Some(step) = pending.pop_front() {
        let name = match step {
            Step::Up => {
                resolved.pop();
                continue;
            }
            Step::Into(name) => name,
        };

        let mut candidate = root.to_path_buf();
        candidate.extend(&resolved);
        candidate.push(&name);

        match fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                hops += 1;
                if hops > MAX_SYMLINK_HOPS {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("too many symlinks resolving {}", path.display()),
                    ));
                }
                let link = fs::read_link(&candidate)?;
                if link.is_absolute() {
                    resolved.clear();
                }
                for component in link.components().rev() {
                    match component {
                        Component::Normal(part) => {
                            pending.push_front(Step::Into(part.to_os_string()))
                        }
                        Component::ParentDir => pending.push_front(Step::Up),
                        Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                    }
                }
            }
            _ => resolved.push(name),
        }
    }

    let mut target = root.to_path_buf();
    target.extend(&resolved);
    target.push(name);
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::testing::{
        gzip, hard_link_layer, image_manifest, sha256_digest, symlink_layer, tar_layer,
        test_token, FakeRegistry,
    };
    use crate::image::Manifest;
    use tempfile::tempdir;

    fn manifest_for(digests: &[&str]) -> ImageManifest {
        let body = serde_json::to_vec(&image_manifest(media_types::OCI_MANIFEST, digests)).unwrap();
        match Manifest::parse(&body, None).unwrap() {
            Manifest::Single(image) => image,
            Manifest::List(_) => unreachable!(),
        }
    }

    fn sha256_hex(data: &[u8]) -> String {
        let mut writer = DigestWriter::new(Vec::new());
        writer.write_all(data).unwrap();
        writer.finish()
    }

    async fn materialize_all(layers: Vec<Vec<u8>>, root: &Path) -> Result<()> {
        let digests: Vec<String> = layers.iter().map(|l| sha256_digest(l)).collect();
        let refs: Vec<&str> = digests.iter().map(String::as_str).collect();
        let manifest = manifest_for(&refs);
        let registry = layers
            .into_iter()
            .fold(FakeRegistry::new(), |registry, layer| registry.with_blob(layer));
        LayerMaterializer::new(&registry)
            .materialize("debian", &manifest, root, &test_token())
            .await
    }

    #[test]
    fn test_digest_writer_passes_bytes_through() {
        let mut writer = DigestWriter::new(Vec::new());
        writer.write_all(b"layer ").unwrap();
        writer.write_all(b"bytes").unwrap();
        let hex = writer.finish();

        assert_eq!(format!("sha256:{}", hex), sha256_digest(b"layer bytes"));
    }

    #[test]
    fn test_verify_digest() {
        let actual = sha256_hex(b"layer bytes");
        assert!(verify_digest(&sha256_digest(b"layer bytes"), &actual).is_ok());
        assert!(matches!(
            verify_digest(&sha256_digest(b"other"), &actual),
            Err(JailError::LayerFetch { .. })
        ));
        assert!(verify_digest("sha512:whatever", &actual).is_ok());
    }

    #[test]
    fn test_resolve_in_root() {
        let root = tempdir().unwrap();
        let r = root.path();
        std::os::unix::fs::symlink("/usr/lib", r.join("lib")).unwrap();
        std::os::unix::fs::symlink("../../../..", r.join("up")).unwrap();

        assert_eq!(
            resolve_in_root(r, Path::new("./etc/passwd")).unwrap(),
            Some(r.join("etc/passwd"))
        );
        assert_eq!(
            resolve_in_root(r, Path::new("/lib/libc.so")).unwrap(),
            Some(r.join("usr/lib/libc.so"))
        );
        assert_eq!(
            resolve_in_root(r, Path::new("up/etc/shadow")).unwrap(),
            Some(r.join("etc/shadow"))
        );
        // The last component is never followed.
        assert_eq!(resolve_in_root(r, Path::new("lib")).unwrap(), Some(r.join("lib")));
        assert_eq!(resolve_in_root(r, Path::new("../etc/x")).unwrap(), None);
        assert_eq!(resolve_in_root(r, Path::new("./")).unwrap(), None);
    }

    #[tokio::test]
    async fn test_absolute_symlink_from_earlier_layer() {
        let root = tempdir().unwrap();
        let layers = vec![
            symlink_layer(&[("var/run", "/run")]),
            tar_layer(&[("var/run/app.pid", "42")]),
        ];

        materialize_all(layers, root.path()).await.unwrap();

        let pid = std::fs::read_to_string(root.path().join("run/app.pid")).unwrap();
        assert_eq!(pid, "42");
        assert_eq!(
            std::fs::read_link(root.path().join("var/run")).unwrap(),
            Path::new("/run")
        );
    }

    #[tokio::test]
    async fn test_relative_symlink_cannot_escape_root() {
        let root = tempdir().unwrap();
        let layers = vec![
            symlink_layer(&[("escape", "../../../../../../..")]),
            tar_layer(&[("escape/planted", "x")]),
        ];

        materialize_all(layers, root.path()).await.unwrap();

        assert!(root.path().join("planted").is_file());
    }

    #[tokio::test]
    async fn test_file_replaces_symlink() {
        let root = tempdir().unwrap();
        let layers = vec![
            tar_layer(&[("etc/real", "real")]),
            symlink_layer(&[("etc/conf", "/etc/real")]),
            tar_layer(&[("etc/conf", "own")]),
        ];

        materialize_all(layers, root.path()).await.unwrap();

        let meta = std::fs::symlink_metadata(root.path().join("etc/conf")).unwrap();
        assert!(meta.is_file());
        assert_eq!(std::fs::read_to_string(root.path().join("etc/conf")).unwrap(), "own");
        assert_eq!(std::fs::read_to_string(root.path().join("etc/real")).unwrap(), "real");
    }

    #[tokio::test]
    async fn test_hard_link_stays_in_root() {
        let root = tempdir().unwrap();
        let layers = vec![
            symlink_layer(&[("lib", "/usr/lib")]),
            tar_layer(&[("usr/lib/libz.so.1", "zlib")]),
            hard_link_layer(&[("usr/lib/libz.so", "/lib/libz.so.1")]),
        ];

        materialize_all(layers, root.path()).await.unwrap();

        let linked = std::fs::read_to_string(root.path().join("usr/lib/libz.so")).unwrap();
        assert_eq!(linked, "zlib");
    }

    #[tokio::test]
    async fn test_symlink_loop_is_extraction_error() {
        let root = tempdir().unwrap();
        let layers = vec![
            symlink_layer(&[("a", "b"), ("b", "a")]),
            tar_layer(&[("a/file", "x")]),
        ];

        let err = materialize_all(layers, root.path()).await.unwrap_err();
        assert!(matches!(err, JailError::Extraction { .. }));
    }

    #[tokio::test]
    async fn test_later_layers_win() {
        let l1 = tar_layer(&[("etc/x", "one")]);
        let l2 = tar_layer(&[("etc/x", "two")]);
        let l3 = gzip(&tar_layer(&[("etc/x", "three")]));
        let digests = [sha256_digest(&l1), sha256_digest(&l2), sha256_digest(&l3)];

        let registry = FakeRegistry::new()
            .with_blob(l1)
            .with_blob(l2)
            .with_blob(l3);
        let manifest = manifest_for(&[
            digests[0].as_str(),
            digests[1].as_str(),
            digests[2].as_str(),
        ]);
        let root = tempdir().unwrap();

        LayerMaterializer::new(&registry)
            .materialize("redis", &manifest, root.path(), &test_token())
            .await
            .unwrap();

        let contents = std::fs::read_to_string(root.path().join("etc/x")).unwrap();
        assert_eq!(contents, "three");
        assert_eq!(registry.blob_requests(), digests.to_vec());
    }

    #[tokio::test]
    async fn test_layers_are_additive() {
        let l1 = tar_layer(&[("bin/a", "a")]);
        let l2 = tar_layer(&[("bin/b", "b")]);
        let (d1, d2) = (sha256_digest(&l1), sha256_digest(&l2));
        let manifest = manifest_for(&[d1.as_str(), d2.as_str()]);
        let registry = FakeRegistry::new().with_blob(l1).with_blob(l2);
        let root = tempdir().unwrap();

        LayerMaterializer::new(&registry)
            .materialize("busybox", &manifest, root.path(), &test_token())
            .await
            .unwrap();

        assert!(root.path().join("bin/a").is_file());
        assert!(root.path().join("bin/b").is_file());
    }

    #[tokio::test]
    async fn test_stops_at_first_missing_layer() {
        let l1 = tar_layer(&[("one", "1")]);
        let l3 = tar_layer(&[("three", "3")]);
        let (d1, d3) = (sha256_digest(&l1), sha256_digest(&l3));
        let manifest = manifest_for(&[d1.as_str(), "sha256:missing", d3.as_str()]);
        let registry = FakeRegistry::new().with_blob(l1).with_blob(l3);
        let root = tempdir().unwrap();

        let err = LayerMaterializer::new(&registry)
            .materialize("redis", &manifest, root.path(), &test_token())
            .await
            .unwrap_err();

        assert!(matches!(err, JailError::LayerFetch { ref digest, .. } if digest == "sha256:missing"));
        assert!(root.path().join("one").is_file());
        assert!(!root.path().join("three").exists());
        assert_eq!(registry.blob_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_archive_is_extraction_error() {
        let garbage = vec![0xffu8; 1024];
        let digest = sha256_digest(&garbage);
        let manifest = manifest_for(&[digest.as_str()]);
        let registry = FakeRegistry::new().with_blob(garbage);
        let root = tempdir().unwrap();

        let err = LayerMaterializer::new(&registry)
            .materialize("redis", &manifest, root.path(), &test_token())
            .await
            .unwrap_err();
        assert!(matches!(err, JailError::Extraction { .. }));
    }

    #[tokio::test]
    async fn test_tampered_blob_rejected() {
        let layer = tar_layer(&[("etc/x", "real")]);
        let digest = sha256_digest(&layer);
        let manifest = manifest_for(&[digest.as_str()]);
        let registry =
            FakeRegistry::new().with_blob_at(&digest, tar_layer(&[("etc/x", "forged")]));
        let root = tempdir().unwrap();

        let err = LayerMaterializer::new(&registry)
            .materialize("redis", &manifest, root.path(), &test_token())
            .await
            .unwrap_err();
        assert!(matches!(err, JailError::LayerFetch { .. }));
        assert!(!root.path().join("etc/x").exists());
    }
}
