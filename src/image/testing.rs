//! In-memory registry and fixture builders for tests

use super::registry::{media_types, AuthToken, Distribution, ManifestResponse};
use crate::error::{JailError, Result};
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

/// A request seen by [`FakeRegistry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Request {
    Auth(String),
    Manifest(String),
    Blob(String),
}

/// Serves canned manifests and blobs and records every request
#[derive(Default)]
pub(crate) struct FakeRegistry {
    fail_auth: bool,
    manifests: HashMap<String, ManifestResponse>,
    blobs: HashMap<String, Vec<u8>>,
    requests: Mutex<Vec<Request>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `authenticate` fail as if the endpoint were unreachable
    pub fn failing_auth(mut self) -> Self {
        self.fail_auth = true;
        self
    }

    pub fn with_manifest(self, reference: &str, manifest: Value) -> Self {
        let body = serde_json::to_vec(&manifest).unwrap();
        self.with_raw_manifest(reference, None, body)
    }

    pub fn with_raw_manifest(
        mut self,
        reference: &str,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> Self {
        self.manifests.insert(
            reference.to_string(),
            ManifestResponse {
                content_type: content_type.map(str::to_string),
                body,
            },
        );
        self
    }

    /// Serve `data` under its sha256 digest
    pub fn with_blob(mut self, data: Vec<u8>) -> Self {
        self.blobs.insert(sha256_digest(&data), data);
        self
    }

    /// Serve `data` under an arbitrary digest
    pub fn with_blob_at(mut self, digest: &str, data: Vec<u8>) -> Self {
        self.blobs.insert(digest.to_string(), data);
        self
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn blob_requests(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter_map(|r| match r {
                Request::Blob(digest) => Some(digest),
                _ => None,
            })
            .collect()
    }

    fn record(&self, request: Request) {
        self.requests.lock().unwrap().push(request);
    }
}

impl Distribution for FakeRegistry {
    async fn authenticate(&self, name: &str) -> Result<AuthToken> {
        self.record(Request::Auth(name.to_string()));
        if self.fail_auth {
            return Err(JailError::Auth("connection refused".to_string()));
        }
        Ok(test_token())
    }

    async fn fetch_manifest(
        &self,
        _name: &str,
        reference: &str,
        _accept: &[&str],
        _token: &AuthToken,
    ) -> Result<ManifestResponse> {
        self.record(Request::Manifest(reference.to_string()));
        self.manifests
            .get(reference)
            .cloned()
            .ok_or_else(|| JailError::ManifestFetch(format!("404 Not Found for {}", reference)))
    }

    async fn fetch_blob(
        &self,
        _name: &str,
        digest: &str,
        _token: &AuthToken,
        out: &mut impl Write,
    ) -> Result<u64> {
        self.record(Request::Blob(digest.to_string()));
        let data = self
            .blobs
            .get(digest)
            .ok_or_else(|| JailError::layer_fetch(digest, "registry answered 404 Not Found"))?;
        // Split like a network body would be.
        for chunk in data.chunks(16) {
            out.write_all(chunk).map_err(|e| JailError::layer_fetch(digest, e))?;
        }
        Ok(data.len() as u64)
    }
}

pub(crate) fn test_token() -> AuthToken {
    AuthToken::new("test-token", 300, Utc::now())
}

pub(crate) fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

/// Image manifest JSON listing `layers` in order
pub(crate) fn image_manifest(media_type: &str, layers: &[&str]) -> Value {
    let layers: Vec<Value> = layers
        .iter()
        .map(|digest| {
            json!({
                "mediaType": media_types::OCI_LAYER,
                "digest": digest,
                "size": 0
            })
        })
        .collect();
    json!({
        "schemaVersion": 2,
        "mediaType": media_type,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": "sha256:config",
            "size": 0
        },
        "layers": layers
    })
}

/// Index JSON pointing at `entries`, all claiming linux/amd64
pub(crate) fn index_manifest(media_type: &str, entries: &[&str]) -> Value {
    let manifests: Vec<Value> = entries
        .iter()
        .map(|digest| {
            json!({
                "mediaType": media_types::OCI_MANIFEST,
                "digest": digest,
                "size": 0,
                "platform": { "architecture": "amd64", "os": "linux" }
            })
        })
        .collect();
    json!({
        "schemaVersion": 2,
        "mediaType": media_type,
        "manifests": manifests
    })
}

/// Header owned by root, as found in real image layers
fn layer_header(kind: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_size(size);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(1_700_000_000);
    header
}

/// Uncompressed tar holding `files` as regular files
pub(crate) fn tar_layer(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = layer_header(tar::EntryType::Regular, 0o644, contents.len() as u64);
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap()
}

/// Uncompressed tar holding `links` as `(path, target)` symlinks
pub(crate) fn symlink_layer(links: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, target) in links {
        let mut header = layer_header(tar::EntryType::Symlink, 0o777, 0);
        builder.append_link(&mut header, path, target).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Uncompressed tar holding `links` as `(path, target)` hard links
pub(crate) fn hard_link_layer(links: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, target) in links {
        let mut header = layer_header(tar::EntryType::Link, 0o644, 0);
        builder.append_link(&mut header, path, target).unwrap();
    }
    builder.into_inner().unwrap()
}

pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}
