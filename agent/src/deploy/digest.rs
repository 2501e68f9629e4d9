//! Image digest and update resolution
//!
//! Staleness is decided by comparing the repo digest the engine has cached
//! locally with the digest the registry currently reports. Lookups are
//! best effort: failures degrade to `None` and never fail a check.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::ttl::TtlCache;
use crate::deploy::engine::ContainerEngine;
use crate::models::stack::InstalledStack;

/// Default TTL for local digests
pub const LOCAL_DIGEST_TTL: Duration = Duration::from_secs(30);

/// Default TTL for remote digests
pub const REMOTE_DIGEST_TTL: Duration = Duration::from_secs(300);

const DIGEST_CACHE_CAPACITY: usize = 512;

/// Digest comparison for one image reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDigestState {
    pub image: String,
    pub local_digest: Option<String>,
    pub remote_digest: Option<String>,
    pub update_available: bool,
}

impl ImageDigestState {
    fn new(image: &str, local_digest: Option<String>, remote_digest: Option<String>) -> Self {
        let update_available = matches!(
            (&local_digest, &remote_digest),
            (Some(local), Some(remote)) if local != remote
        );
        Self {
            image: image.to_string(),
            local_digest,
            remote_digest,
            update_available,
        }
    }

    fn has_digest(&self) -> bool {
        self.local_digest.is_some() || self.remote_digest.is_some()
    }
}

/// Resolves local and registry digests with separate caches
pub struct DigestResolver {
    engine: Arc<dyn ContainerEngine>,
    local: TtlCache<Option<String>>,
    remote: TtlCache<Option<String>>,
}

impl DigestResolver {
    /// Create a resolver with the default TTLs
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self::with_ttls(engine, LOCAL_DIGEST_TTL, REMOTE_DIGEST_TTL)
    }

    /// Create a resolver with explicit TTLs
    pub fn with_ttls(engine: Arc<dyn ContainerEngine>, local_ttl: Duration, remote_ttl: Duration) -> Self {
        Self {
            engine,
            local: TtlCache::new(local_ttl, DIGEST_CACHE_CAPACITY),
            remote: TtlCache::new(remote_ttl, DIGEST_CACHE_CAPACITY),
        }
    }

    /// Drop the cached local digest, e.g. after the image was pulled
    pub fn invalidate_local(&self, image: &str) {
        self.local.remove(image);
    }

    /// First repo digest of the locally cached image
    pub async fn resolve_local_image_digest(&self, image: &str) -> Option<String> {
        if let Some(cached) = self.local.get(image) {
            return cached;
        }

        match self.engine.inspect_local_digests(image).await {
            Ok(repo_digests) => {
                let digest = repo_digests.iter().find_map(|r| digest_part(r));
                self.local.insert(image, digest.clone());
                digest
            }
            Err(e) => {
                warn!("Failed to resolve local digest for {}: {}", image, e);
                None
            }
        }
    }

    /// Digest the registry reports for the image.
    ///
    /// A reference that already pins a digest is answered without a lookup.
    pub async fn resolve_remote_image_digest(&self, image: &str) -> Option<String> {
        if let Some(pinned) = digest_part(image) {
            return Some(pinned);
        }

        if let Some(cached) = self.remote.get(image) {
            return cached;
        }

        let mut failed = true;
        let mut digest = None;
        for verbose in [true, false] {
            match self.engine.inspect_remote_manifest(image, verbose).await {
                Ok(manifest) => {
                    failed = false;
                    digest = manifest_digest(&manifest);
                    if digest.is_some() {
                        break;
                    }
                    debug!("No digest in manifest for {} (verbose: {})", image, verbose);
                }
                Err(e) => {
                    warn!(
                        "Failed to inspect manifest for {} (verbose: {}): {}",
                        image, verbose, e
                    );
                }
            }
        }

        if !failed {
            self.remote.insert(image, digest.clone());
        }
        digest
    }

    /// Local and remote digests, resolved concurrently
    pub async fn resolve_image_digest_state(&self, image: &str) -> ImageDigestState {
        let (local, remote) = futures::join!(
            self.resolve_local_image_digest(image),
            self.resolve_remote_image_digest(image)
        );
        ImageDigestState::new(image, local, remote)
    }

    /// Update state of a deployed stack.
    ///
    /// Returns the first image with an update, else the first image for which
    /// any digest resolved, else `None`.
    pub async fn resolve_store_app_update_state(
        &self,
        stack: &InstalledStack,
    ) -> Option<ImageDigestState> {
        let images = match self.engine.resolve_images(&stack.compose_path).await {
            Ok(images) => images,
            Err(e) => {
                warn!("Failed to resolve images for {}: {}", stack.app_id, e);
                return None;
            }
        };

        let mut representative = None;
        for image in &images {
            let state = self.resolve_image_digest_state(image).await;
            if state.update_available {
                return Some(state);
            }
            if representative.is_none() && state.has_digest() {
                representative = Some(state);
            }
        }

        representative
    }
}

/// The `sha256:...` part of a `name@sha256:...` reference
pub fn digest_part(reference: &str) -> Option<String> {
    reference
        .split_once('@')
        .map(|(_, digest)| digest.trim())
        .filter(|digest| !digest.is_empty())
        .map(str::to_string)
}

/// Digest of a manifest inspection result.
///
/// Handles the verbose form (an object with a `Descriptor`, or an array of
/// them for multi-arch images) and the plain form (a manifest list whose
/// first entry is taken).
pub fn manifest_digest(manifest: &Value) -> Option<String> {
    let as_digest = |v: &Value| {
        v.as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    match manifest {
        Value::Array(entries) => entries.first().and_then(manifest_digest),
        Value::Object(obj) => {
            if let Some(digest) = obj
                .get("Descriptor")
                .and_then(|d| d.get("digest"))
                .and_then(as_digest)
            {
                return Some(digest);
            }
            if let Some(first) = obj
                .get("manifests")
                .and_then(Value::as_array)
                .and_then(|m| m.first())
            {
                return first.get("digest").and_then(as_digest);
            }
            obj.get("digest").and_then(as_digest)
        }
        _ => None,
    }
}
