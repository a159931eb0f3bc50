// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Embedding front-end with a TTL'd LRU cache.
//!
//! Within the TTL, the same `(model, dimensions, text)` triple hits the
//! adapter exactly once.  Requested dimensions are forwarded verbatim to
//! the provider; any remapping is caller policy.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use ensemble_config::{EMBEDDING_CACHE_MAX, EMBEDDING_TTL_MS};
use ensemble_model::{EmbedOptions, ProviderAdapter, ProviderError};

struct CachedVector {
    vector: Arc<Vec<f32>>,
    stored_at: Instant,
}

/// Keyed LRU of embedding vectors.
pub struct EmbeddingCache {
    entries: Mutex<LruCache<String, CachedVector>>,
    ttl: Duration,
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(EMBEDDING_CACHE_MAX, Duration::from_millis(EMBEDDING_TTL_MS))
    }
}

impl EmbeddingCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero"),
            )),
            ttl,
        }
    }

    fn key(model: &str, dimensions: Option<u32>, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update(b"\0");
        hasher.update(dimensions.unwrap_or(0).to_be_bytes());
        hasher.update(b"\0");
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn get(&self, key: &str) -> Option<Arc<Vec<f32>>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(cached) if cached.stored_at.elapsed() < self.ttl => {
                Some(Arc::clone(&cached.vector))
            }
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: String, vector: Arc<Vec<f32>>) {
        self.entries.lock().put(
            key,
            CachedVector {
                vector,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Embed `text` with `model`, consulting the cache first.
pub async fn ensemble_embed(
    adapter: &dyn ProviderAdapter,
    cache: &EmbeddingCache,
    text: &str,
    model: &str,
    opts: &EmbedOptions,
) -> Result<Arc<Vec<f32>>, ProviderError> {
    let key = EmbeddingCache::key(model, opts.dimensions, text);
    if let Some(hit) = cache.get(&key) {
        return Ok(hit);
    }
    let vector = Arc::new(adapter.create_embedding(text, model, opts).await?);
    cache.put(key, Arc::clone(&vector));
    Ok(vector)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
