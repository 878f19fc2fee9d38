//! Descriptor cache keyed by onion address

use super::address::OnionAddress;
use super::descriptor::Descriptor;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use veilway_common::{hs, Timestamp};

struct CachedDescriptor {
    descriptor: Descriptor,
    expires_at: Timestamp,
}

/// Owns fetched descriptors until they expire
pub struct DescriptorCache {
    entries: RwLock<HashMap<OnionAddress, CachedDescriptor>>,

    /// Cap on how long any descriptor is trusted, whatever lifetime it
    /// claims
    max_lifetime: Duration,
}

impl DescriptorCache {
    pub fn new() -> Self {
        Self::with_max_lifetime(Duration::from_secs(hs::DESCRIPTOR_LIFETIME_SECS))
    }

    pub fn with_max_lifetime(max_lifetime: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_lifetime,
        }
    }

    /// Store a descriptor fetched now; expiry is fetch time plus the
    /// descriptor's lifetime, capped at the cache's maximum.
    pub async fn put(&self, descriptor: Descriptor) {
        let now = Timestamp::now();
        let expires_at = descriptor
            .expires_at(now)
            .min(now.plus(self.max_lifetime));
        self.entries.write().await.insert(
            descriptor.address,
            CachedDescriptor {
                descriptor,
                expires_at,
            },
        );
    }

    /// A hit requires now <= expires_at.
    pub async fn get(&self, address: &OnionAddress) -> Option<Descriptor> {
        let entries = self.entries.read().await;
        let cached = entries.get(address)?;
        if Timestamp::now() <= cached.expires_at {
            Some(cached.descriptor.clone())
        } else {
            None
        }
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Timestamp::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, cached| now <= cached.expires_at);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for DescriptorCache {
    fn default() -> Self {
        Self::new()
    }
}
