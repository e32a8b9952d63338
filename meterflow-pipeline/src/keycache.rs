//! Project api-key cache
//!
//! Read-mostly map from api-key hash to `(organisation, project)`. Only
//! hashes live in memory or in the durable store; the plaintext key exists
//! once, in the response that created it. Entries are invalidated on
//! rotation and repopulated lazily from the durable store, so the cache is
//! eventually consistent with it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};

use meterflow_core::errors::StoreResult;
use meterflow_core::model::{OrganisationId, ProjectId};
use meterflow_storage::{organisations, DurableStore};

const API_KEY_PREFIX: &str = "mf_";

/// One-way hash of a project api key.
pub fn hash_api_key(api_key: &str) -> String {
    let digest = Sha256::digest(api_key.as_bytes());
    hex::encode(digest)
}

/// Generate a fresh project api key: `mf_` plus 32 random bytes, base64url.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{API_KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

#[derive(Debug, Clone, Copy)]
struct CachedProject {
    organisation_id: OrganisationId,
    project_id: ProjectId,
}

/// Cache over the projects table, keyed by api-key hash
pub struct ProjectKeyCache {
    store: DurableStore,
    entries: DashMap<String, CachedProject>,
}

impl ProjectKeyCache {
    pub fn new(store: DurableStore) -> Self {
        Self {
            store,
            entries: DashMap::new(),
        }
    }

    /// Resolve a plaintext api key to its project, consulting the cache
    /// first. Unknown or inactive keys resolve to `None`.
    pub async fn resolve(
        &self,
        api_key: &str,
    ) -> StoreResult<Option<(OrganisationId, ProjectId)>> {
        let hash = hash_api_key(api_key);
        if let Some(entry) = self.entries.get(&hash) {
            return Ok(Some((entry.organisation_id, entry.project_id)));
        }
        match organisations::find_project_by_api_key_hash(&self.store, &hash).await? {
            Some(project) => {
                self.entries.insert(
                    hash,
                    CachedProject {
                        organisation_id: project.organisation_id,
                        project_id: project.id,
                    },
                );
                Ok(Some((project.organisation_id, project.id)))
            }
            None => Ok(None),
        }
    }

    /// Drop a hash after rotation or deactivation; the old key stops
    /// resolving on the next request.
    pub fn invalidate_hash(&self, api_key_hash: &str) {
        self.entries.remove(api_key_hash);
    }

    /// Drop every cached entry for a project.
    pub fn invalidate_project(&self, project_id: ProjectId) {
        self.entries.retain(|_, cached| cached.project_id != project_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_stable_and_hex() {
        let a = hash_api_key("mf_test_key");
        let b = hash_api_key("mf_test_key");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, hash_api_key("mf_other_key"));
    }

    #[test]
    fn generated_keys_are_prefixed_and_distinct() {
        let k1 = generate_api_key();
        let k2 = generate_api_key();
        assert!(k1.starts_with(API_KEY_PREFIX));
        assert!(k1.len() > 40);
        assert_ne!(k1, k2);
    }
}
