//! In-memory API key registry.
//!
//! Keys are never stored in the clear: the registry is indexed by the hex
//! SHA-256 digest of the key, so a memory dump does not reveal usable keys.

use std::collections::{BTreeSet, HashMap};

use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::access::AccessLevel;

const KEY_PREFIX: &str = "tg_";

/// What the registry knows about one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeyRecord {
    pub client_id: String,
    pub access_level: AccessLevel,
    /// Expiry in Unix seconds.
    pub expires_at: Option<u64>,
    pub operations: Option<BTreeSet<String>>,
}

#[derive(Debug, Default)]
pub struct ApiKeyRegistry {
    keys: HashMap<String, ApiKeyRecord>,
}

impl ApiKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a key for `record` and return it in the clear. Only its digest is kept.
    pub fn add(&mut self, record: ApiKeyRecord) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = format!("{KEY_PREFIX}{}", hex::encode(bytes));
        self.keys.insert(digest(&key), record);
        key
    }

    pub fn lookup(&self, key: &str) -> Option<&ApiKeyRecord> {
        self.keys.get(&digest(key))
    }

    pub fn revoke(&mut self, key: &str) -> Option<ApiKeyRecord> {
        self.keys.remove(&digest(key))
    }

    /// Drop keys whose expiry is strictly before `now`. Returns how many were removed.
    pub fn remove_expired(&mut self, now: u64) -> usize {
        let before = self.keys.len();
        self.keys
            .retain(|_, record| !matches!(record.expires_at, Some(exp) if now > exp));
        before - self.keys.len()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}
