//! Runner credential issuance and validation.

use std::collections::HashSet;

use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::info;

/// Issues and checks runner registration tokens.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Mint a new token that `validate` will accept.
    async fn issue_token(&self) -> String;

    /// Whether `token` may register a runner.
    async fn validate(&self, token: &str) -> bool;
}

/// Accepts tokens it issued plus a configured allow-list.
///
/// Only SHA-256 digests are kept in memory.
pub struct TokenAuthority {
    digests: RwLock<HashSet<String>>,
}

impl TokenAuthority {
    pub fn new(configured: impl IntoIterator<Item = String>) -> Self {
        let digests = configured
            .into_iter()
            .filter(|t| !t.is_empty())
            .map(|t| digest_token(&t))
            .collect();
        Self {
            digests: RwLock::new(digests),
        }
    }

    pub async fn len(&self) -> usize {
        self.digests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.digests.read().await.is_empty()
    }
}

#[async_trait]
impl Authenticator for TokenAuthority {
    async fn issue_token(&self) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        self.digests.write().await.insert(digest_token(&token));
        info!("Issued runner token");
        token
    }

    async fn validate(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        self.digests.read().await.contains(&digest_token(token))
    }
}

/// Hex SHA-256 of a token.
pub fn digest_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
