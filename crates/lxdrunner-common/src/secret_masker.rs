// SecretMasker: replaces credentials (access token, registration tokens) in
// log output. Values are registered explicitly as they become known.

use parking_lot::RwLock;
use std::sync::Arc;

/// Replacement text used when a secret is found.
const MASK: &str = "***";

/// Values shorter than this are never masked; masking every "ab" in the log
/// would destroy it.
const MIN_SECRET_LENGTH: usize = 4;

/// Thread-safe store of secret values shared by every trace source.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    inner: Arc<RwLock<Vec<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value to mask. Blank and very short values are ignored.
    pub fn add_value(&self, secret: &str) {
        let trimmed = secret.trim();
        if trimmed.len() < MIN_SECRET_LENGTH {
            return;
        }

        let mut secrets = self.inner.write();
        if !secrets.iter().any(|s| s == trimmed) {
            secrets.push(trimmed.to_string());
            // Longest first so a secret containing another is masked whole.
            secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }

    /// Forget a value, e.g. a registration token that has been replaced.
    pub fn remove_value(&self, secret: &str) {
        let trimmed = secret.trim();
        self.inner.write().retain(|s| s != trimmed);
    }

    pub fn mask_secrets(&self, input: &str) -> String {
        let secrets = self.inner.read();
        let mut result = input.to_string();
        for secret in secrets.iter() {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), MASK);
            }
        }
        result
    }

    pub fn secret_count(&self) -> usize {
        self.inner.read().len()
    }
}
