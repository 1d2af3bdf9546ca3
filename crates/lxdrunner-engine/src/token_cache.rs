// TokenCache: registration tokens cached per scope and refreshed when
// close to expiry.

use lxdrunner_common::constants::TOKEN_REFRESH_MARGIN;
use lxdrunner_common::{CiError, CiProvider, RegistrationToken, Scope, SecretMasker, Tracing};
use lxdrunner_sdk::TraceWriter;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub struct TokenCache {
    provider: Arc<dyn CiProvider>,
    masker: Arc<SecretMasker>,
    margin: Duration,
    // Held across the provider call so concurrent jobs for one scope cause
    // a single request.
    tokens: Mutex<TokenState>,
    trace: Tracing,
}

#[derive(Default)]
struct TokenState {
    current: HashMap<Scope, RegistrationToken>,
    // Replaced tokens stay masked until they expire; jobs dispatched
    // earlier still carry them.
    retired: Vec<RegistrationToken>,
}

impl TokenCache {
    pub fn new(provider: Arc<dyn CiProvider>, masker: Arc<SecretMasker>, trace: Tracing) -> Self {
        Self {
            provider,
            masker,
            margin: TOKEN_REFRESH_MARGIN,
            tokens: Mutex::new(TokenState::default()),
            trace,
        }
    }

    /// A registration token for `scope` valid for more than the refresh margin.
    pub async fn token(&self, scope: &Scope) -> Result<String, CiError> {
        self.token_at(scope, Utc::now()).await
    }

    pub async fn token_at(&self, scope: &Scope, now: DateTime<Utc>) -> Result<String, CiError> {
        let mut tokens = self.tokens.lock().await;
        if let Some(cached) = tokens.current.get(scope) {
            if !cached.needs_refresh(now, self.margin) {
                return Ok(cached.token.clone());
            }
            self.trace.verbose(&format!(
                "Registration token for {} expires at {}, refreshing",
                scope, cached.expires_at
            ));
        }

        let fresh = self.provider.issue_registration_token(scope).await?;
        self.masker.add_value(&fresh.token);
        self.trace.info(&format!(
            "Issued registration token for {} (expires {})",
            scope, fresh.expires_at
        ));
        let token = fresh.token.clone();
        if let Some(old) = tokens.current.insert(scope.clone(), fresh) {
            if old.token != token {
                tokens.retired.push(old);
            }
        }

        let masker = &self.masker;
        tokens.retired.retain(|old| {
            if old.expires_at > now {
                return true;
            }
            masker.remove_value(&old.token);
            false
        });
        Ok(token)
    }
}
