use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use parley_core::collaborators::AuthProvider;
use parley_core::errors::AuthError;
use parley_core::ids::UserId;
use parley_settings::AuthSettings;

/// Bearer tokens configured up front, each mapped to one user.
pub struct StaticTokenAuth {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenAuth {
    pub fn new(entries: impl IntoIterator<Item = (SecretString, UserId)>) -> Self {
        let tokens = entries
            .into_iter()
            .filter(|(token, _)| !token.expose_secret().is_empty())
            .map(|(token, user)| (token.expose_secret().to_owned(), user))
            .collect();
        Self { tokens }
    }

    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(
            settings
                .tokens
                .iter()
                .map(|entry| (entry.token(), UserId::from_raw(entry.user_id.clone()))),
        )
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl AuthProvider for StaticTokenAuth {
    async fn verify(&self, credential: &str) -> Result<UserId, AuthError> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or(AuthError::Unauthenticated)
    }
}

/// Token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
