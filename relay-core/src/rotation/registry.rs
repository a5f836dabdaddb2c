use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::identity::IdentityProvider;

/// Credentials the relay keeps fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TokenType {
    LinkedIn,
    Facebook,
}

impl TokenType {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenType::LinkedIn => "linkedin",
            TokenType::Facebook => "facebook",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one token type is refreshed and where its value lives.
#[derive(Clone)]
pub struct RotationPolicy {
    pub secret_name: String,
    pub provider: Arc<dyn IdentityProvider>,
}

impl fmt::Debug for RotationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationPolicy")
            .field("secret_name", &self.secret_name)
            .finish_non_exhaustive()
    }
}

/// Maps each token type to its rotation policy.
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    policies: HashMap<TokenType, RotationPolicy>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        token: TokenType,
        secret_name: impl Into<String>,
        provider: Arc<dyn IdentityProvider>,
    ) -> Self {
        self.policies.insert(
            token,
            RotationPolicy {
                secret_name: secret_name.into(),
                provider,
            },
        );
        self
    }

    pub fn policy(&self, token: TokenType) -> Option<&RotationPolicy> {
        self.policies.get(&token)
    }

    /// Registered token types in a stable order.
    pub fn tokens(&self) -> Vec<TokenType> {
        let mut tokens: Vec<TokenType> = self.policies.keys().copied().collect();
        tokens.sort();
        tokens
    }
}
