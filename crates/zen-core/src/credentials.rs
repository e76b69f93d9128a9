//! Credential accessors injected into API providers.

use std::collections::BTreeMap;

use crate::error::{ErrorCode, Result, ZenError};

pub trait Credentials: Send + Sync {
    /// Token (or password, for basic auth) for `provider`.
    fn get(&self, provider: &str) -> Result<String>;

    /// Username for basic auth, when one is configured.
    fn user(&self, provider: &str) -> Option<String> {
        let _ = provider;
        None
    }

    fn is_authenticated(&self, provider: &str) -> bool {
        self.validate(provider).is_ok()
    }

    fn validate(&self, provider: &str) -> Result<()> {
        let token = self.get(provider)?;
        if token.trim().is_empty() || token.chars().any(char::is_whitespace) {
            return Err(auth_error(provider, "credential is empty or malformed"));
        }
        Ok(())
    }
}

fn auth_error(provider: &str, message: &str) -> ZenError {
    ZenError::new(ErrorCode::AuthFailed, message).with_provider(provider)
}

/// Environment variable holding the token for `provider`
/// (`jira` → `ZEN_JIRA_TOKEN`).
pub fn token_var(provider: &str) -> String {
    format!("ZEN_{}_TOKEN", env_segment(provider))
}

pub fn user_var(provider: &str) -> String {
    format!("ZEN_{}_USER", env_segment(provider))
}

fn env_segment(provider: &str) -> String {
    provider
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// EnvCredentials
// ---------------------------------------------------------------------------

/// Reads `ZEN_<PROVIDER>_TOKEN` / `ZEN_<PROVIDER>_USER`, captured once at
/// construction.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials {
    vars: BTreeMap<String, String>,
}

impl EnvCredentials {
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, _)| k.starts_with("ZEN_"))
            .collect();
        Self { vars }
    }
}

impl Credentials for EnvCredentials {
    fn get(&self, provider: &str) -> Result<String> {
        let var = token_var(provider);
        self.vars
            .get(&var)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| {
                auth_error(provider, "no credential configured")
                    .with_hint(format!("set {var} in the environment"))
            })
    }

    fn user(&self, provider: &str) -> Option<String> {
        self.vars
            .get(&user_var(provider))
            .filter(|v| !v.is_empty())
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// StaticCredentials
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    tokens: BTreeMap<String, String>,
    users: BTreeMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, provider: &str, token: &str) -> Self {
        self.tokens.insert(provider.to_string(), token.to_string());
        self
    }

    pub fn with_user(mut self, provider: &str, user: &str) -> Self {
        self.users.insert(provider.to_string(), user.to_string());
        self
    }
}

impl Credentials for StaticCredentials {
    fn get(&self, provider: &str) -> Result<String> {
        self.tokens
            .get(provider)
            .cloned()
            .ok_or_else(|| auth_error(provider, "no credential configured"))
    }

    fn user(&self, provider: &str) -> Option<String> {
        self.users.get(provider).cloned()
    }
}
