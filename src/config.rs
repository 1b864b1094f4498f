//! Provider options and the TOML config file.
//!
//! `ConfigFile` is the raw, user-editable form. Converting it into
//! `ProviderOptions` is where configuration is validated.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{ProviderError, Result};
use crate::streaming::protocol::DEFAULT_BATCH_SIZE;

/// Authentication attached to the connection
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    /// Sent as `Authorization: Bearer <token>` when connecting
    Token { token: String },
}

impl Auth {
    pub fn token(token: impl Into<String>) -> Self {
        Auth::Token {
            token: token.into(),
        }
    }

    pub fn authorization_header(&self) -> String {
        match self {
            Auth::Token { token } => format!("Bearer {}", token),
        }
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::Token { .. } => f.debug_struct("Token").field("token", &"***").finish(),
        }
    }
}

/// Import strategy applied by the destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Restore,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitiesRestoreOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationRestoreOptions {
    #[serde(default)]
    pub webhook: bool,
    #[serde(default)]
    pub core_store: bool,
}

/// Restore options forwarded untouched to the destination on `init`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<EntitiesRestoreOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ConfigurationRestoreOptions>,
}

/// Options for a remote destination provider
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Base URL of the destination (http or https)
    pub url: Url,
    pub auth: Option<Auth>,
    pub strategy: Strategy,
    pub restore: RestoreOptions,
    /// Flush threshold for step batches, in bytes
    pub batch_size: usize,
}

impl ProviderOptions {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            auth: None,
            strategy: Strategy::default(),
            restore: RestoreOptions::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

// =============================================================================
// Config file
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl TryFrom<AuthConfig> for Auth {
    type Error = ProviderError;

    fn try_from(config: AuthConfig) -> Result<Self> {
        match config.kind.as_str() {
            "token" => match config.token {
                Some(token) if !token.is_empty() => Ok(Auth::Token { token }),
                _ => Err(ProviderError::validation(
                    "auth.token",
                    "Token auth requires a non-empty token",
                )),
            },
            other => Err(ProviderError::validation(
                "auth.type",
                format!("Auth method \"{}\" not available", other),
            )),
        }
    }
}

/// On-disk configuration (`config.toml`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub url: Option<String>,
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub strategy: Strategy,
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub restore: RestoreOptions,
}

impl ConfigFile {
    /// Default location: `<config_dir>/remote-transfer/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("remote-transfer").join("config.toml"))
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ProviderError::validation("config", e.to_string()))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            ProviderError::validation("config", format!("{}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn into_options(self) -> Result<ProviderOptions> {
        let raw_url = self
            .url
            .ok_or_else(|| ProviderError::validation("url", "No destination URL configured"))?;
        let url = Url::parse(&raw_url).map_err(|e| {
            ProviderError::validation("url", format!("Invalid URL \"{}\": {}", raw_url, e))
        })?;

        let auth = self.auth.map(Auth::try_from).transpose()?;

        let batch_size = self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(ProviderError::validation(
                "batch_size",
                "Batch size must be greater than zero",
            ));
        }

        Ok(ProviderOptions {
            url,
            auth,
            strategy: self.strategy,
            restore: self.restore,
            batch_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = ConfigFile::parse(
            r#"
            url = "https://cms.example.com/admin"
            strategy = "restore"
            batch_size = 4096

            [auth]
            type = "token"
            token = "secret"

            [restore.entities]
            exclude = ["plugin::users-permissions.user"]

            [restore.configuration]
            webhook = true
            "#,
        )
        .unwrap();

        let options = config.into_options().unwrap();
        assert_eq!(options.url.as_str(), "https://cms.example.com/admin");
        assert_eq!(options.auth, Some(Auth::token("secret")));
        assert_eq!(options.batch_size, 4096);
        assert_eq!(
            options.restore.entities.unwrap().exclude,
            vec!["plugin::users-permissions.user".to_string()]
        );
        assert!(options.restore.configuration.unwrap().webhook);
    }

    #[test]
    fn test_defaults() {
        let options = ConfigFile::parse(r#"url = "http://localhost:1337""#)
            .unwrap()
            .into_options()
            .unwrap();
        assert_eq!(options.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(options.strategy, Strategy::Restore);
        assert!(options.auth.is_none());
    }

    #[test]
    fn test_unsupported_auth_type() {
        let err = ConfigFile::parse(
            r#"
            url = "http://localhost:1337"
            [auth]
            type = "basic"
            "#,
        )
        .unwrap()
        .into_options()
        .unwrap_err();

        match err {
            ProviderError::Validation { check, .. } => assert_eq!(check, "auth.type"),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_token_auth_requires_token() {
        let err = Auth::try_from(AuthConfig {
            kind: "token".to_string(),
            token: None,
        })
        .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Validation {
                check: "auth.token",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_and_invalid_url() {
        let err = ConfigFile::default().into_options().unwrap_err();
        assert!(matches!(err, ProviderError::Validation { check: "url", .. }));

        let err = ConfigFile {
            url: Some("not a url".to_string()),
            ..Default::default()
        }
        .into_options()
        .unwrap_err();
        assert!(matches!(err, ProviderError::Validation { check: "url", .. }));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = ConfigFile {
            url: Some("http://localhost".to_string()),
            batch_size: Some(0),
            ..Default::default()
        }
        .into_options()
        .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Validation {
                check: "batch_size",
                ..
            }
        ));
    }

    #[test]
    fn test_auth_header_and_redacted_debug() {
        let auth = Auth::token("abc");
        assert_eq!(auth.authorization_header(), "Bearer abc");
        assert!(!format!("{:?}", auth).contains("abc"));
    }

    #[test]
    fn test_default_restore_serializes_empty() {
        assert_eq!(
            serde_json::to_value(RestoreOptions::default()).unwrap(),
            serde_json::json!({})
        );
    }
}
