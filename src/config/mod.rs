//! Configuration for the autotrader.
//!
//! Loads settings from an optional `config.*` file and `TIQS`-prefixed
//! environment variables (e.g. `TIQS_CREDENTIALS__USER_ID`).

use crate::auth::ClientParams;
use anyhow::{Context, Result};
use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Broker login credentials
    pub credentials: CredentialsConfig,
    /// Session settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Market-data socket settings
    #[serde(default)]
    pub socket: SocketSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsConfig {
    /// User id used to log in
    #[serde(default)]
    pub user_id: String,
    /// Account password
    #[serde(default)]
    pub password: String,
    /// Base32 TOTP secret for the 2FA step
    #[serde(default)]
    pub totp_key: String,
    /// App id issued with the API subscription
    pub app_id: String,
    /// App secret issued with the API subscription
    #[serde(default)]
    pub app_secret: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    /// Pre-minted access token; when absent the full login flow runs.
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocketSettings {
    /// Socket endpoint override.
    #[serde(default = "default_socket_url")]
    pub url: String,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            url: default_socket_url(),
        }
    }
}

fn default_socket_url() -> String {
    crate::socket::SOCKET_URL.to_string()
}

impl AppConfig {
    /// Load configuration from config files and environment variables.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("TIQS"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.credentials.app_id.is_empty(),
            "credentials.app_id must be set"
        );
        anyhow::ensure!(
            self.session.access_token.is_some() || !self.credentials.user_id.is_empty(),
            "either session.access_token or full login credentials must be set"
        );
        anyhow::ensure!(!self.socket.url.is_empty(), "socket.url must not be empty");
        Ok(())
    }

    /// Credentials in the shape the login flow consumes.
    pub fn client_params(&self) -> ClientParams {
        ClientParams {
            user_id: self.credentials.user_id.clone(),
            password: self.credentials.password.clone(),
            totp_key: self.credentials.totp_key.clone(),
            app_id: self.credentials.app_id.clone(),
            app_secret: self.credentials.app_secret.clone(),
        }
    }
}
