use std::path::PathBuf;

use clap::Args;
use nostr_sdk::prelude::*;
use ::url::Url;

use bunker_daemon::app_config::{AppConfigError, AppState, StoredKey};
use bunker_daemon::{spawn_service, ServiceConfig};
use common::crypto::{decrypt_secret, VaultCryptoError};

const MAX_PASSPHRASE_ATTEMPTS: usize = 3;

/// Unlock stored keys and run the bunker.
#[derive(Args, Debug, Clone)]
pub struct Start {
    /// Key names to unlock and serve (defaults to every stored key)
    #[arg(long = "key")]
    pub keys: Vec<String>,

    /// Additional admin npubs, merged with the config allow-list
    #[arg(long = "admin", env = "ADMIN_NPUBS", value_delimiter = ',')]
    pub admins: Vec<String>,

    /// Enable debug logging
    #[arg(long)]
    pub verbose: bool,

    /// Directory for log files (logs to stdout only if not set)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("config error: {0}")]
    Config(#[from] AppConfigError),
    #[error("no stored key named '{0}'")]
    UnknownKey(String),
    #[error("could not unlock '{0}': wrong passphrase")]
    WrongPassphrase(String),
    #[error("stored secret for '{0}' is corrupt")]
    CorruptEntry(String),
    #[error("stored secret is not a valid key: {0}")]
    BadSecret(#[from] nostr_sdk::key::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Start {
    pub async fn run(&self, config_path: Option<PathBuf>) -> Result<String, StartError> {
        // an unreadable vault file at boot is fatal
        let app = AppState::load(config_path)?;

        let key_names: Vec<String> = if self.keys.is_empty() {
            app.config.keys.keys().cloned().collect()
        } else {
            for name in &self.keys {
                if !app.config.keys.contains_key(name) {
                    return Err(StartError::UnknownKey(name.clone()));
                }
            }
            self.keys.clone()
        };

        let mut unlocked_keys = Vec::new();
        for name in &key_names {
            let stored = app
                .config
                .keys
                .get(name)
                .ok_or_else(|| StartError::UnknownKey(name.clone()))?;
            let keys = unlock(name, stored)?;
            unlocked_keys.push((name.clone(), keys));
        }

        let log_level = if self.verbose || app.config.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .and_then(|raw| Url::parse(&raw).ok());

        let config = ServiceConfig {
            app,
            unlocked_keys,
            extra_admins: self.admins.clone(),
            database_url,
            log_level,
            log_dir: self.log_dir.clone(),
        };

        spawn_service(&config).await;
        Ok("daemon ended".to_string())
    }
}

fn unlock(name: &str, stored: &StoredKey) -> Result<Keys, StartError> {
    match stored {
        StoredKey::Plain { key } => Ok(Keys::parse(key)?),
        StoredKey::Encrypted(entry) => {
            for attempt in 1..=MAX_PASSPHRASE_ATTEMPTS {
                let passphrase =
                    crate::cli::ops::prompt(&format!("passphrase for '{}'", name))?;
                match decrypt_secret(entry, &passphrase) {
                    Ok(secret) => return Ok(Keys::parse(&secret)?),
                    Err(VaultCryptoError::DecryptionFailed) => {
                        eprintln!(
                            "wrong passphrase ({}/{})",
                            attempt, MAX_PASSPHRASE_ATTEMPTS
                        );
                    }
                    Err(_) => return Err(StartError::CorruptEntry(name.to_string())),
                }
            }
            Err(StartError::WrongPassphrase(name.to_string()))
        }
    }
}
