use std::path::PathBuf;

use clap::Args;
use nostr_sdk::prelude::*;

use bunker_daemon::app_config::{AppConfigError, AppState, StoredKey};
use common::crypto::{encrypt_secret, VaultCryptoError};

/// Encrypt an nsec under a passphrase and store it in the vault.
#[derive(Args, Debug, Clone)]
pub struct Add {
    /// Name for the stored key
    #[arg(long)]
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AddError {
    #[error("config error: {0}")]
    Config(#[from] AppConfigError),
    #[error("invalid nsec: {0}")]
    BadSecret(#[from] nostr_sdk::key::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] VaultCryptoError),
    #[error("passphrases do not match")]
    PassphraseMismatch,
    #[error("a passphrase is required")]
    EmptyPassphrase,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Add {
    pub async fn run(&self, config_path: Option<PathBuf>) -> Result<String, AddError> {
        let mut state = AppState::load_or_default(config_path)?;
        if state.config.keys.contains_key(&self.name) {
            return Err(AppConfigError::DuplicateKey(self.name.clone()).into());
        }

        let nsec = crate::cli::ops::prompt("nsec (or hex secret key)")?;
        let keys = Keys::parse(&nsec)?;

        let passphrase = crate::cli::ops::prompt("passphrase")?;
        if passphrase.is_empty() {
            return Err(AddError::EmptyPassphrase);
        }
        if crate::cli::ops::prompt("passphrase (again)")? != passphrase {
            return Err(AddError::PassphraseMismatch);
        }

        let secret_hex = keys.secret_key()?.to_secret_hex();
        let entry = encrypt_secret(&secret_hex, &passphrase)?;
        state.add_key(&self.name, StoredKey::Encrypted(entry))?;
        state.save()?;

        let npub = keys
            .public_key()
            .to_bech32()
            .unwrap_or_else(|_| keys.public_key().to_hex());
        Ok(format!("stored '{}' ({})", self.name, npub))
    }
}
