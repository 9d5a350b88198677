use std::path::PathBuf;

use clap::Args;
use nostr_sdk::prelude::*;

use bunker_daemon::app_config::{AppConfigError, AppState};

/// Initialise the config file and whitelist admin npubs.
#[derive(Args, Debug, Clone)]
pub struct Setup {
    /// Admin npub to whitelist (repeatable)
    #[arg(long = "admin")]
    pub admins: Vec<String>,

    /// Relay to use (repeatable)
    #[arg(long = "relay")]
    pub relays: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("config error: {0}")]
    Config(#[from] AppConfigError),
    #[error("key error: {0}")]
    Key(#[from] nostr_sdk::key::Error),
}

impl Setup {
    pub async fn run(&self, config_path: Option<PathBuf>) -> Result<String, SetupError> {
        let mut state = AppState::load_or_default(config_path)?;

        let generated = state.config.admin.key.is_empty();
        let admin_keys = if generated {
            let keys = Keys::generate();
            state.config.admin.key = keys.secret_key()?.to_secret_hex();
            keys
        } else {
            Keys::parse(&state.config.admin.key)?
        };

        for admin in &self.admins {
            if !state.config.admin.npubs.contains(admin) {
                state.config.admin.npubs.push(admin.clone());
            }
        }
        for relay in &self.relays {
            if !state.config.nostr.relays.contains(relay) {
                state.config.nostr.relays.push(relay.clone());
            }
        }

        state.save()?;

        let npub = admin_keys
            .public_key()
            .to_bech32()
            .unwrap_or_else(|_| admin_keys.public_key().to_hex());
        Ok(format!(
            "config written to {}\nadmin identity: {}{}\nwhitelisted admins: {}",
            state.path.display(),
            npub,
            if generated { " (new)" } else { "" },
            state.config.admin.npubs.len(),
        ))
    }
}
