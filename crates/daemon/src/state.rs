use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use nostr_sdk::prelude::*;
use tokio::sync::{mpsc, RwLock};
use ::url::Url;

use common::crypto::{decrypt_secret, encrypt_secret, VaultCryptoError};
use common::uri::BunkerUri;

use crate::app_config::{AppConfig, AppConfigError, AppState, StoredKey};
use crate::broker::{AclQuery, Broker};
use crate::database::models::Key;
use crate::database::{Database, DatabaseSetupError};
use crate::service_config::Config;

const DEFAULT_AUTH_HOST: &str = "0.0.0.0";
const DEFAULT_AUTH_PORT: u16 = 8080;

/// A key becoming live: the daemon control loop answers by spawning a
/// signer endpoint for it.
#[derive(Debug)]
pub struct KeyActivation {
    pub name: String,
    pub keys: Keys,
}

/// Receiver halves handed to the tasks that consume them.
pub struct StateChannels {
    pub acl_rx: mpsc::UnboundedReceiver<AclQuery>,
    pub key_rx: mpsc::UnboundedReceiver<KeyActivation>,
}

/// Main service state, shared by every component.
///
/// The vault file is the single owner of secret bytes; the active-key
/// map holds the unlocked subset and is written only from the control
/// path (boot, `unlock_key`, provisioning).
#[derive(Clone)]
pub struct State {
    database: Database,
    app: Arc<RwLock<AppState>>,
    admin_keys: Keys,
    admin_allowlist: Arc<Vec<PublicKey>>,
    active_keys: Arc<RwLock<HashMap<String, Keys>>>,
    broker: Arc<Broker>,
    key_tx: mpsc::UnboundedSender<KeyActivation>,
}

impl State {
    pub async fn from_config(config: &Config) -> Result<(Self, StateChannels), StateSetupError> {
        let mut app = config.app.clone();

        let database_url = resolve_database_url(config)?;
        tracing::info!("policy store: {}", database_url);
        let database = Database::connect(&database_url).await?;

        // the admin identity is generated once and kept in the config
        let admin_keys = if app.config.admin.key.is_empty() {
            let keys = Keys::generate();
            app.config.admin.key = keys.secret_key()?.to_secret_hex();
            app.save()?;
            tracing::info!("generated new admin identity");
            keys
        } else {
            Keys::parse(&app.config.admin.key)?
        };

        let mut allowlist = Vec::new();
        for npub in app
            .config
            .admin
            .npubs
            .iter()
            .chain(config.extra_admins.iter())
        {
            match parse_pubkey(npub) {
                Some(pk) => {
                    if !allowlist.contains(&pk) {
                        allowlist.push(pk);
                    }
                }
                None => tracing::warn!("ignoring invalid admin pubkey: {}", npub),
            }
        }
        if allowlist.is_empty() {
            tracing::warn!("admin allow-list is empty; management RPCs will all be rejected");
        }

        let (acl_tx, acl_rx) = mpsc::unbounded_channel();
        let (key_tx, key_rx) = mpsc::unbounded_channel();
        let broker = Broker::new(database.clone(), app.config.base_url.clone(), acl_tx);

        let state = Self {
            database,
            app: Arc::new(RwLock::new(app)),
            admin_keys,
            admin_allowlist: Arc::new(allowlist),
            active_keys: Arc::new(RwLock::new(HashMap::new())),
            broker,
            key_tx,
        };

        Ok((state, StateChannels { acl_rx, key_rx }))
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn admin_keys(&self) -> &Keys {
        &self.admin_keys
    }

    pub fn admin_allowlist(&self) -> &[PublicKey] {
        &self.admin_allowlist
    }

    pub fn is_admin(&self, pubkey: &PublicKey) -> bool {
        self.admin_allowlist.contains(pubkey)
    }

    pub async fn app_config(&self) -> AppConfig {
        self.app.read().await.config.clone()
    }

    pub async fn connection_file(&self) -> std::path::PathBuf {
        self.app.read().await.connection_file()
    }

    pub async fn relays(&self) -> Vec<String> {
        self.app.read().await.config.nostr.relays.clone()
    }

    pub async fn admin_relays(&self) -> Vec<String> {
        let app = self.app.read().await;
        if app.config.admin.admin_relays.is_empty() {
            app.config.nostr.relays.clone()
        } else {
            app.config.admin.admin_relays.clone()
        }
    }

    pub async fn base_url(&self) -> Option<String> {
        self.app.read().await.config.base_url.clone()
    }

    pub async fn listen_addr(&self) -> SocketAddr {
        let app = self.app.read().await;
        let host = app
            .config
            .auth_host
            .clone()
            .unwrap_or_else(|| DEFAULT_AUTH_HOST.to_string());
        let port = app.config.auth_port.unwrap_or(DEFAULT_AUTH_PORT);
        SocketAddr::from_str(&format!("{}:{}", host, port))
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)))
    }

    pub async fn stored_key(&self, name: &str) -> Option<StoredKey> {
        self.app.read().await.config.keys.get(name).cloned()
    }

    /// The descriptor a client uses to reach one of our endpoints.
    pub async fn bunker_uri(&self, pubkey: &PublicKey, admin: bool) -> BunkerUri {
        let relays = if admin {
            self.admin_relays().await
        } else {
            self.relays().await
        };
        let mut uri = BunkerUri::new(pubkey.to_hex(), relays);
        if admin {
            if let Some(secret) = self.app.read().await.config.admin.secret.clone() {
                uri = uri.with_secret(secret);
            }
        }
        uri
    }

    // --- active keys -----------------------------------------------------

    pub async fn active_key(&self, name: &str) -> Option<Keys> {
        self.active_keys.read().await.get(name).cloned()
    }

    pub async fn active_key_names(&self) -> Vec<String> {
        self.active_keys.read().await.keys().cloned().collect()
    }

    /// Make an unlocked key live and ask the control loop to bring up
    /// its endpoint. Re-activating a live key is a no-op.
    pub async fn load_active_key(&self, name: &str, keys: Keys) {
        {
            let mut active = self.active_keys.write().await;
            if active.contains_key(name) {
                return;
            }
            active.insert(name.to_string(), keys.clone());
        }
        let _ = self.key_tx.send(KeyActivation {
            name: name.to_string(),
            keys,
        });
    }

    /// Drop all unlocked secrets. Called once on shutdown.
    pub async fn clear_active_keys(&self) {
        self.active_keys.write().await.clear();
    }

    /// Decrypt a stored key with the admin passphrase and make it live.
    pub async fn unlock_key(&self, name: &str, passphrase: &str) -> Result<Keys, UnlockKeyError> {
        let stored = self
            .stored_key(name)
            .await
            .ok_or_else(|| UnlockKeyError::UnknownKey(name.to_string()))?;

        let keys = match stored {
            StoredKey::Plain { key } => Keys::parse(&key)?,
            StoredKey::Encrypted(entry) => {
                let secret = decrypt_secret(&entry, passphrase)?;
                Keys::parse(&secret)?
            }
        };

        self.load_active_key(name, keys.clone()).await;
        Ok(keys)
    }

    /// Create or import a stored key, persist it to the vault file,
    /// record its Key row, and make it live.
    ///
    /// With a passphrase the entry is sealed; otherwise it is stored
    /// plain. With an `nsec` the key is imported; otherwise minted.
    pub async fn add_stored_key(
        &self,
        name: &str,
        nsec: Option<&str>,
        passphrase: Option<&str>,
    ) -> Result<Keys, AddKeyError> {
        let keys = match nsec {
            Some(nsec) => Keys::parse(nsec)?,
            None => Keys::generate(),
        };
        let secret_hex = keys.secret_key()?.to_secret_hex();

        let stored = match passphrase {
            Some(passphrase) if !passphrase.is_empty() => {
                StoredKey::Encrypted(encrypt_secret(&secret_hex, passphrase)?)
            }
            _ => StoredKey::Plain { key: secret_hex },
        };

        {
            let mut app = self.app.write().await;
            app.add_key(name, stored)?;
            app.save()?;
        }

        Key::create(name, Some(&keys.public_key().to_hex()), self.database())
            .await
            .map_err(AddKeyError::Database)?;

        self.load_active_key(name, keys.clone()).await;
        Ok(keys)
    }
}

fn resolve_database_url(config: &Config) -> Result<Url, StateSetupError> {
    if let Some(url) = &config.database_url {
        return Ok(url.clone());
    }
    if let Some(database) = &config.app.config.database {
        let raw = if database.contains("://") {
            database.clone()
        } else {
            format!("sqlite://{}", database)
        };
        return Url::parse(&raw).map_err(|_| StateSetupError::InvalidDatabaseUrl);
    }
    let default = config
        .app
        .path
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join("bunker.db");
    Url::parse(&format!("sqlite://{}?mode=rwc", default.display()))
        .map_err(|_| StateSetupError::InvalidDatabaseUrl)
}

fn parse_pubkey(s: &str) -> Option<PublicKey> {
    PublicKey::from_bech32(s)
        .or_else(|_| PublicKey::from_hex(s))
        .ok()
}

#[derive(Debug, thiserror::Error)]
pub enum StateSetupError {
    #[error("database setup error: {0}")]
    Database(#[from] DatabaseSetupError),
    #[error("invalid database URL")]
    InvalidDatabaseUrl,
    #[error("bad admin key in config: {0}")]
    BadAdminKey(#[from] nostr_sdk::key::Error),
    #[error("vault file error: {0}")]
    Config(#[from] AppConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum UnlockKeyError {
    #[error("no stored key named '{0}'")]
    UnknownKey(String),
    #[error(transparent)]
    Crypto(#[from] VaultCryptoError),
    #[error("stored secret is not a valid key: {0}")]
    BadSecret(#[from] nostr_sdk::key::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum AddKeyError {
    #[error(transparent)]
    Config(#[from] AppConfigError),
    #[error("invalid nsec: {0}")]
    BadSecret(#[from] nostr_sdk::key::Error),
    #[error(transparent)]
    Crypto(#[from] VaultCryptoError),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}
