use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use common::crypto::EncryptedSecret;

/// A named entry in the vault file: either passphrase-encrypted or
/// stored plain. Exactly one of the two forms, enforced by the
/// untagged representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredKey {
    Encrypted(EncryptedSecret),
    Plain { key: String },
}

impl StoredKey {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, StoredKey::Encrypted(_))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NostrConfig {
    #[serde(default)]
    pub relays: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConfig {
    /// npubs allowed to invoke management RPCs
    #[serde(default)]
    pub npubs: Vec<String>,
    /// relays the admin channel listens on
    #[serde(default)]
    pub admin_relays: Vec<String>,
    /// the bunker's own admin identity, hex secret key
    #[serde(default)]
    pub key: String,
    /// optional connect secret baked into the descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default)]
    pub notify_admins_on_boot: bool,
}

/// Per-domain provisioning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainConfig {
    /// path of the public name directory file (NIP-05 JSON)
    pub directory: PathBuf,
    /// relays advertised for names in this domain; falls back to the
    /// bunker relays when empty
    #[serde(default)]
    pub relays: Vec<String>,
    /// optional wallet provisioning endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_service: Option<Url>,
    /// optional public-name (LN address) registration endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_service: Option<Url>,
}

/// The configuration and vault file, one JSON document.
///
/// Secret key material only ever appears here (encrypted or plain);
/// everything else in the system references keys by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub nostr: NostrConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<PathBuf>,
    #[serde(default)]
    pub keys: BTreeMap<String, StoredKey>,
    #[serde(default)]
    pub domains: BTreeMap<String, DomainConfig>,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum AppConfigError {
    #[error("vault file unreadable at {0}: {1}")]
    Unreadable(PathBuf, std::io::Error),
    #[error("vault file is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("failed to write vault file: {0}")]
    WriteFailed(std::io::Error),
    #[error("a key named '{0}' already exists")]
    DuplicateKey(String),
}

/// The on-disk application state: the parsed config plus where it
/// came from, so saves land in the same place.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub path: PathBuf,
}

impl AppState {
    /// Default config location: `$HOME/.bunker.json`, falling back to
    /// the working directory.
    pub fn default_path() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bunker.json")
    }

    /// Load the vault file. An unreadable file is fatal at boot; a
    /// missing file is only acceptable for `setup`, which uses
    /// [`AppState::load_or_default`].
    pub fn load(path: Option<PathBuf>) -> Result<Self, AppConfigError> {
        let path = path.unwrap_or_else(Self::default_path);
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| AppConfigError::Unreadable(path.clone(), e))?;
        let config = serde_json::from_str(&raw)?;
        Ok(Self { config, path })
    }

    pub fn load_or_default(path: Option<PathBuf>) -> Result<Self, AppConfigError> {
        let path = path.unwrap_or_else(Self::default_path);
        if path.exists() {
            Self::load(Some(path))
        } else {
            Ok(Self {
                config: AppConfig::default(),
                path,
            })
        }
    }

    pub fn save(&self) -> Result<(), AppConfigError> {
        let raw = serde_json::to_string_pretty(&self.config)?;
        std::fs::write(&self.path, raw).map_err(AppConfigError::WriteFailed)?;
        Ok(())
    }

    /// Where the connection descriptor is emitted: `connection.txt`
    /// next to the config file.
    pub fn connection_file(&self) -> PathBuf {
        self.path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("connection.txt")
    }

    pub fn add_key(&mut self, name: &str, key: StoredKey) -> Result<(), AppConfigError> {
        if self.config.keys.contains_key(name) {
            return Err(AppConfigError::DuplicateKey(name.to_string()));
        }
        self.config.keys.insert(name.to_string(), key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_key_forms() {
        let encrypted: StoredKey =
            serde_json::from_str(r#"{"iv":"00ff","data":"aabb"}"#).unwrap();
        assert!(encrypted.is_encrypted());

        let plain: StoredKey = serde_json::from_str(r#"{"key":"deadbeef"}"#).unwrap();
        assert!(!plain.is_encrypted());
    }

    #[test]
    fn test_config_round_trip() {
        let mut state = AppState {
            config: AppConfig::default(),
            path: PathBuf::from("/tmp/unused"),
        };
        state.config.nostr.relays.push("wss://relay.example".to_string());
        state.config.admin.npubs.push("npub1xyz".to_string());
        state
            .add_key(
                "alice",
                StoredKey::Plain {
                    key: "aa".repeat(32),
                },
            )
            .unwrap();

        let raw = serde_json::to_string(&state.config).unwrap();
        // external field names are fixed by existing deployments
        assert!(raw.contains("adminRelays"));
        assert!(raw.contains("notifyAdminsOnBoot"));

        let parsed: AppConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.keys.len(), 1);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut state = AppState {
            config: AppConfig::default(),
            path: PathBuf::from("/tmp/unused"),
        };
        state
            .add_key("a", StoredKey::Plain { key: "00".into() })
            .unwrap();
        assert!(matches!(
            state.add_key("a", StoredKey::Plain { key: "11".into() }),
            Err(AppConfigError::DuplicateKey(_))
        ));
    }
}
