use std::path::PathBuf;

use nostr_sdk::Keys;
use url::Url;

use crate::app_config::AppState;

/// Everything the daemon needs to run, assembled by the CLI `start`
/// op before any task spawns.
#[derive(Debug)]
pub struct Config {
    /// the loaded vault file and its location
    pub app: AppState,
    /// keys unlocked at boot (plain entries plus passphrase-unlocked ones)
    pub unlocked_keys: Vec<(String, Keys)>,
    /// admin npubs merged in from `--admin` and `ADMIN_NPUBS`
    pub extra_admins: Vec<String>,
    /// `DATABASE_URL` override for the policy store
    pub database_url: Option<Url>,

    pub log_level: tracing::Level,
    /// directory for log files; stdout only when unset
    pub log_dir: Option<PathBuf>,
}
