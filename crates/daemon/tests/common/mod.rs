//! Shared test utilities for policy-store tests
#![allow(dead_code)]

use tempfile::TempDir;
use url::Url;

use bunker_daemon::database::Database;

/// Set up a fresh file-backed store in a scratch directory.
pub async fn setup_db() -> (Database, TempDir) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let url = Url::parse(&format!("sqlite://{}?mode=rwc", path.display())).unwrap();
    let db = Database::connect(&url).await.unwrap();
    (db, dir)
}

/// A deterministic fake client pubkey (hex).
pub fn client_pubkey(tag: u8) -> String {
    hex::encode([tag; 32])
}
