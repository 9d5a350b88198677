/**
 * Cryptographic operations for the key vault.
 *  - Passphrase-derived encryption of stored secrets
 *  - Fixed on-disk layout shared with existing vault files
 */
pub mod crypto;
/**
 * The remote-signing wire protocol: encrypted JSON-RPC
 *  envelopes carried in kind-24133 relay events.
 */
pub mod nip46;
/**
 * The `bunker://` connection descriptor handed to
 *  admins and clients.
 */
pub mod uri;

pub mod prelude {
    pub use crate::crypto::{decrypt_secret, encrypt_secret, EncryptedSecret, VaultCryptoError};
    pub use crate::nip46::{Request, Response};
    pub use crate::uri::BunkerUri;
}
