use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// PBKDF2-HMAC-SHA256 iteration count. Fixed: existing vault files
/// were written with this value.
const KDF_ITERATIONS: u32 = 100_000;
/// Size of the derived AES key in bytes
const DERIVED_KEY_SIZE: usize = 32;
/// Size of the per-secret salt in bytes
const SALT_SIZE: usize = 16;
/// Size of the AES-CBC IV in bytes
const IV_SIZE: usize = 16;

/// Errors that can occur while sealing or opening a vault entry
#[derive(Debug, thiserror::Error)]
pub enum VaultCryptoError {
    /// Padding or key mismatch, i.e. the passphrase is wrong
    #[error("decryption failed")]
    DecryptionFailed,
    /// Either hex field does not decode or is too short
    #[error("corrupt vault entry")]
    CorruptEntry,
    #[error("failed to gather randomness: {0}")]
    Rng(#[from] getrandom::Error),
}

/// A passphrase-encrypted secret as it appears in the vault file.
///
/// `iv` is the hex-encoded CBC IV; `data` is the hex-encoded
/// concatenation of the KDF salt and the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub iv: String,
    pub data: String,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; DERIVED_KEY_SIZE] {
    let mut key = [0u8; DERIVED_KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, KDF_ITERATIONS, &mut key);
    key
}

/// Encrypt a plaintext secret under a passphrase.
///
/// A fresh 16-byte salt and 16-byte IV are drawn for every call, so
/// encrypting the same secret twice yields unrelated ciphertexts.
pub fn encrypt_secret(
    plaintext: &str,
    passphrase: &str,
) -> Result<EncryptedSecret, VaultCryptoError> {
    let mut salt = [0u8; SALT_SIZE];
    getrandom::getrandom(&mut salt)?;
    let mut iv = [0u8; IV_SIZE];
    getrandom::getrandom(&mut iv)?;

    let mut key = derive_key(passphrase, &salt);
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    key.zeroize();

    let mut data = Vec::with_capacity(SALT_SIZE + ciphertext.len());
    data.extend_from_slice(&salt);
    data.extend_from_slice(&ciphertext);

    Ok(EncryptedSecret {
        iv: hex::encode(iv),
        data: hex::encode(data),
    })
}

/// Decrypt a vault entry with a passphrase, returning the plaintext secret.
///
/// # Errors
///
/// - [`VaultCryptoError::CorruptEntry`] if either field is not valid hex
///   or the payload is too short to contain a salt
/// - [`VaultCryptoError::DecryptionFailed`] if the padding check fails,
///   which is how a wrong passphrase presents
pub fn decrypt_secret(
    entry: &EncryptedSecret,
    passphrase: &str,
) -> Result<String, VaultCryptoError> {
    let iv = hex::decode(&entry.iv).map_err(|_| VaultCryptoError::CorruptEntry)?;
    let data = hex::decode(&entry.data).map_err(|_| VaultCryptoError::CorruptEntry)?;

    if iv.len() != IV_SIZE || data.len() < SALT_SIZE {
        return Err(VaultCryptoError::CorruptEntry);
    }

    let (salt, ciphertext) = data.split_at(SALT_SIZE);
    let mut key = derive_key(passphrase, salt);
    let iv_arr: [u8; IV_SIZE] = iv.try_into().map_err(|_| VaultCryptoError::CorruptEntry)?;

    let plaintext = Aes256CbcDec::new(&key.into(), &iv_arr.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| VaultCryptoError::DecryptionFailed);
    key.zeroize();

    let mut plaintext = plaintext?;
    let out = String::from_utf8(plaintext.clone()).map_err(|_| VaultCryptoError::DecryptionFailed);
    plaintext.zeroize();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let entry = encrypt_secret("nsec1examplesecret", "correct horse").unwrap();
        let plaintext = decrypt_secret(&entry, "correct horse").unwrap();
        assert_eq!(plaintext, "nsec1examplesecret");
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let entry = encrypt_secret("nsec1examplesecret", "correct horse").unwrap();
        let result = decrypt_secret(&entry, "battery staple");
        assert!(matches!(result, Err(VaultCryptoError::DecryptionFailed)));
    }

    #[test]
    fn test_fresh_salt_and_iv_per_call() {
        let a = encrypt_secret("same secret", "pw").unwrap();
        let b = encrypt_secret("same secret", "pw").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_malformed_hex_is_corrupt() {
        let entry = EncryptedSecret {
            iv: "not hex".to_string(),
            data: "00ff".to_string(),
        };
        assert!(matches!(
            decrypt_secret(&entry, "pw"),
            Err(VaultCryptoError::CorruptEntry)
        ));

        let entry = EncryptedSecret {
            iv: hex::encode([0u8; 16]),
            data: "zz".to_string(),
        };
        assert!(matches!(
            decrypt_secret(&entry, "pw"),
            Err(VaultCryptoError::CorruptEntry)
        ));
    }

    #[test]
    fn test_short_payload_is_corrupt() {
        // fewer than 16 bytes decoded cannot hold the salt
        let entry = EncryptedSecret {
            iv: hex::encode([0u8; 16]),
            data: hex::encode([0u8; 8]),
        };
        assert!(matches!(
            decrypt_secret(&entry, "pw"),
            Err(VaultCryptoError::CorruptEntry)
        ));
    }

    #[test]
    fn test_layout_salt_prefix() {
        let entry = encrypt_secret("abc", "pw").unwrap();
        let data = hex::decode(&entry.data).unwrap();
        // 16-byte salt followed by at least one AES block
        assert!(data.len() >= 16 + 16);
        assert_eq!(hex::decode(&entry.iv).unwrap().len(), 16);
    }
}
