use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use chrono::{DateTime, Utc};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::AppError;

const MAGIC: &[u8; 4] = b"MMBK";
const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const HEADER_LEN: usize = MAGIC.len() + 1 + 4 + SALT_LEN + NONCE_LEN;

pub const DEFAULT_PBKDF2_ROUNDS: u32 = 600_000;
// Largest round count accepted from a file header
const MAX_PBKDF2_ROUNDS: u32 = 10_000_000;

/// What goes inside the encrypted envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPayload {
    pub created_at: DateTime<Utc>,
    /// Configuration as saved on disk
    pub config_json: String,
    /// Raw storage file, when the backup includes it
    pub database: Option<Vec<u8>>,
}

/// Envelope header. Stored in clear and bound to the ciphertext as
/// associated data, so any edit to it fails authentication.
#[derive(Debug, Clone, PartialEq)]
struct Header {
    rounds: u32,
    salt: [u8; SALT_LEN],
    nonce: [u8; NONCE_LEN],
}

impl Header {
    fn generate(rounds: u32) -> Self {
        let mut rng = rand::thread_rng();
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);
        Self {
            rounds,
            salt,
            nonce,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&self.rounds.to_be_bytes());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.nonce);
        out
    }

    fn parse(bytes: &[u8]) -> Result<Self, AppError> {
        if bytes.len() < HEADER_LEN {
            return Err(AppError::InvalidBackup("file is too short".to_string()));
        }
        if &bytes[..MAGIC.len()] != MAGIC {
            return Err(AppError::InvalidBackup("not a mailmesh backup".to_string()));
        }
        let version = bytes[MAGIC.len()];
        if version != FORMAT_VERSION {
            return Err(AppError::InvalidBackup(format!(
                "unsupported format version {}",
                version
            )));
        }

        let mut offset = MAGIC.len() + 1;
        let mut rounds = [0u8; 4];
        rounds.copy_from_slice(&bytes[offset..offset + 4]);
        let rounds = u32::from_be_bytes(rounds);
        if rounds == 0 || rounds > MAX_PBKDF2_ROUNDS {
            return Err(AppError::InvalidBackup(format!(
                "implausible key derivation rounds {}",
                rounds
            )));
        }
        offset += 4;

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[offset..offset + SALT_LEN]);
        offset += SALT_LEN;

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[offset..offset + NONCE_LEN]);

        Ok(Self {
            rounds,
            salt,
            nonce,
        })
    }
}

fn derive_key(password: &str, salt: &[u8], rounds: u32) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, key.as_mut_slice());
    key
}

/// Serialize and encrypt a payload into a complete backup file.
///
/// Key derivation is deliberately slow; call from a blocking context.
pub fn seal(payload: &BackupPayload, password: &str, rounds: u32) -> Result<Vec<u8>, AppError> {
    let plaintext = Zeroizing::new(bincode::serialize(payload)?);
    let header = Header::generate(rounds);
    let header_bytes = header.to_bytes();

    let key = derive_key(password, &header.salt, header.rounds);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&header.nonce),
            Payload {
                msg: plaintext.as_slice(),
                aad: &header_bytes,
            },
        )
        .map_err(|e| AppError::CryptoError(e.to_string()))?;

    let mut out = header_bytes;
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Authenticate and decrypt a backup file.
///
/// A structurally broken file is `InvalidBackup`; a wrong password or any
/// tampering with header or body is `AuthenticationFailed`.
pub fn open(bytes: &[u8], password: &str) -> Result<BackupPayload, AppError> {
    let header = Header::parse(bytes)?;
    let (header_bytes, ciphertext) = bytes.split_at(HEADER_LEN);

    let key = derive_key(password, &header.salt, header.rounds);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(&header.nonce),
            Payload {
                msg: ciphertext,
                aad: header_bytes,
            },
        )
        .map(Zeroizing::new)
        .map_err(|_| AppError::AuthenticationFailed)?;

    bincode::deserialize(&plaintext)
        .map_err(|e| AppError::InvalidBackup(format!("unreadable payload: {}", e)))
}
