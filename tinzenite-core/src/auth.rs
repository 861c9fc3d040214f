//! Long-term identity and the mutual-authentication challenge.
//!
//! The on-disk record keeps cost-hardened hashes of the user name and
//! password plus a sealed blob holding the per-directory key material: an
//! ed25519 keypair and the 32-byte symmetric directory key. The blob is
//! sealed with XChaCha20-Poly1305 under a key derived from the password with
//! argon2 and a stored salt, so the record itself is safe to hand to a
//! joining peer that knows the password.
//!
//! A challenge is a uniformly random 63-bit integer, varint encoded and
//! sealed under the directory key with a fresh 24-byte nonce. The valid
//! answer is the successor, sealed under a new nonce. Producing any valid
//! ciphertext proves possession of the directory key, which is why an
//! unprompted challenge still authenticates its sender.

use std::fs;
use std::path::Path;

use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::new_identification;
use crate::messages::AuthenticationMessage;

pub const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;

/// Contents of `org/auth.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthRecord {
    /// Cost-hardened hash of the user name.
    pub user: String,
    pub dirname: String,
    pub dir_id: String,
    /// Cost-hardened hash of the password.
    pub passwd: String,
    /// Salt for deriving the blob-sealing key from the password, base64.
    pub salt: String,
    /// Sealed key blob, `nonce || ciphertext`, base64.
    pub secure: String,
}

/// The opened key material, never written in the clear.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyBlob {
    signing_key: String,
    directory_key: String,
}

pub struct Authenticator {
    record: AuthRecord,
    signing: SigningKey,
    directory_key: [u8; KEY_LEN],
}

impl Authenticator {
    /// Provision a fresh directory identity.
    pub fn create(dirname: &str, user: &str, password: &str) -> Result<Authenticator> {
        let signing = SigningKey::generate(&mut OsRng);
        let mut directory_key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut directory_key);

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let sealing_key = derive_key(password, &salt)?;

        let blob = serde_json::to_vec(&KeyBlob {
            signing_key: B64.encode(signing.to_bytes()),
            directory_key: B64.encode(directory_key),
        })?;
        let secure = seal(&sealing_key, &blob)?;

        let record = AuthRecord {
            user: password_hash(user)?,
            dirname: dirname.to_string(),
            dir_id: new_identification(),
            passwd: password_hash(password)?,
            salt: B64.encode(salt),
            secure: B64.encode(secure),
        };
        Ok(Authenticator {
            record,
            signing,
            directory_key,
        })
    }

    /// Open an existing record. The password must verify against the stored
    /// hash before the blob is unsealed.
    pub fn load(path: &Path, password: &str) -> Result<Authenticator> {
        let record: AuthRecord = serde_json::from_str(&fs::read_to_string(path)?)?;
        Self::from_record(record, password)
    }

    pub fn from_record(record: AuthRecord, password: &str) -> Result<Authenticator> {
        let parsed = PasswordHash::new(&record.passwd)
            .map_err(|e| Error::PasswordHash(e.to_string()))?;
        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_err()
        {
            return Err(Error::PasswordMismatch);
        }

        let salt = B64
            .decode(&record.salt)
            .map_err(|_| Error::EnvelopeOpen)?;
        let sealing_key = derive_key(password, &salt)?;
        let sealed = B64
            .decode(&record.secure)
            .map_err(|_| Error::EnvelopeOpen)?;
        let blob: KeyBlob = serde_json::from_slice(&open(&sealing_key, &sealed)?)?;

        let signing_bytes: [u8; KEY_LEN] = B64
            .decode(&blob.signing_key)
            .map_err(|_| Error::EnvelopeOpen)?
            .try_into()
            .map_err(|_| Error::EnvelopeOpen)?;
        let directory_key: [u8; KEY_LEN] = B64
            .decode(&blob.directory_key)
            .map_err(|_| Error::EnvelopeOpen)?
            .try_into()
            .map_err(|_| Error::EnvelopeOpen)?;

        Ok(Authenticator {
            record,
            signing: SigningKey::from_bytes(&signing_bytes),
            directory_key,
        })
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(&self.record)?)?;
        Ok(())
    }

    pub fn record(&self) -> &AuthRecord {
        &self.record
    }

    pub fn dir_id(&self) -> &str {
        &self.record.dir_id
    }

    pub fn dirname(&self) -> &str {
        &self.record.dirname
    }

    pub fn public_key(&self) -> ed25519_dalek::VerifyingKey {
        self.signing.verifying_key()
    }

    /// Draw a challenge. Returns the expected plain counter and the message
    /// to send.
    pub fn build_challenge(&self) -> Result<(u64, AuthenticationMessage)> {
        let number = OsRng.next_u64() >> 1;
        Ok((number, self.seal_counter(number)?))
    }

    /// Treat `msg` as an inbound challenge and produce the `n + 1` reply.
    /// Fails without revealing anything when the envelope does not open.
    pub fn answer_challenge(&self, msg: &AuthenticationMessage) -> Result<AuthenticationMessage> {
        let number = self.open_counter(msg)?;
        self.seal_counter(number + 1)
    }

    /// Whether `msg` is the valid reply to a challenge built for `expected`.
    pub fn verify_reply(&self, expected: u64, msg: &AuthenticationMessage) -> bool {
        match self.open_counter(msg) {
            Ok(number) => number == expected + 1,
            Err(_) => false,
        }
    }

    /// Seal an opaque payload for a blind store: `nonce || ciphertext`.
    pub fn seal_payload(&self, plain: &[u8]) -> Result<Vec<u8>> {
        seal(&self.directory_key, plain)
    }

    pub fn open_payload(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        open(&self.directory_key, sealed)
    }

    /// A detached handle on the directory key, for sealing large payloads
    /// off the engine thread.
    pub fn sealer(&self) -> Sealer {
        Sealer {
            key: self.directory_key,
        }
    }

    fn seal_counter(&self, number: u64) -> Result<AuthenticationMessage> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.directory_key));
        let encrypted = cipher
            .encrypt(XNonce::from_slice(&nonce), encode_varint(number).as_slice())
            .map_err(|_| Error::EnvelopeSeal)?;
        Ok(AuthenticationMessage {
            nonce: B64.encode(nonce),
            encrypted: B64.encode(encrypted),
        })
    }

    fn open_counter(&self, msg: &AuthenticationMessage) -> Result<u64> {
        let nonce = B64.decode(&msg.nonce).map_err(|_| Error::EnvelopeOpen)?;
        if nonce.len() != NONCE_LEN {
            return Err(Error::EnvelopeOpen);
        }
        let encrypted = B64
            .decode(&msg.encrypted)
            .map_err(|_| Error::EnvelopeOpen)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.directory_key));
        let plain = cipher
            .decrypt(XNonce::from_slice(&nonce), encrypted.as_slice())
            .map_err(|_| Error::EnvelopeOpen)?;
        decode_varint(&plain).ok_or(Error::EnvelopeOpen)
    }
}

/// Cloneable sealing handle; carries only the symmetric key.
#[derive(Clone)]
pub struct Sealer {
    key: [u8; KEY_LEN],
}

impl Sealer {
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        seal(&self.key, plain)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        open(&self.key, sealed)
    }
}

fn password_hash(input: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(input.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::PasswordHash(e.to_string()))
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| Error::PasswordHash(e.to_string()))?;
    Ok(key)
}

fn seal(key: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plain)
        .map_err(|_| Error::EnvelopeSeal)?;
    let mut out = nonce.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(Error::EnvelopeOpen);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::EnvelopeOpen)
}

/// Unsigned LEB128. The counter never exceeds 63 bits.
fn encode_varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

fn decode_varint(bytes: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            // Trailing garbage means a malformed payload.
            return if i + 1 == bytes.len() { Some(value) } else { None };
        }
        shift += 7;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> Authenticator {
        Authenticator::create("shared", "anna", "hunter2").unwrap()
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 42, 127, 128, 300, u64::MAX >> 1] {
            assert_eq!(decode_varint(&encode_varint(value)), Some(value));
        }
        assert_eq!(decode_varint(&[]), None);
        assert_eq!(decode_varint(&[0x80]), None);
    }

    #[test]
    fn challenge_reply_verifies() {
        let auth = authenticator();
        let (expected, challenge) = auth.build_challenge().unwrap();
        let reply = auth.answer_challenge(&challenge).unwrap();
        assert!(auth.verify_reply(expected, &reply));
        // A fresh nonce means the reply never equals the challenge.
        assert_ne!(reply, challenge);
    }

    #[test]
    fn reply_with_wrong_counter_is_rejected() {
        let auth = authenticator();
        let (expected, challenge) = auth.build_challenge().unwrap();
        // Replaying the challenge itself carries n, not n + 1.
        assert!(!auth.verify_reply(expected, &challenge));
    }

    #[test]
    fn foreign_key_cannot_answer() {
        let auth = authenticator();
        let outsider = Authenticator::create("shared", "eve", "hunter2").unwrap();
        let (_, challenge) = auth.build_challenge().unwrap();
        assert!(outsider.answer_challenge(&challenge).is_err());
    }

    #[test]
    fn record_round_trip_with_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        let auth = authenticator();
        auth.store(&path).unwrap();

        let loaded = Authenticator::load(&path, "hunter2").unwrap();
        assert_eq!(loaded.dir_id(), auth.dir_id());

        // The reloaded identity must answer challenges from the original.
        let (expected, challenge) = auth.build_challenge().unwrap();
        let reply = loaded.answer_challenge(&challenge).unwrap();
        assert!(auth.verify_reply(expected, &reply));
    }

    #[test]
    fn wrong_password_is_rejected_before_unsealing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        authenticator().store(&path).unwrap();
        assert!(matches!(
            Authenticator::load(&path, "wrong"),
            Err(Error::PasswordMismatch)
        ));
    }

    #[test]
    fn payload_seal_round_trip() {
        let auth = authenticator();
        let sealed = auth.seal_payload(b"file bytes").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"file bytes");
        assert_eq!(auth.open_payload(&sealed).unwrap(), b"file bytes");
    }
}
