//! Identification allocation.
//!
//! An identification is the first 16 hex characters of a SHA-256 digest over
//! 32 random bytes. It is allocated when an object is first observed and is
//! stable for the object's lifetime.

use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

pub const IDENTIFICATION_LEN: usize = 16;

/// Well-known identification under which the whole model is requested.
pub const MODEL_IDENTIFICATION: &str = "model";

/// Well-known identification under which the auth record is requested.
pub const AUTH_IDENTIFICATION: &str = "auth";

pub fn new_identification() -> String {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let digest = Sha256::digest(seed);
    hex::encode(digest)[..IDENTIFICATION_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identification_shape() {
        let id = new_identification();
        assert_eq!(id.len(), IDENTIFICATION_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identifications_are_distinct() {
        let a = new_identification();
        let b = new_identification();
        assert_ne!(a, b);
    }
}
