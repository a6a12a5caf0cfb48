// Symmetric sealing of the document a write protects.
//
// The embedded key is arbitrary-length key material; the AES-256-GCM key is
// derived from it with HKDF so any key length works.

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::hash::derive_key;
use crate::randutil::random_bytes;

const SEAL_SALT: &[u8] = b"calypso::document";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedDocument {
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm, Error> {
    let k = derive_key(SEAL_SALT, key, b"aes-256-gcm")?;
    Aes256Gcm::new_from_slice(&k).map_err(|_| Error::Cipher)
}

pub fn seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<SealedDocument, Error> {
    let nonce: [u8; 12] = random_bytes();
    let ciphertext = cipher(key)?
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::Cipher)?;
    Ok(SealedDocument { nonce, ciphertext })
}

pub fn open(key: &[u8], sealed: &SealedDocument, aad: &[u8]) -> Result<Vec<u8>, Error> {
    cipher(key)?
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            Payload {
                msg: &sealed.ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::Cipher)
}
