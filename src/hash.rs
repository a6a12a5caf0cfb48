use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::group::enc_point;

/// Little-endian reduction of a 32-byte digest into a scalar.
pub fn scalar_from_hash(digest: &[u8]) -> Scalar {
    let mut wide = [0u8; 32];
    let take = digest.len().min(32);
    wide[..take].copy_from_slice(&digest[..take]);
    Scalar::from_bytes_mod_order(wide)
}

/// ei = sha256(Ui || uiHat || hiHat), the Fiat-Shamir challenge of a partial
/// re-encryption.
pub fn reencrypt_challenge(
    ui: &RistrettoPoint,
    ui_hat: &RistrettoPoint,
    hi_hat: &RistrettoPoint,
) -> Scalar {
    let mut h = Sha256::new();
    h.update(enc_point(ui));
    h.update(enc_point(ui_hat));
    h.update(enc_point(hi_hat));
    scalar_from_hash(&h.finalize())
}

/// E = sha256(Cs || U || Ubar || w || wBar || policy), binding a write to a policy.
pub fn write_challenge(
    cs: &[RistrettoPoint],
    u: &RistrettoPoint,
    ubar: &RistrettoPoint,
    w: &RistrettoPoint,
    wbar: &RistrettoPoint,
    policy_id: &[u8],
) -> Scalar {
    let mut h = Sha256::new();
    for c in cs {
        h.update(enc_point(c));
    }
    h.update(enc_point(u));
    h.update(enc_point(ubar));
    h.update(enc_point(w));
    h.update(enc_point(wbar));
    h.update(policy_id);
    scalar_from_hash(&h.finalize())
}

/// HKDF-SHA256 expansion into a 32-byte symmetric key.
pub fn derive_key(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; 32], Error> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm).map_err(|_| Error::Cipher)?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::G;

    #[test]
    fn test_scalar_from_hash_is_little_endian() {
        let mut digest = [0u8; 32];
        digest[0] = 5;
        assert_eq!(scalar_from_hash(&digest), Scalar::from(5u64));
    }

    #[test]
    fn test_reencrypt_challenge_depends_on_order() {
        let a = G * Scalar::from(1u64);
        let b = G * Scalar::from(2u64);
        let c = G * Scalar::from(3u64);
        assert_eq!(reencrypt_challenge(&a, &b, &c), reencrypt_challenge(&a, &b, &c));
        assert_ne!(reencrypt_challenge(&a, &b, &c), reencrypt_challenge(&b, &a, &c));
    }

    #[test]
    fn test_derive_key_domain_separation() {
        let k1 = derive_key(b"salt", b"ikm", b"a").unwrap();
        let k2 = derive_key(b"salt", b"ikm", b"b").unwrap();
        assert_ne!(k1, k2);
    }
}
