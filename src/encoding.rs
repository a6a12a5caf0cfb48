//! Embedding of symmetric keys into group elements.
//!
//! A point carries up to `EMBED_LEN` bytes inside its compressed encoding:
//! - byte 0: random, sign bit cleared
//! - byte 1: payload length
//! - bytes 2..2+len: payload
//! - remaining bytes: random, top bit of byte 31 cleared
//!
//! The free bytes are resampled until the encoding is a valid ristretto point.
//! Ristretto encodings are canonical, so compressing the point gives the same bytes back.

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use tracing::trace;

use crate::error::Error;
use crate::group::G;
use crate::randutil::{fill_random, random_scalar};

/// Payload bytes one point can hold.
pub const EMBED_LEN: usize = 29;

/// Upper bound on the number of points a single key may span.
pub const MAX_KEY_POINTS: usize = 64;

const EMBED_ATTEMPTS: usize = 1024;

/// Embed `data` into a single point. Fails instead of truncating.
pub fn embed(data: &[u8]) -> Result<RistrettoPoint, Error> {
    if data.len() > EMBED_LEN {
        return Err(Error::EmbedCapacity {
            len: data.len(),
            cap: EMBED_LEN,
        });
    }

    let mut bytes = [0u8; 32];
    for _ in 0..EMBED_ATTEMPTS {
        fill_random(&mut bytes);
        bytes[0] &= 0xfe;
        bytes[1] = data.len() as u8;
        bytes[2..2 + data.len()].copy_from_slice(data);
        bytes[31] &= 0x7f;
        if let Some(point) = CompressedRistretto(bytes).decompress() {
            return Ok(point);
        }
    }
    Err(Error::EmbedFailed)
}

/// Extract the payload of a point built by [`embed`].
pub fn embedded_data(point: &RistrettoPoint) -> Result<Vec<u8>, Error> {
    let bytes = point.compress().to_bytes();
    let len = bytes[1] as usize;
    if len > EMBED_LEN {
        return Err(Error::InvalidEmbedding);
    }
    Ok(bytes[2..2 + len].to_vec())
}

/// Encode `key` under the collective public key `x` with randomness `r`.
pub(crate) fn encode_key_with(
    r: &Scalar,
    x: &RistrettoPoint,
    key: &[u8],
) -> Result<(RistrettoPoint, Vec<RistrettoPoint>), Error> {
    if key.len() > EMBED_LEN * MAX_KEY_POINTS {
        return Err(Error::KeyTooLong(key.len()));
    }
    let c = x * r;
    let u = G * r;

    let cs = key
        .chunks(EMBED_LEN)
        .map(|chunk| embed(chunk).map(|kp| c + kp))
        .collect::<Result<Vec<_>, _>>()?;
    trace!(points = cs.len(), "encoded key");
    Ok((u, cs))
}

/// Used by a writer to encode a symmetric key under the LTS public key `x`.
///
/// Returns the ElGamal commit `U = r*G` and one point `C + K_k` per key chunk,
/// with `C = r*X`. Longer keys need more points.
pub fn encode_key(x: &RistrettoPoint, key: &[u8]) -> Result<(RistrettoPoint, Vec<RistrettoPoint>), Error> {
    encode_key_with(&random_scalar(), x, key)
}

/// Used by a reader to recover the symmetric key from the re-encrypted commit.
///
/// `xhat_enc = r*X + r*Xc` comes out of the re-encryption, `xc` is the
/// reader's private key; chunks are decoded in order.
pub fn decode_key(
    x: &RistrettoPoint,
    cs: &[RistrettoPoint],
    xhat_enc: &RistrettoPoint,
    xc: &Scalar,
) -> Result<Vec<u8>, Error> {
    let xhat_dec = x * (-xc);
    let xhat = xhat_enc + xhat_dec;

    let mut key = Vec::with_capacity(cs.len() * EMBED_LEN);
    for c in cs {
        let key_point = c - xhat;
        key.extend_from_slice(&embedded_data(&key_point)?);
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::randutil::random_bytes;

    #[test]
    fn test_embed_roundtrip_all_lengths() {
        for len in 0..=EMBED_LEN {
            let data: Vec<u8> = (0..len as u8).collect();
            let p = embed(&data).unwrap();
            assert_eq!(embedded_data(&p).unwrap(), data);
        }
    }

    #[test]
    fn test_embed_rejects_oversized_data() {
        let data = [7u8; EMBED_LEN + 1];
        assert!(matches!(
            embed(&data),
            Err(Error::EmbedCapacity { len: 30, cap: EMBED_LEN })
        ));
    }

    #[test]
    fn test_key_too_long() {
        let x = G * random_scalar();
        let key = vec![1u8; EMBED_LEN * MAX_KEY_POINTS + 1];
        assert!(matches!(encode_key(&x, &key), Err(Error::KeyTooLong(_))));
    }

    #[test]
    fn test_longest_key_roundtrip() {
        let x_secret = random_scalar();
        let x = G * x_secret;
        let reader = random_scalar();
        let xc = G * reader;

        let key: Vec<u8> = (0..EMBED_LEN * MAX_KEY_POINTS).map(|i| (i % 251) as u8).collect();
        let (u, cs) = encode_key(&x, &key).unwrap();
        assert_eq!(cs.len(), MAX_KEY_POINTS);
        let xhat_enc = u * x_secret + xc * x_secret;
        assert_eq!(decode_key(&x, &cs, &xhat_enc, &reader).unwrap(), key);
    }

    #[test]
    fn test_decode_with_direct_secret() {
        // Without any DKG: X = x*G, re-encrypted commit is x*U + x*Xc.
        let x_secret = random_scalar();
        let x = G * x_secret;
        let reader = random_scalar();
        let xc = G * reader;

        for len in [1usize, 16, 29, 30, 32, 64] {
            let key: Vec<u8> = (0..len).map(|i| i as u8 ^ 0x5a).collect();
            let (u, cs) = encode_key(&x, &key).unwrap();
            assert_eq!(cs.len(), len.div_ceil(EMBED_LEN));
            let xhat_enc = u * x_secret + xc * x_secret;
            assert_eq!(decode_key(&x, &cs, &xhat_enc, &reader).unwrap(), key);
        }
    }

    #[test]
    fn test_empty_key_has_no_points() {
        let x = G * random_scalar();
        let (_, cs) = encode_key(&x, &[]).unwrap();
        assert!(cs.is_empty());
        let k: [u8; 32] = random_bytes();
        let (_, cs) = encode_key(&x, &k).unwrap();
        assert_eq!(cs.len(), 2);
    }
}
