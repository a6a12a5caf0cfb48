use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;

use crate::error::Error;

/// Base point G of the group.
pub const G: RistrettoPoint = RISTRETTO_BASEPOINT_POINT;

/// Compressed ristretto encoding, as carried in messages.
pub type PointBytes = [u8; 32];
pub type ScalarBytes = [u8; 32];

pub fn enc_point(p: &RistrettoPoint) -> PointBytes {
    p.compress().to_bytes()
}

pub fn dec_point(bytes: &PointBytes) -> Result<RistrettoPoint, Error> {
    CompressedRistretto(*bytes)
        .decompress()
        .ok_or(Error::InvalidPoint)
}

pub fn enc_scalar(s: &Scalar) -> ScalarBytes {
    s.to_bytes()
}

/// Scalars on the wire must be canonical.
pub fn dec_scalar(bytes: &ScalarBytes) -> Result<Scalar, Error> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(*bytes)).ok_or(Error::InvalidScalar)
}

/// Share index `i` is evaluated at x = i + 1, so that x = 0 stays the secret.
pub fn scalar_from_index(i: u32) -> Scalar {
    Scalar::from(i as u64 + 1)
}

/// Byzantine threshold for a roster of `n` nodes: n - floor((n-1)/3).
pub fn byzantine_threshold(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    n - (n - 1) / 3
}

pub fn point_list_bytes(points: &[RistrettoPoint]) -> Vec<PointBytes> {
    points.iter().map(enc_point).collect()
}

pub fn point_list(bytes: &[PointBytes]) -> Result<Vec<RistrettoPoint>, Error> {
    bytes.iter().map(dec_point).collect()
}
