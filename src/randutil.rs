use curve25519_dalek::scalar::Scalar;

use rand::RngCore;

pub fn random_scalar() -> Scalar {
    let mut bytes = [0u8; 64];
    rand::rng().fill_bytes(&mut bytes);
    Scalar::from_bytes_mod_order_wide(&bytes)
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

pub fn fill_random(buf: &mut [u8]) {
    rand::rng().fill_bytes(buf);
}
