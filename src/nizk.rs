use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;

use crate::group::G;
use crate::hash::reencrypt_challenge;
use crate::randutil::random_scalar;
use crate::shamir::{PubPoly, PubShare};
use crate::types::{PartialReply, SharedSecret};

/// Ui := V*U + V*Xc, the partial re-encryption of node `i`.
pub fn get_ui(u: &RistrettoPoint, xc: &RistrettoPoint, v: &Scalar, i: u32) -> PubShare {
    PubShare {
        i,
        v: u * v + xc * v,
    }
}

/// Partial re-encryption with a proof that it uses the same V as the public
/// share committed at index i:
/// - uiHat := si*(U + Xc), hiHat := si*G
/// - ei := H(Ui, uiHat, hiHat), fi := si + ei*V
pub fn generate_partial(shared: &SharedSecret, u: &RistrettoPoint, xc: &RistrettoPoint) -> PartialReply {
    let ui = get_ui(u, xc, &shared.v, shared.index);

    let si = random_scalar();
    let ui_hat = (u + xc) * si;
    let hi_hat = G * si;
    let ei = reencrypt_challenge(&ui.v, &ui_hat, &hi_hat);
    let fi = si + ei * shared.v;

    PartialReply { ui, ei, fi }
}

/// Recompute uiHat and hiHat from the reply and the public polynomial and check
/// that they hash to ei.
pub fn verify_partial(poly: &PubPoly, u: &RistrettoPoint, xc: &RistrettoPoint, reply: &PartialReply) -> bool {
    let i = reply.ui.i;
    let ufi = (u + xc) * reply.fi;
    let uei = reply.ui.v * (-reply.ei);
    let ui_hat = ufi + uei;

    let gfi = G * reply.fi;
    let gxi = poly.eval(i).v;
    let hi_hat = gfi + gxi * (-reply.ei);

    reencrypt_challenge(&reply.ui.v, &ui_hat, &hi_hat) == reply.ei
}
