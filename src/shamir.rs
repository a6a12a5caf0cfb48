use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::group::scalar_from_index;
use crate::randutil::random_scalar;

/// Secret polynomial of degree t-1, represented by coefficients [c0, c1, ..., c(t-1)].
#[derive(Clone)]
pub struct PriPoly {
    pub coeffs: Vec<Scalar>,
}

/// Private share f(i+1) held by node `i`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriShare {
    pub i: u32,
    pub v: Scalar,
}

/// Public share v = f(i+1)*B.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubShare {
    pub i: u32,
    pub v: RistrettoPoint,
}

/// Commitments to the coefficients of a secret polynomial.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubPoly {
    pub base: RistrettoPoint,
    pub commits: Vec<RistrettoPoint>,
}

impl PriPoly {
    /// Random polynomial with `t` coefficients and chosen constant term.
    pub fn random(t: usize, secret: Scalar) -> Self {
        let mut coeffs = Vec::with_capacity(t.max(1));
        coeffs.push(secret);
        for _ in 1..t {
            coeffs.push(random_scalar());
        }
        PriPoly { coeffs }
    }

    pub fn secret(&self) -> Scalar {
        self.coeffs[0]
    }

    pub fn threshold(&self) -> usize {
        self.coeffs.len()
    }

    pub fn eval(&self, i: u32) -> PriShare {
        let x = scalar_from_index(i);
        let mut acc = Scalar::ZERO;
        for c in self.coeffs.iter().rev() {
            acc = acc * x + c;
        }
        PriShare { i, v: acc }
    }

    pub fn commit(&self, base: &RistrettoPoint) -> PubPoly {
        PubPoly {
            base: *base,
            commits: self.coeffs.iter().map(|c| base * c).collect(),
        }
    }
}

impl PubPoly {
    pub fn new(base: RistrettoPoint, commits: Vec<RistrettoPoint>) -> Self {
        PubPoly { base, commits }
    }

    /// Public commitment to the shared secret.
    pub fn commit(&self) -> RistrettoPoint {
        self.commits
            .first()
            .copied()
            .unwrap_or_else(RistrettoPoint::identity)
    }

    pub fn threshold(&self) -> usize {
        self.commits.len()
    }

    pub fn eval(&self, i: u32) -> PubShare {
        let x = scalar_from_index(i);
        let mut acc = RistrettoPoint::identity();
        for c in self.commits.iter().rev() {
            acc = acc * x + c;
        }
        PubShare { i, v: acc }
    }

    /// Pointwise sum of two polynomials with the same base and threshold.
    pub fn add(&self, other: &PubPoly) -> Option<PubPoly> {
        if self.base != other.base || self.commits.len() != other.commits.len() {
            return None;
        }
        let commits = self
            .commits
            .iter()
            .zip(&other.commits)
            .map(|(a, b)| a + b)
            .collect();
        Some(PubPoly {
            base: self.base,
            commits,
        })
    }

    /// Whether `share` is an evaluation of the committed polynomial.
    pub fn check(&self, share: &PriShare) -> bool {
        self.eval(share.i).v == self.base * share.v
    }
}

/// Lagrange coefficient at x = 0 for x_i among `xs`: Π_{k != i} x_k / (x_k - x_i)
pub fn lagrange_coeff(x_i: &Scalar, xs: &[Scalar]) -> Scalar {
    let mut num = Scalar::ONE;
    let mut den = Scalar::ONE;
    for x_k in xs {
        if x_k == x_i {
            continue;
        }
        num *= x_k;
        den *= x_k - x_i;
    }
    num * den.invert()
}

/// First `t` distinct in-range indices, in ascending order of appearance.
fn pick_indices<I>(indices: I, t: usize, n: usize) -> Result<Vec<(usize, u32)>, Error>
where
    I: Iterator<Item = (usize, Option<u32>)>,
{
    let mut picked: Vec<(usize, u32)> = Vec::with_capacity(t);
    for (pos, i) in indices {
        let Some(i) = i else { continue };
        if i as usize >= n || picked.iter().any(|(_, j)| *j == i) {
            continue;
        }
        picked.push((pos, i));
        if picked.len() == t {
            return Ok(picked);
        }
    }
    Err(Error::InsufficientShares {
        got: picked.len(),
        need: t,
    })
}

/// Recover the commitment f(0)*B from at least `t` public shares.
pub fn recover_commit(shares: &[Option<PubShare>], t: usize, n: usize) -> Result<RistrettoPoint, Error> {
    let picked = pick_indices(
        shares.iter().enumerate().map(|(pos, s)| (pos, s.as_ref().map(|s| s.i))),
        t,
        n,
    )?;
    let xs: Vec<Scalar> = picked.iter().map(|(_, i)| scalar_from_index(*i)).collect();

    let mut acc = RistrettoPoint::identity();
    for ((pos, _), x_i) in picked.iter().zip(&xs) {
        if let Some(share) = &shares[*pos] {
            acc += share.v * lagrange_coeff(x_i, &xs);
        }
    }
    Ok(acc)
}

/// Recover the secret f(0) from at least `t` private shares.
pub fn recover_secret(shares: &[Option<PriShare>], t: usize, n: usize) -> Result<Scalar, Error> {
    let picked = pick_indices(
        shares.iter().enumerate().map(|(pos, s)| (pos, s.as_ref().map(|s| s.i))),
        t,
        n,
    )?;
    let xs: Vec<Scalar> = picked.iter().map(|(_, i)| scalar_from_index(*i)).collect();

    let mut acc = Scalar::ZERO;
    for ((pos, _), x_i) in picked.iter().zip(&xs) {
        if let Some(share) = &shares[*pos] {
            acc += share.v * lagrange_coeff(x_i, &xs);
        }
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::G;

    #[test]
    fn test_recover_secret_from_any_t_shares() {
        let (t, n) = (3, 5);
        let secret = random_scalar();
        let poly = PriPoly::random(t, secret);
        let shares: Vec<Option<PriShare>> = (0..n as u32).map(|i| Some(poly.eval(i))).collect();

        assert_eq!(recover_secret(&shares, t, n).unwrap(), secret);

        let mut sparse = shares.clone();
        sparse[0] = None;
        sparse[2] = None;
        assert_eq!(recover_secret(&sparse, t, n).unwrap(), secret);
    }

    #[test]
    fn test_recover_commit_matches_public_key() {
        let (t, n) = (4, 5);
        let secret = random_scalar();
        let poly = PriPoly::random(t, secret);
        let pub_poly = poly.commit(&G);
        let shares: Vec<Option<PubShare>> = (0..n as u32)
            .map(|i| Some(pub_poly.eval(i)))
            .collect();

        assert_eq!(recover_commit(&shares, t, n).unwrap(), G * secret);
        assert_eq!(pub_poly.commit(), G * secret);
    }

    #[test]
    fn test_recover_commit_not_enough_shares() {
        let poly = PriPoly::random(3, random_scalar()).commit(&G);
        let shares = vec![Some(poly.eval(0)), None, Some(poly.eval(2))];
        let err = recover_commit(&shares, 3, 3).unwrap_err();
        assert!(matches!(err, Error::InsufficientShares { got: 2, need: 3 }));
    }

    #[test]
    fn test_duplicate_and_out_of_range_shares_ignored() {
        let poly = PriPoly::random(2, random_scalar()).commit(&G);
        let shares = vec![
            Some(poly.eval(0)),
            Some(poly.eval(0)),
            Some(poly.eval(9)),
        ];
        assert!(recover_commit(&shares, 2, 3).is_err());
    }

    #[test]
    fn test_pub_poly_check_and_add() {
        let a = PriPoly::random(3, random_scalar());
        let b = PriPoly::random(3, random_scalar());
        let pa = a.commit(&G);
        let pb = b.commit(&G);

        assert!(pa.check(&a.eval(4)));
        assert!(!pa.check(&b.eval(4)));

        let sum = pa.add(&pb).unwrap();
        let share = PriShare {
            i: 4,
            v: a.eval(4).v + b.eval(4).v,
        };
        assert!(sum.check(&share));
        assert!(pa.add(&PriPoly::random(2, Scalar::ONE).commit(&G)).is_none());
    }

    #[test]
    fn test_lagrange_two_points() {
        // x = {1, 2}: λ_1 = 2, λ_2 = -1
        let xs = [Scalar::from(1u64), Scalar::from(2u64)];
        assert_eq!(lagrange_coeff(&xs[0], &xs), Scalar::from(2u64));
        assert_eq!(lagrange_coeff(&xs[1], &xs), -Scalar::ONE);
    }
}
