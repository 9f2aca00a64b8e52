// Threshold secret sharing over the ed25519 scalar field
//
// 1. ShamirPolynomial::from_secret(key, threshold) - random polynomial with the key as a_0
// 2. split() evaluates it at x = 1..=n to produce operator shares
// 3. combine() runs Lagrange interpolation at x = 0 over any t distinct shares

use crate::errors::{SealError, SealResult};
use crate::keys::{KeyShare, UnsealKey};
use crate::types::MAX_SHARES;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use std::collections::BTreeSet;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Polynomial f(x) = a_0 + a_1*x + ... + a_{t-1}*x^{t-1} with a_0 the secret
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ShamirPolynomial {
    coefficients: Vec<Scalar>,
}

impl ShamirPolynomial {
    /// Random polynomial of degree `threshold - 1` with `secret` as constant term
    pub fn from_secret<R: RngCore + CryptoRng>(
        secret: Scalar,
        threshold: usize,
        rng: &mut R,
    ) -> SealResult<Self> {
        if threshold == 0 {
            return Err(SealError::invalid_request("threshold must be positive"));
        }

        let mut coefficients = Vec::with_capacity(threshold);
        coefficients.push(secret);
        for _ in 1..threshold {
            let mut wide = [0u8; 64];
            rng.fill_bytes(&mut wide);
            coefficients.push(Scalar::from_bytes_mod_order_wide(&wide));
            wide.zeroize();
        }

        Ok(Self { coefficients })
    }

    /// Horner evaluation of f(x)
    pub fn evaluate(&self, x: Scalar) -> Scalar {
        let mut result = Scalar::ZERO;
        for coeff in self.coefficients.iter().rev() {
            result = result * x + coeff;
        }
        result
    }

    /// Degree + 1
    pub fn threshold(&self) -> usize {
        self.coefficients.len()
    }
}

/// Split an unseal key into `shares` points, any `threshold` of which reconstruct it.
pub fn split<R: RngCore + CryptoRng>(
    key: &UnsealKey,
    shares: u32,
    threshold: u32,
    rng: &mut R,
) -> SealResult<Vec<KeyShare>> {
    if threshold == 0 || threshold > shares || shares > MAX_SHARES {
        return Err(SealError::invalid_request(format!(
            "cannot split into {shares} shares with threshold {threshold}"
        )));
    }

    let polynomial = ShamirPolynomial::from_secret(key.scalar(), threshold as usize, rng)?;
    Ok((1..=shares)
        .map(|x| {
            let x = x as u8;
            KeyShare::from_point(x, polynomial.evaluate(Scalar::from(x)))
        })
        .collect())
}

/// Reconstruct an unseal key from distinct shares.
///
/// The caller decides whether enough shares are present; any set of distinct
/// shares yields *some* key, and only unwrapping with it tells whether it is
/// the right one.
pub fn combine(shares: &[KeyShare]) -> SealResult<UnsealKey> {
    if shares.is_empty() {
        return Err(SealError::invalid_request(
            "cannot combine with zero shares",
        ));
    }

    let mut seen = BTreeSet::new();
    let mut points = Vec::with_capacity(shares.len());
    for share in shares {
        if !seen.insert(share.index()) {
            return Err(SealError::invalid_request(format!(
                "duplicate share index {}",
                share.index()
            )));
        }
        points.push((Scalar::from(share.index()), share.scalar()?));
    }

    let mut secret = Scalar::ZERO;
    for (i, (x_i, y_i)) in points.iter().enumerate() {
        // L_i(0) = prod_{j != i} -x_j / (x_i - x_j)
        let mut basis = Scalar::ONE;
        for (j, (x_j, _)) in points.iter().enumerate() {
            if i != j {
                basis *= -x_j * (x_i - x_j).invert();
            }
        }
        secret += y_i * basis;
    }

    Ok(UnsealKey::from_scalar(secret))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_polynomial_evaluate_at_zero_is_secret() {
        let secret = Scalar::from(123u64);
        let poly = ShamirPolynomial::from_secret(secret, 3, &mut OsRng).unwrap();
        assert_eq!(poly.evaluate(Scalar::ZERO), secret);
        assert_eq!(poly.threshold(), 3);
    }

    #[test]
    fn test_split_and_combine_threshold_subset() {
        let key = UnsealKey::generate(&mut OsRng);
        let shares = split(&key, 5, 3, &mut OsRng).unwrap();
        assert_eq!(shares.len(), 5);

        let subset = vec![shares[4].clone(), shares[0].clone(), shares[2].clone()];
        assert_eq!(combine(&subset).unwrap(), key);
    }

    #[test]
    fn test_below_threshold_gives_wrong_key() {
        let key = UnsealKey::generate(&mut OsRng);
        let shares = split(&key, 3, 3, &mut OsRng).unwrap();
        assert_ne!(combine(&shares[..2]).unwrap(), key);
    }

    #[test]
    fn test_threshold_one_every_share_is_the_key() {
        let key = UnsealKey::generate(&mut OsRng);
        let shares = split(&key, 4, 1, &mut OsRng).unwrap();
        for share in &shares {
            assert_eq!(combine(std::slice::from_ref(share)).unwrap(), key);
        }
    }

    #[test]
    fn test_combine_rejects_duplicate_indices() {
        let key = UnsealKey::generate(&mut OsRng);
        let shares = split(&key, 3, 2, &mut OsRng).unwrap();
        let dup = vec![shares[0].clone(), shares[0].clone()];
        assert!(combine(&dup).is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_any_threshold_subset_reconstructs(
            shares in 1u32..=7,
            threshold_seed in 0u32..7,
            rotation in 0usize..7,
        ) {
            let threshold = threshold_seed % shares + 1;
            let key = UnsealKey::generate(&mut OsRng);
            let mut all = split(&key, shares, threshold, &mut OsRng).unwrap();
            let len = all.len();
            all.rotate_left(rotation % len);

            let enough = &all[..threshold as usize];
            proptest::prop_assert_eq!(combine(enough).unwrap(), key.clone());

            if threshold > 1 {
                let short = &all[..threshold as usize - 1];
                proptest::prop_assert_ne!(combine(short).unwrap(), key);
            }
        }
    }

    #[test]
    fn test_split_rejects_bad_parameters() {
        let key = UnsealKey::generate(&mut OsRng);
        assert!(split(&key, 2, 3, &mut OsRng).is_err());
        assert!(split(&key, 3, 0, &mut OsRng).is_err());
        assert!(split(&key, 256, 2, &mut OsRng).is_err());
    }
}
