//! Verifier for the restricted partially-blind signatures certifying builder
//! payout commitments, over BN254 G1.
//!
//! A signature is the tuple `(z1̂, c1̂, s1̂, c2̂, s2̂, m1̂)` with `z1̂, m1̂`
//! curve points and the rest scalars. The service public key `y1` and the
//! committed info string are the other verification inputs.

mod point;

use crate::types::{BidSubmission, RpbsSignature};
use ark_bn254::{Fr, G1Affine};
use ark_ec::{AffineRepr, CurveGroup};
use ark_ff::PrimeField;
use sha2::{Digest, Sha256};
use thiserror::Error;

use point::{bytes_to_point, decode_point, decode_scalar, encode_point};

#[derive(Debug, Error)]
pub enum RpbsError {
    #[error("malformed hex input")]
    InvalidHex,
    #[error("point is not on the bn254 curve")]
    NotOnCurve,
    #[error("hash-to-curve produced no square root")]
    NoSquareRoot,
    #[error("signature equation mismatch")]
    EquationMismatch,
}

struct Signature {
    z1_hat: G1Affine,
    c1_hat: Fr,
    s1_hat: Fr,
    c2_hat: Fr,
    s2_hat: Fr,
    m1_hat: G1Affine,
}

impl TryFrom<&RpbsSignature> for Signature {
    type Error = RpbsError;

    fn try_from(encoded: &RpbsSignature) -> Result<Self, Self::Error> {
        Ok(Self {
            z1_hat: decode_point(&encoded.z1_hat)?,
            c1_hat: decode_scalar(&encoded.c1_hat)?,
            s1_hat: decode_scalar(&encoded.s1_hat)?,
            c2_hat: decode_scalar(&encoded.c2_hat)?,
            s2_hat: decode_scalar(&encoded.s2_hat)?,
            m1_hat: decode_point(&encoded.m1_hat)?,
        })
    }
}

/// Verify that `signature` certifies `info` under the service key. All
/// failure modes collapse into one reason for callers.
pub fn verify(
    service_public_key: &str,
    info: &str,
    signature: &RpbsSignature,
) -> Result<(), RpbsError> {
    let y1 = decode_point(service_public_key)?;
    let signature = Signature::try_from(signature)?;

    let info_hash: [u8; 32] = Sha256::digest(info.as_bytes()).into();
    let y2 = bytes_to_point(&info_hash)?;
    let g = G1Affine::generator();

    // scalar negation happens in the scalar field, never modulo the base prime
    let p1 = (g * signature.s1_hat + y1 * -signature.c1_hat).into_affine();
    let p2 = (signature.m1_hat * signature.s1_hat + signature.z1_hat * -signature.c1_hat)
        .into_affine();
    let p3 = (g * signature.s2_hat + y2 * -signature.c2_hat).into_affine();

    let challenge = challenge_scalar(&y1, &y2, &signature.m1_hat, &signature.z1_hat, &p1, &p2, &p3);
    if signature.c1_hat * signature.c2_hat == challenge {
        Ok(())
    } else {
        Err(RpbsError::EquationMismatch)
    }
}

/// Verify the RPBS commitment carried by a builder submission against the
/// canonical info string derived from the bid message.
pub fn verify_submission(
    message: &BidSubmission,
    service_public_key: &str,
    signature: &RpbsSignature,
) -> Result<(), RpbsError> {
    verify(service_public_key, &message.rpbs_commitment_info(), signature)
}

fn challenge_scalar(
    y1: &G1Affine,
    y2: &G1Affine,
    m1_hat: &G1Affine,
    z1_hat: &G1Affine,
    p1: &G1Affine,
    p2: &G1Affine,
    p3: &G1Affine,
) -> Fr {
    let mut hasher = Sha256::new();
    hasher.update(encode_point(y1));
    hasher.update(encode_point(y2));
    hasher.update(encode_point(m1_hat));
    hasher.update(encode_point(z1_hat));
    hasher.update(encode_point(p1));
    hasher.update(encode_point(p2));
    hasher.update(encode_point(p3));
    hasher.update(encode_point(&G1Affine::generator()));
    let digest: [u8; 32] = hasher.finalize().into();
    Fr::from_be_bytes_mod_order(&digest)
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    //! Counterpart signer used by the test suites. The `y2` branch is
    //! simulated with random `(c2̂, s2̂)` and the `y1` branch answered with
    //! the known discrete log, exactly as the commitment scheme prescribes.

    use super::*;
    use ark_ff::UniformRand;
    use point::{encode_point_wire, encode_scalar};

    pub struct RpbsSigner {
        secret: Fr,
        public_key: G1Affine,
    }

    impl RpbsSigner {
        pub fn random<R: rand::Rng>(rng: &mut R) -> Self {
            let secret = Fr::rand(rng);
            let public_key = (G1Affine::generator() * secret).into_affine();
            Self { secret, public_key }
        }

        pub fn public_key_wire(&self) -> String {
            encode_point_wire(&self.public_key)
        }

        pub fn sign<R: rand::Rng>(&self, info: &str, rng: &mut R) -> RpbsSignature {
            let g = G1Affine::generator();
            let info_hash: [u8; 32] = Sha256::digest(info.as_bytes()).into();
            let y2 = bytes_to_point(&info_hash).expect("hash-to-curve succeeds");

            let t = Fr::rand(rng);
            let m1_hat = (g * t).into_affine();
            let z1_hat = (m1_hat * self.secret).into_affine();

            let c2_hat = Fr::rand(rng);
            let s2_hat = Fr::rand(rng);
            let p3 = (g * s2_hat + y2 * -c2_hat).into_affine();

            let k = Fr::rand(rng);
            let p1 = (g * k).into_affine();
            let p2 = (m1_hat * k).into_affine();

            let challenge =
                challenge_scalar(&self.public_key, &y2, &m1_hat, &z1_hat, &p1, &p2, &p3);
            let c1_hat = challenge * c2_hat.inverse().expect("nonzero challenge share");
            let s1_hat = k + c1_hat * self.secret;

            RpbsSignature {
                z1_hat: encode_point_wire(&z1_hat),
                c1_hat: encode_scalar(&c1_hat),
                s1_hat: encode_scalar(&s1_hat),
                c2_hat: encode_scalar(&c2_hat),
                s2_hat: encode_scalar(&s2_hat),
                m1_hat: encode_point_wire(&m1_hat),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::RpbsSigner, *};
    use ark_ff::One;

    const INFO: &str =
        "builderwalletaddress:0xabababababababababababababababababababab,slot:100,amount:1000,transaction:0xdeadbeef";

    #[test]
    fn valid_signature_verifies() {
        let mut rng = rand::thread_rng();
        let signer = RpbsSigner::random(&mut rng);
        let signature = signer.sign(INFO, &mut rng);
        assert!(verify(&signer.public_key_wire(), INFO, &signature).is_ok());
    }

    #[test]
    fn verification_is_deterministic() {
        let mut rng = rand::thread_rng();
        let signer = RpbsSigner::random(&mut rng);
        let signature = signer.sign(INFO, &mut rng);
        let key = signer.public_key_wire();
        for _ in 0..4 {
            assert!(verify(&key, INFO, &signature).is_ok());
        }
    }

    #[test]
    fn tampered_s1_fails() {
        let mut rng = rand::thread_rng();
        let signer = RpbsSigner::random(&mut rng);
        let signature = signer.sign(INFO, &mut rng);

        let mut tampered = signature.clone();
        let s1 = point::decode_scalar(&signature.s1_hat).unwrap();
        tampered.s1_hat = point::encode_scalar(&(s1 + Fr::one()));
        assert!(matches!(
            verify(&signer.public_key_wire(), INFO, &tampered),
            Err(RpbsError::EquationMismatch)
        ));
    }

    #[test]
    fn wrong_info_fails() {
        let mut rng = rand::thread_rng();
        let signer = RpbsSigner::random(&mut rng);
        let signature = signer.sign(INFO, &mut rng);
        assert!(verify(&signer.public_key_wire(), "slot:101", &signature).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let mut rng = rand::thread_rng();
        let signer = RpbsSigner::random(&mut rng);
        let other = RpbsSigner::random(&mut rng);
        let signature = signer.sign(INFO, &mut rng);
        assert!(verify(&other.public_key_wire(), INFO, &signature).is_err());
    }

    #[test]
    fn garbage_inputs_are_rejected_before_the_equation() {
        let mut rng = rand::thread_rng();
        let signer = RpbsSigner::random(&mut rng);
        let mut signature = signer.sign(INFO, &mut rng);
        signature.m1_hat = "not-hex".into();
        assert!(matches!(
            verify(&signer.public_key_wire(), INFO, &signature),
            Err(RpbsError::InvalidHex)
        ));
    }
}
