//! BN254 G1 point handling for the RPBS scheme: the length-prefixed hex wire
//! format shared with the JavaScript signing peer, and hash-to-curve via
//! Cipolla's square root in a quadratic extension.

use alloy_primitives::hex;
use ark_bn254::{Fq, Fr, G1Affine};
use ark_ec::AffineRepr;
use ark_ff::{BigInteger, Field, One, PrimeField, Zero};

use super::RpbsError;

/// `0x04 ∥ X ∥ Y`, both coordinates 32-byte big-endian.
pub(crate) fn encode_point(point: &G1Affine) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(65);
    encoded.push(4u8);
    encoded.extend_from_slice(&field_to_bytes(&point.x));
    encoded.extend_from_slice(&field_to_bytes(&point.y));
    encoded
}

/// Wire format is `len(hex(X)) ∥ "04" ∥ hex(X) ∥ hex(Y)`; the first two bytes
/// are dropped and the remaining 64 parsed as the affine coordinates.
pub(crate) fn decode_point(encoded: &str) -> Result<G1Affine, RpbsError> {
    let bytes = hex::decode(encoded).map_err(|_| RpbsError::InvalidHex)?;
    if bytes.len() != 66 {
        return Err(RpbsError::InvalidHex);
    }
    let x = Fq::from_be_bytes_mod_order(&bytes[2..34]);
    let y = Fq::from_be_bytes_mod_order(&bytes[34..66]);
    let point = G1Affine::new_unchecked(x, y);
    if !point.is_on_curve() {
        return Err(RpbsError::NotOnCurve);
    }
    Ok(point)
}

/// Scalars arrive as bare hex strings of arbitrary length and are reduced
/// into the scalar field.
pub(crate) fn decode_scalar(encoded: &str) -> Result<Fr, RpbsError> {
    let padded = if encoded.len() % 2 == 1 { format!("0{encoded}") } else { encoded.to_string() };
    let bytes = hex::decode(&padded).map_err(|_| RpbsError::InvalidHex)?;
    Ok(Fr::from_be_bytes_mod_order(&bytes))
}

pub(crate) fn encode_scalar(scalar: &Fr) -> String {
    hex::encode(scalar.into_bigint().to_bytes_be())
}

/// RPBS wire encoding of a point: the 65-byte uncompressed encoding with the
/// one-byte `len(hex(X))` prefix, all hex-encoded.
pub(crate) fn encode_point_wire(point: &G1Affine) -> String {
    let mut bytes = vec![64u8];
    bytes.extend_from_slice(&encode_point(point));
    hex::encode(bytes)
}

fn field_to_bytes(element: &Fq) -> [u8; 32] {
    let bytes = element.into_bigint().to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// y² = x³ + 3
fn curve_rhs(x: &Fq) -> Fq {
    x.square() * x + Fq::from(3u64)
}

/// Euler's criterion: 1 for residues, -1 for non-residues, 0 for zero.
fn legendre(element: &Fq) -> i8 {
    if element.is_zero() {
        return 0;
    }
    let mut exponent = Fq::MODULUS;
    exponent.sub_with_borrow(&1u64.into());
    exponent.div2();
    let symbol = element.pow(exponent);
    if symbol.is_one() {
        1
    } else {
        -1
    }
}

/// Element of Fq[i] with i² = neg.
#[derive(Clone, Copy)]
struct Complex {
    re: Fq,
    im: Fq,
}

impl Complex {
    fn one() -> Self {
        Self { re: Fq::one(), im: Fq::zero() }
    }

    fn mul(&self, other: &Self, neg: &Fq) -> Self {
        let re = self.re * other.re + self.im * other.im * neg;
        let im = self.re * other.im + other.re * self.im;
        Self { re, im }
    }

    fn pow(&self, exponent: &<Fq as PrimeField>::BigInt, neg: &Fq) -> Self {
        let mut result = Self::one();
        for bit in exponent.to_bits_be() {
            result = result.mul(&result, neg);
            if bit {
                result = result.mul(self, neg);
            }
        }
        result
    }
}

/// Interpret a 32-byte digest as an x-coordinate, walking x forward until the
/// curve equation has a root, then solve for y with Cipolla's algorithm.
pub(crate) fn bytes_to_point(hash: &[u8; 32]) -> Result<G1Affine, RpbsError> {
    let mut x = Fq::from_be_bytes_mod_order(hash);
    let mut n = curve_rhs(&x);
    while legendre(&n) != 1 {
        x += Fq::one();
        n = curve_rhs(&x);
    }

    // find a with a² - n a non-residue, so Fq[i] with i² = a² - n is a field
    let mut a = Fq::zero();
    let mut neg = -n;
    while legendre(&neg) != -1 {
        a += Fq::one();
        neg = a.square() - n;
    }

    // (a + i)^((p + 1) / 2) lands in Fq and squares to n
    let mut exponent = Fq::MODULUS;
    exponent.add_with_carry(&1u64.into());
    exponent.div2();
    let root = Complex { re: a, im: Fq::one() }.pow(&exponent, &neg);
    if !root.im.is_zero() {
        return Err(RpbsError::NoSquareRoot);
    }

    let point = G1Affine::new_unchecked(x, root.re);
    if !point.is_on_curve() {
        return Err(RpbsError::NotOnCurve);
    }
    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ec::CurveGroup;
    use ark_ff::UniformRand;

    #[test]
    fn point_wire_encoding_round_trips() {
        let mut rng = rand::thread_rng();
        let scalar = Fr::rand(&mut rng);
        let point = (G1Affine::generator() * scalar).into_affine();
        let encoded = encode_point_wire(&point);
        let decoded = decode_point(&encoded).unwrap();
        assert_eq!(point, decoded);
    }

    #[test]
    fn decode_rejects_truncated_points() {
        let mut rng = rand::thread_rng();
        let scalar = Fr::rand(&mut rng);
        let point = (G1Affine::generator() * scalar).into_affine();
        let encoded = encode_point_wire(&point);
        assert!(decode_point(&encoded[..encoded.len() - 2]).is_err());
        assert!(decode_point("zz").is_err());
    }

    #[test]
    fn decode_rejects_points_off_curve() {
        // y bumped off the curve
        let generator = G1Affine::generator();
        let bogus = G1Affine::new_unchecked(generator.x, generator.y + Fq::one());
        let mut bytes = vec![64u8];
        bytes.extend_from_slice(&encode_point(&bogus));
        assert!(decode_point(&hex::encode(bytes)).is_err());
    }

    #[test]
    fn hashed_points_satisfy_curve_equation() {
        for seed in 0u8..16 {
            let hash = [seed; 32];
            let point = bytes_to_point(&hash).unwrap();
            assert_eq!(point.y.square(), curve_rhs(&point.x));
        }
    }

    #[test]
    fn hashing_is_deterministic() {
        let hash = [42u8; 32];
        assert_eq!(bytes_to_point(&hash).unwrap(), bytes_to_point(&hash).unwrap());
    }

    #[test]
    fn odd_length_scalars_decode() {
        let scalar = decode_scalar("f").unwrap();
        assert_eq!(scalar, Fr::from(15u64));
    }
}
