//! Small encoding helpers shared by the device code and the software token.

use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    error::ErrorStack,
    nid::Nid,
};

//------------ Curve ---------------------------------------------------------

/// The named curves keys can be created on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Curve {
    P256,
    P384,
    P521,
}

const OID_P256: &[u8] = &[0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];
const OID_P384: &[u8] = &[0x06, 0x05, 0x2B, 0x81, 0x04, 0x00, 0x22];
const OID_P521: &[u8] = &[0x06, 0x05, 0x2B, 0x81, 0x04, 0x00, 0x23];

impl Curve {
    pub fn nid(self) -> Nid {
        match self {
            Curve::P256 => Nid::X9_62_PRIME256V1,
            Curve::P384 => Nid::SECP384R1,
            Curve::P521 => Nid::SECP521R1,
        }
    }

    /// The curve OID as a complete DER value, as used in `CKA_EC_PARAMS`.
    pub fn params(self) -> &'static [u8] {
        match self {
            Curve::P256 => OID_P256,
            Curve::P384 => OID_P384,
            Curve::P521 => OID_P521,
        }
    }

    pub fn from_params(params: &[u8]) -> Option<Curve> {
        match params {
            OID_P256 => Some(Curve::P256),
            OID_P384 => Some(Curve::P384),
            OID_P521 => Some(Curve::P521),
            _ => None,
        }
    }

    pub fn from_nid(nid: Nid) -> Option<Curve> {
        match nid {
            Nid::X9_62_PRIME256V1 => Some(Curve::P256),
            Nid::SECP384R1 => Some(Curve::P384),
            Nid::SECP521R1 => Some(Curve::P521),
            _ => None,
        }
    }

    /// Size of a field element in bytes.
    pub fn field_size(self) -> usize {
        match self {
            Curve::P256 => 32,
            Curve::P384 => 48,
            Curve::P521 => 66,
        }
    }

    /// Picks the smallest curve that offers at least `key_size` bytes.
    pub fn for_key_size(key_size: usize) -> Option<Curve> {
        [Curve::P256, Curve::P384, Curve::P521]
            .into_iter()
            .find(|curve| curve.field_size() >= key_size)
    }
}

//------------ DER -----------------------------------------------------------

/// Wraps `content` in a DER OCTET STRING.
pub fn der_octet_string(content: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(content.len() + 4);
    res.push(0x04);
    push_der_length(&mut res, content.len());
    res.extend_from_slice(content);
    res
}

/// Unwraps a DER OCTET STRING.
///
/// Some drivers hand back the raw point for `CKA_EC_POINT`, so content that
/// isn't wrapped is returned as is.
pub fn der_octet_string_content(der: &[u8]) -> &[u8] {
    if der.len() < 2 || der[0] != 0x04 {
        return der;
    }
    let (len, header) = match der[1] {
        len if len < 0x80 => (len as usize, 2),
        0x81 if der.len() > 2 => (der[2] as usize, 3),
        0x82 if der.len() > 3 => (((der[2] as usize) << 8) | der[3] as usize, 4),
        _ => return der,
    };
    if header + len != der.len() {
        return der;
    }
    &der[header..]
}

fn push_der_length(target: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        target.push(len as u8);
    } else if len < 0x100 {
        target.push(0x81);
        target.push(len as u8);
    } else {
        target.push(0x82);
        target.push((len >> 8) as u8);
        target.push(len as u8);
    }
}

/// Strips the tag and length of a DER INTEGER, leaving the value bytes.
///
/// Certificate serial numbers are stored with the full DER encoding by
/// most tokens but some store only the value.
pub fn der_integer_content(der: &[u8]) -> Option<&[u8]> {
    if der.len() < 3 || der[0] != 0x02 {
        return None;
    }
    let len = der[1] as usize;
    if len >= 0x80 || 2 + len != der.len() {
        return None;
    }
    Some(&der[2..])
}

/// Encodes a serial number as a DER INTEGER.
pub fn der_integer(value: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(value.len() + 3);
    res.push(0x02);
    let pad = value.first().map(|b| b & 0x80 != 0).unwrap_or(true);
    push_der_length(&mut res, value.len() + usize::from(pad));
    if pad {
        res.push(0);
    }
    res.extend_from_slice(value);
    res
}

//------------ Signatures ----------------------------------------------------

/// Converts the fixed-size `r || s` form PKCS#11 uses for DSA and ECDSA
/// signatures into DER `SEQUENCE { r INTEGER, s INTEGER }`.
pub fn rs_to_der(signature: &[u8]) -> Result<Vec<u8>, ErrorStack> {
    let half = signature.len() / 2;
    let r = BigNum::from_slice(&signature[..half])?;
    let s = BigNum::from_slice(&signature[half..])?;
    EcdsaSig::from_private_components(r, s)?.to_der()
}

/// Converts a DER signature back into `r || s`, each half `size` bytes.
pub fn der_to_rs(der: &[u8], size: usize) -> Result<Vec<u8>, ErrorStack> {
    let sig = EcdsaSig::from_der(der)?;
    let mut res = sig.r().to_vec_padded(size as i32)?;
    res.extend_from_slice(&sig.s().to_vec_padded(size as i32)?);
    Ok(res)
}

//------------ Key material --------------------------------------------------

/// Forces odd parity on every byte, as DES keys require.
pub fn adjust_key_parity(key: &mut [u8]) {
    for byte in key.iter_mut() {
        if byte.count_ones() % 2 == 0 {
            *byte ^= 1;
        }
    }
}

/// Whether every byte has odd parity.
pub fn has_odd_parity(key: &[u8]) -> bool {
    key.iter().all(|byte| byte.count_ones() % 2 == 1)
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_is_forced_odd() {
        let mut key: Vec<u8> = (0u8..=255).collect();
        adjust_key_parity(&mut key);
        assert!(has_odd_parity(&key));
        // Only the low bit may change.
        for (i, byte) in key.iter().enumerate() {
            assert_eq!(byte & 0xFE, (i as u8) & 0xFE);
        }
    }

    #[test]
    fn octet_string_long_form() {
        let point = vec![0x04; 133];
        let der = der_octet_string(&point);
        assert_eq!(&der[..3], &[0x04, 0x81, 133]);
        assert_eq!(der_octet_string_content(&der), point.as_slice());
    }

    #[test]
    fn raw_point_is_left_alone() {
        let raw = [0x04, 0x01, 0x02, 0x03];
        assert_eq!(der_octet_string_content(&raw), &raw);
    }

    #[test]
    fn integer_content() {
        assert_eq!(der_integer_content(&der_integer(&[0x85, 0x01])), Some(&[0x00, 0x85, 0x01][..]));
        assert_eq!(der_integer_content(&der_integer(&[0x05])), Some(&[0x05][..]));
        assert_eq!(der_integer_content(&[0x04, 0x01, 0x00]), None);
    }

    #[test]
    fn signature_forms() {
        let mut rs = vec![0u8; 64];
        rs[31] = 7;
        rs[63] = 9;
        let der = rs_to_der(&rs).unwrap();
        assert_eq!(der_to_rs(&der, 32).unwrap(), rs);
    }

    #[test]
    fn curve_params() {
        assert_eq!(Curve::from_params(Curve::P384.params()), Some(Curve::P384));
        assert_eq!(Curve::for_key_size(32), Some(Curve::P256));
        assert_eq!(Curve::for_key_size(60), Some(Curve::P521));
        assert_eq!(Curve::for_key_size(80), None);
    }
}
