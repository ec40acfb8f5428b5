//! Native public-key contexts built from device objects.
//!
//! Public-key operations are done in software: it is faster than a round
//! trip to the device and sidesteps drivers that only do private-key
//! operations at all. The permissions found on the device object carry
//! over to the native context.

use std::fmt;

use openssl::{
    pkey::{Id, PKey, Public},
    pkey_ctx::PkeyCtx,
    rsa::Padding,
};

use crate::device::{
    DeviceGuard,
    capability::Actions,
    context::{DeviceContext, Permissions, PublicKeyData},
    error::DeviceError,
    mechanism::Algorithm,
    object::{public_key_from_data, read_bytes},
    token::{AttributeType, ObjectHandle},
    util::{Curve, der_octet_string_content},
};

//------------ NativeContext -------------------------------------------------

/// A public key held in memory.
pub struct NativeContext {
    algorithm: Algorithm,
    permissions: Permissions,
    key: PKey<Public>,
}

impl fmt::Debug for NativeContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NativeContext")
            .field("algorithm", &self.algorithm)
            .field("permissions", &self.permissions)
            .finish()
    }
}

impl NativeContext {
    /// Wraps a public key, keeping only the public-key actions of
    /// `permissions`.
    pub fn new(algorithm: Algorithm, key: PKey<Public>, permissions: Permissions) -> Result<Self, DeviceError> {
        let expected = match algorithm {
            Algorithm::Rsa => Id::RSA,
            Algorithm::Dsa => Id::DSA,
            Algorithm::Ecdsa => Id::EC,
            Algorithm::Dh => Id::DH,
            _ => return Err(DeviceError::NotAvailable),
        };
        if key.id() != expected {
            return Err(DeviceError::argument("key does not match the algorithm"));
        }
        let mut actions = Actions::empty();
        if permissions.actions.intersects(Actions::ENCRYPT | Actions::DECRYPT) && algorithm == Algorithm::Rsa {
            actions.insert(Actions::ENCRYPT);
        }
        if permissions.actions.intersects(Actions::SIGN | Actions::VERIFY) {
            actions.insert(Actions::VERIFY);
        }
        if permissions.actions.contains(Actions::DERIVE) {
            actions.insert(Actions::DERIVE);
        }
        if actions.is_empty() {
            return Err(DeviceError::Permission);
        }
        Ok(NativeContext {
            algorithm,
            permissions: Permissions {
                actions,
                internal_only: permissions.internal_only,
            },
            key,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn public_key(&self) -> &PKey<Public> {
        &self.key
    }

    /// The SHA-1 hash of the SubjectPublicKeyInfo.
    pub fn key_id(&self) -> Result<Vec<u8>, DeviceError> {
        Ok(openssl::sha::sha1(&self.key.public_key_to_der()?).to_vec())
    }

    /// Raw RSA encryption of a block already padded by the caller.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        if !self.permissions.allows(Actions::ENCRYPT) {
            return Err(DeviceError::Permission);
        }
        let rsa = self.key.rsa()?;
        let size = rsa.size() as usize;
        if data.len() > size {
            return Err(DeviceError::Overflow);
        }
        let mut block = vec![0; size - data.len()];
        block.extend_from_slice(data);
        let mut out = vec![0; size];
        let len = rsa
            .public_encrypt(&block, &mut out, Padding::NONE)
            .map_err(|_| DeviceError::BadData)?;
        out.truncate(len);
        Ok(out)
    }

    /// Verifies a signature.
    ///
    /// RSA signatures are checked against the raw padded block, DSA and
    /// ECDSA signatures are DER encoded and made over a hash.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), DeviceError> {
        if !self.permissions.allows(Actions::VERIFY) {
            return Err(DeviceError::Permission);
        }
        if self.algorithm == Algorithm::Rsa {
            let rsa = self.key.rsa()?;
            let size = rsa.size() as usize;
            if signature.len() != size || data.len() > size {
                return Err(DeviceError::Overflow);
            }
            let mut recovered = vec![0; size];
            let len = rsa
                .public_decrypt(signature, &mut recovered, Padding::NONE)
                .map_err(|_| DeviceError::SignatureInvalid)?;
            let recovered = &recovered[..len];
            let offset = size - data.len();
            return if recovered.len() == size
                && recovered[..offset].iter().all(|b| *b == 0)
                && &recovered[offset..] == data
            {
                Ok(())
            } else {
                Err(DeviceError::SignatureInvalid)
            };
        }
        let mut ctx = PkeyCtx::new(&self.key)?;
        ctx.verify_init()?;
        match ctx.verify(data, signature) {
            Ok(true) => Ok(()),
            _ => Err(DeviceError::SignatureInvalid),
        }
    }
}

//------------ Bridging ------------------------------------------------------

impl DeviceContext {
    /// The public key as an OpenSSL key.
    pub fn native_public_key(&self) -> Result<PKey<Public>, DeviceError> {
        let data = self.public.as_ref().ok_or(DeviceError::NotInitialized)?;
        public_key_from_data(data)
    }

    /// Creates a native context for the public half of this key.
    pub fn to_native(&self) -> Result<NativeContext, DeviceError> {
        NativeContext::new(self.algorithm(), self.native_public_key()?, self.permissions())
    }
}

/// Reads the public components stored with a key object.
///
/// Returns `None` for objects that don't carry them, such as DSA and EC
/// private keys on most tokens.
pub(crate) fn read_public_key_data(
    guard: &DeviceGuard,
    object: ObjectHandle,
    algorithm: Algorithm,
) -> Option<PublicKeyData> {
    let read = |attr| read_bytes(guard, object, attr).ok();
    match algorithm {
        Algorithm::Rsa => Some(PublicKeyData::Rsa {
            modulus: read(AttributeType::Modulus)?,
            exponent: read(AttributeType::PublicExponent)?,
        }),
        Algorithm::Dsa => Some(PublicKeyData::Dsa {
            p: read(AttributeType::Prime)?,
            q: read(AttributeType::Subprime)?,
            g: read(AttributeType::Base)?,
            y: read(AttributeType::Value)?,
        }),
        Algorithm::Ecdsa => {
            let curve = Curve::from_params(&read(AttributeType::EcParams)?)?;
            let point = read(AttributeType::EcPoint)?;
            Some(PublicKeyData::Ec {
                curve,
                point: der_octet_string_content(&point).to_vec(),
            })
        }
        Algorithm::Dh => Some(PublicKeyData::Dh {
            p: read(AttributeType::Prime)?,
            g: read(AttributeType::Base)?,
            y: read(AttributeType::Value)?,
        }),
        _ => None,
    }
}

/// The public components of an OpenSSL public key.
pub(crate) fn public_key_data(key: &PKey<Public>) -> Result<PublicKeyData, DeviceError> {
    match key.id() {
        Id::RSA => {
            let rsa = key.rsa()?;
            Ok(PublicKeyData::Rsa {
                modulus: rsa.n().to_vec(),
                exponent: rsa.e().to_vec(),
            })
        }
        Id::DSA => {
            let dsa = key.dsa()?;
            Ok(PublicKeyData::Dsa {
                p: dsa.p().to_vec(),
                q: dsa.q().to_vec(),
                g: dsa.g().to_vec(),
                y: dsa.pub_key().to_vec(),
            })
        }
        Id::EC => {
            let ec = key.ec_key()?;
            let curve = ec
                .group()
                .curve_name()
                .and_then(Curve::from_nid)
                .ok_or(DeviceError::NotAvailable)?;
            let mut ctx = openssl::bn::BigNumContext::new()?;
            let point =
                ec.public_key()
                    .to_bytes(ec.group(), openssl::ec::PointConversionForm::UNCOMPRESSED, &mut ctx)?;
            Ok(PublicKeyData::Ec { curve, point })
        }
        _ => Err(DeviceError::NotAvailable),
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use openssl::{ec::EcGroup, ec::EcKey, ecdsa::EcdsaSig, nid::Nid, rsa::Rsa};

    use super::*;

    fn rsa_key() -> (Rsa<openssl::pkey::Private>, PKey<Public>) {
        let rsa = Rsa::generate(1024).unwrap();
        let public = PKey::public_key_from_der(&rsa.public_key_to_der().unwrap()).unwrap();
        (rsa, public)
    }

    #[test]
    fn permissions_are_limited_to_public_actions() {
        let (_, key) = rsa_key();
        let native = NativeContext::new(
            Algorithm::Rsa,
            key,
            Permissions::all(Actions::SIGN | Actions::DECRYPT),
        )
        .unwrap();
        assert_eq!(native.permissions().actions, Actions::ENCRYPT | Actions::VERIFY);
    }

    #[test]
    fn verify_only_key_cannot_encrypt() {
        let (_, key) = rsa_key();
        let native = NativeContext::new(Algorithm::Rsa, key, Permissions::all(Actions::VERIFY)).unwrap();
        assert!(matches!(native.encrypt(&[1; 16]), Err(DeviceError::Permission)));
    }

    #[test]
    fn no_permissions_no_context() {
        let (_, key) = rsa_key();
        assert!(matches!(
            NativeContext::new(Algorithm::Rsa, key, Permissions::all(Actions::GENERATE)),
            Err(DeviceError::Permission)
        ));
    }

    #[test]
    fn raw_rsa_verify() {
        let (rsa, key) = rsa_key();
        let native = NativeContext::new(Algorithm::Rsa, key, Permissions::all(Actions::VERIFY)).unwrap();
        let mut block = vec![0x00, 0x01];
        block.extend_from_slice(&[0xFF; 100]);
        block.push(0);
        block.extend_from_slice(&[0x42; 25]);
        let mut sig = vec![0; 128];
        rsa.private_encrypt(&block, &mut sig, Padding::NONE).unwrap();
        native.verify(&block, &sig).unwrap();
        block[127] ^= 1;
        assert!(matches!(native.verify(&block, &sig), Err(DeviceError::SignatureInvalid)));
    }

    #[test]
    fn ecdsa_verify() {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let ec = EcKey::generate(&group).unwrap();
        let public = PKey::from_ec_key(EcKey::from_public_key(&group, ec.public_key()).unwrap()).unwrap();
        let hash = openssl::sha::sha256(b"data");
        let sig = EcdsaSig::sign(&hash, &ec).unwrap().to_der().unwrap();
        let native = NativeContext::new(Algorithm::Ecdsa, public, Permissions::all(Actions::VERIFY)).unwrap();
        native.verify(&hash, &sig).unwrap();
        assert!(native.verify(&openssl::sha::sha256(b"other"), &sig).is_err());
    }
}
