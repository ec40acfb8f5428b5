//! Cryptographic operations on device keys.
//!
//! Each algorithm family implements [`FamilyOps`] once. Contexts pick the
//! implementation through [`Family::ops`] and never call the token
//! directly.
//!
//! A session can only run one multi-part operation at a time. HMAC keeps a
//! sign operation open across calls and records its context as the
//! session's active signer until the final call, anything else that wants
//! to sign in the meantime gets `Busy`.

use rand::Rng;

use crate::device::{
    Device, DeviceFlags, DeviceGuard,
    capability::Actions,
    context::DeviceContext,
    error::{DeviceError, map_error},
    mechanism::{Algorithm, Family},
    object::read_bytes,
    token::{Attribute, AttributeType, KeyType, Mechanism, MechanismParam, MechanismType, ObjectClass, ObjectHandle, Rv},
    traced,
    util::rs_to_der,
};

//------------ FamilyOps -----------------------------------------------------

/// The operations one algorithm family performs through a device.
///
/// Permissions and the presence of a key are checked by the caller.
pub(crate) trait FamilyOps: Send + Sync {
    fn encrypt(&self, _ctx: &mut DeviceContext, _data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        Err(DeviceError::NotAvailable)
    }

    fn decrypt(&self, _ctx: &mut DeviceContext, _data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        Err(DeviceError::NotAvailable)
    }

    fn sign(&self, _ctx: &mut DeviceContext, _data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        Err(DeviceError::NotAvailable)
    }

    fn verify(&self, _ctx: &DeviceContext, _data: &[u8], _signature: &[u8]) -> Result<(), DeviceError> {
        Err(DeviceError::NotAvailable)
    }

    /// Feeds one chunk into a MAC. An empty chunk finishes it.
    fn mac(&self, _ctx: &mut DeviceContext, _data: &[u8]) -> Result<Option<Vec<u8>>, DeviceError> {
        Err(DeviceError::NotAvailable)
    }

    /// Key agreement. Without a peer value this returns our own public
    /// value, with one it returns the shared secret.
    fn agree(&self, _ctx: &mut DeviceContext, _peer: Option<&[u8]>) -> Result<Vec<u8>, DeviceError> {
        Err(DeviceError::NotAvailable)
    }
}

impl Family {
    pub(crate) fn ops(self) -> &'static dyn FamilyOps {
        match self {
            Family::Conventional => &ConventionalOps,
            Family::Hmac => &HmacOps,
            Family::Rsa => &RsaOps,
            Family::Dsa => &DsaOps,
            Family::Ecdsa => &EcdsaOps,
            Family::Dh => &DhOps,
        }
    }
}

//------------ Public entry points -------------------------------------------

impl DeviceContext {
    pub fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        self.check_permission(Actions::ENCRYPT)?;
        self.object()?;
        self.algorithm().family().ops().encrypt(self, data)
    }

    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        self.check_permission(Actions::DECRYPT)?;
        self.object()?;
        self.algorithm().family().ops().decrypt(self, data)
    }

    /// Signs `data`, which is a padded block for RSA and a hash otherwise.
    ///
    /// DSA and ECDSA signatures come back DER encoded.
    pub fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        self.check_permission(Actions::SIGN)?;
        self.object()?;
        self.algorithm().family().ops().sign(self, data)
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), DeviceError> {
        self.check_permission(Actions::VERIFY)?;
        self.algorithm().family().ops().verify(self, data, signature)
    }

    /// Adds data to a MAC, or finishes it when `data` is empty.
    ///
    /// Returns the MAC value once finished.
    pub fn mac(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>, DeviceError> {
        self.check_permission(Actions::SIGN)?;
        self.object()?;
        self.algorithm().family().ops().mac(self, data)
    }

    /// First phase of a key agreement: our public value.
    pub fn agreement_public_value(&mut self) -> Result<Vec<u8>, DeviceError> {
        self.check_permission(Actions::DERIVE)?;
        self.object()?;
        self.algorithm().family().ops().agree(self, None)
    }

    /// Second phase of a key agreement: the shared secret.
    pub fn agree(&mut self, peer_public_value: &[u8]) -> Result<Vec<u8>, DeviceError> {
        self.check_permission(Actions::DERIVE)?;
        self.object()?;
        self.algorithm().family().ops().agree(self, Some(peer_public_value))
    }

    /// Fails with `Busy` if another context runs a multi-part operation.
    fn check_not_busy(&self, guard: &DeviceGuard) -> Result<(), DeviceError> {
        match guard.active_signer {
            Some(id) if id != self.id() => Err(DeviceError::Busy),
            _ => Ok(()),
        }
    }
}

impl Device {
    /// Fills `buf` from the token's random number generator.
    pub fn random(&self, buf: &mut [u8]) -> Result<(), DeviceError> {
        let guard = self.lock();
        if !guard.flags.has(DeviceFlags::HAS_RNG) {
            return Err(DeviceError::NotAvailable);
        }
        let session = guard.session()?;
        traced("C_GenerateRandom", guard.token().generate_random(session, buf))
            .map_err(|rv| map_error(rv, DeviceError::RandomFailure))
    }
}

//------------ Helpers -------------------------------------------------------

fn failed(rv: Rv) -> DeviceError {
    map_error(rv, DeviceError::Failed)
}

fn single_sign(
    guard: &DeviceGuard,
    mechanism: MechanismType,
    key: ObjectHandle,
    data: &[u8],
) -> Result<Vec<u8>, DeviceError> {
    let session = guard.session()?;
    let token = guard.token();
    traced("C_SignInit", token.sign_init(session, &Mechanism::new(mechanism), key)).map_err(failed)?;
    traced("C_Sign", token.sign(session, data)).map_err(failed)
}

/// Template for a throwaway secret the value of which is read back.
fn extractable_secret_template() -> Vec<Attribute> {
    vec![
        Attribute::Class(ObjectClass::SECRET_KEY),
        Attribute::KeyType(KeyType::GENERIC_SECRET),
        Attribute::Token(false),
        Attribute::Sensitive(false),
        Attribute::Extractable(true),
    ]
}

/// Reads the value of a throwaway object and destroys it.
fn take_value(guard: &DeviceGuard, object: ObjectHandle) -> Result<Vec<u8>, DeviceError> {
    let res = read_bytes(guard, object, AttributeType::Value);
    let session = guard.session()?;
    if let Err(rv) = traced("C_DestroyObject", guard.token().destroy_object(session, object)) {
        warn!("Failed to destroy temporary object {}: {}", object, rv);
    }
    res
}

/// Signatures are checked in software, whatever the device offers.
fn verify_natively(ctx: &DeviceContext, data: &[u8], signature: &[u8]) -> Result<(), DeviceError> {
    ctx.to_native()?.verify(data, signature)
}

//------------ Conventional --------------------------------------------------

struct ConventionalOps;

impl ConventionalOps {
    fn uses_iv(ctx: &DeviceContext) -> bool {
        ctx.mode().needs_iv() && !ctx.algorithm().is_stream_cipher()
    }

    fn mechanism(ctx: &DeviceContext) -> Result<Mechanism, DeviceError> {
        let record = ctx.record()?;
        let iv = if Self::uses_iv(ctx) {
            if ctx.iv().is_empty() {
                return Err(DeviceError::NotInitialized);
            }
            Some(ctx.iv().to_vec())
        } else {
            None
        };
        let param = match (ctx.algorithm(), iv) {
            (Algorithm::Rc2, iv) => MechanismParam::Rc2 { effective_bits: 128, iv },
            (Algorithm::Rc5, iv) => MechanismParam::Rc5 {
                word_size: 4,
                rounds: 12,
                iv,
            },
            (_, Some(iv)) => MechanismParam::Iv(iv),
            (_, None) => MechanismParam::None,
        };
        Ok(Mechanism::with_param(record.mechanism, param))
    }

    fn check_length(ctx: &DeviceContext, data: &[u8]) -> Result<(), DeviceError> {
        let block_size = ctx.algorithm().native().block_size;
        if block_size > 1 && data.len() % block_size != 0 {
            return Err(DeviceError::argument("data must be a whole number of blocks"));
        }
        Ok(())
    }

    fn last_block(ctx: &DeviceContext, data: &[u8]) -> Option<Vec<u8>> {
        let block_size = ctx.algorithm().native().block_size;
        if Self::uses_iv(ctx) && data.len() >= block_size {
            Some(data[data.len() - block_size..].to_vec())
        } else {
            None
        }
    }
}

impl FamilyOps for ConventionalOps {
    fn encrypt(&self, ctx: &mut DeviceContext, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        Self::check_length(ctx, data)?;
        let mechanism = Self::mechanism(ctx)?;
        let key = ctx.object()?;
        let device = ctx.device().clone();
        let guard = device.lock();
        let session = guard.session()?;
        let token = guard.token();
        traced("C_EncryptInit", token.encrypt_init(session, &mechanism, key)).map_err(failed)?;
        let out = traced("C_Encrypt", token.encrypt(session, data)).map_err(failed)?;
        drop(guard);

        if let Some(iv) = Self::last_block(ctx, &out) {
            ctx.iv = iv;
        }
        Ok(out)
    }

    fn decrypt(&self, ctx: &mut DeviceContext, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        Self::check_length(ctx, data)?;
        let mechanism = Self::mechanism(ctx)?;
        let key = ctx.object()?;
        let next_iv = Self::last_block(ctx, data);
        let device = ctx.device().clone();
        let guard = device.lock();
        let session = guard.session()?;
        let token = guard.token();
        traced("C_DecryptInit", token.decrypt_init(session, &mechanism, key)).map_err(failed)?;
        let out = traced("C_Decrypt", token.decrypt(session, data)).map_err(failed)?;
        drop(guard);

        if let Some(iv) = next_iv {
            ctx.iv = iv;
        }
        Ok(out)
    }
}

//------------ HMAC ----------------------------------------------------------

struct HmacOps;

impl FamilyOps for HmacOps {
    fn mac(&self, ctx: &mut DeviceContext, data: &[u8]) -> Result<Option<Vec<u8>>, DeviceError> {
        let record = ctx.record()?;
        let key = ctx.object()?;
        let mut guard = ctx.lock();
        ctx.check_not_busy(&guard)?;
        let session = guard.session()?;
        let token = guard.token();

        if guard.active_signer.is_none() {
            traced(
                "C_SignInit",
                token.sign_init(session, &Mechanism::new(record.mechanism), key),
            )
            .map_err(failed)?;
            guard.active_signer = Some(ctx.id());
        }

        if !data.is_empty() {
            if let Err(rv) = traced("C_SignUpdate", token.sign_update(session, data)) {
                guard.active_signer = None;
                return Err(failed(rv));
            }
            return Ok(None);
        }

        let res = traced("C_SignFinal", token.sign_final(session));
        guard.active_signer = None;
        res.map(Some).map_err(failed)
    }
}

//------------ RSA -----------------------------------------------------------

struct RsaOps;

/// Strips PKCS #1 padding of the given block type.
///
/// `block` must be a full modulus-sized block, leading zero included.
pub(crate) fn strip_pkcs1_padding(block: &[u8], block_type: u8) -> Result<&[u8], DeviceError> {
    if block.len() < 11 || block[0] != 0 || block[1] != block_type {
        return Err(DeviceError::BadData);
    }
    let padding = &block[2..];
    let end = padding.iter().position(|b| *b == 0).ok_or(DeviceError::BadData)?;
    if end < 8 {
        return Err(DeviceError::BadData);
    }
    if block_type == 1 && padding[..end].iter().any(|b| *b != 0xFF) {
        return Err(DeviceError::BadData);
    }
    Ok(&padding[end + 1..])
}

/// Rebuilds a PKCS #1 type 2 block around a payload.
///
/// The padding is made up on the spot, any non-zero bytes will do.
pub(crate) fn add_pkcs1_type2_padding(payload: &[u8], block_size: usize) -> Result<Vec<u8>, DeviceError> {
    if payload.len() + 11 > block_size {
        return Err(DeviceError::BadData);
    }
    let padding_len = block_size - payload.len() - 3;
    let mut rng = rand::rng();
    let mut block = Vec::with_capacity(block_size);
    block.extend_from_slice(&[0x00, 0x02]);
    block.extend((0..padding_len).map(|_| rng.random_range(1..=u8::MAX)));
    block.push(0);
    block.extend_from_slice(payload);
    Ok(block)
}

fn left_pad(mut data: Vec<u8>, size: usize) -> Vec<u8> {
    if data.len() < size {
        let mut padded = vec![0; size - data.len()];
        padded.append(&mut data);
        padded
    } else {
        data
    }
}

impl RsaOps {
    /// Brings raw input up to the modulus size.
    fn full_block(ctx: &DeviceContext, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        if data.len() > ctx.key_size() {
            return Err(DeviceError::Overflow);
        }
        Ok(left_pad(data.to_vec(), ctx.key_size()))
    }

    /// Decrypts by unwrapping into a readable secret, for keys that may
    /// only unwrap.
    fn unwrap_decrypt(guard: &DeviceGuard, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let session = guard.session()?;
        let object = traced(
            "C_UnwrapKey",
            guard.token().unwrap_key(
                session,
                &Mechanism::new(MechanismType::RSA_PKCS),
                key,
                data,
                &extractable_secret_template(),
            ),
        )
        .map_err(failed)?;
        take_value(guard, object)
    }
}

impl FamilyOps for RsaOps {
    fn encrypt(&self, ctx: &mut DeviceContext, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let block = Self::full_block(ctx, data)?;
        let payload = strip_pkcs1_padding(&block, 2)?;
        let key = ctx.alt_object.map_or_else(|| ctx.object(), Ok)?;
        let guard = ctx.lock();
        let session = guard.session()?;
        let token = guard.token();
        traced(
            "C_EncryptInit",
            token.encrypt_init(session, &Mechanism::new(MechanismType::RSA_PKCS), key),
        )
        .map_err(failed)?;
        let out = traced("C_Encrypt", token.encrypt(session, payload)).map_err(failed)?;
        Ok(left_pad(out, ctx.key_size()))
    }

    fn decrypt(&self, ctx: &mut DeviceContext, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let block = Self::full_block(ctx, data)?;
        let key = ctx.object()?;
        let guard = ctx.lock();
        let session = guard.session()?;
        let token = guard.token();
        let mechanism = Mechanism::new(MechanismType::RSA_PKCS);
        let res = traced("C_DecryptInit", token.decrypt_init(session, &mechanism, key))
            .and_then(|_| traced("C_Decrypt", token.decrypt(session, &block)));
        let payload = match res {
            Ok(payload) => payload,
            Err(Rv::KeyFunctionNotPermitted) => {
                debug!("Key may not decrypt, unwrapping instead");
                Self::unwrap_decrypt(&guard, key, &block)?
            }
            Err(rv) => return Err(failed(rv)),
        };
        drop(guard);
        add_pkcs1_type2_padding(&payload, ctx.key_size())
    }

    fn sign(&self, ctx: &mut DeviceContext, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let block = Self::full_block(ctx, data)?;
        let payload = strip_pkcs1_padding(&block, 1)?;
        let key = ctx.object()?;
        let guard = ctx.lock();
        ctx.check_not_busy(&guard)?;
        let out = single_sign(&guard, MechanismType::RSA_PKCS, key, payload)?;
        Ok(left_pad(out, ctx.key_size()))
    }

    fn verify(&self, ctx: &DeviceContext, data: &[u8], signature: &[u8]) -> Result<(), DeviceError> {
        verify_natively(ctx, data, signature)
    }
}

//------------ DSA and ECDSA -------------------------------------------------

struct DsaOps;

impl FamilyOps for DsaOps {
    fn sign(&self, ctx: &mut DeviceContext, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let key = ctx.object()?;
        let guard = ctx.lock();
        ctx.check_not_busy(&guard)?;
        let rs = single_sign(&guard, MechanismType::DSA, key, data)?;
        drop(guard);
        if rs.len() % 2 != 0 {
            return Err(DeviceError::BadData);
        }
        Ok(rs_to_der(&rs)?)
    }

    fn verify(&self, ctx: &DeviceContext, data: &[u8], signature: &[u8]) -> Result<(), DeviceError> {
        verify_natively(ctx, data, signature)
    }
}

struct EcdsaOps;

impl FamilyOps for EcdsaOps {
    fn sign(&self, ctx: &mut DeviceContext, data: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let key = ctx.object()?;
        let guard = ctx.lock();
        ctx.check_not_busy(&guard)?;
        let rs = single_sign(&guard, MechanismType::ECDSA, key, data)?;
        drop(guard);
        if rs.len() % 2 != 0 {
            return Err(DeviceError::BadData);
        }
        Ok(rs_to_der(&rs)?)
    }

    fn verify(&self, ctx: &DeviceContext, data: &[u8], signature: &[u8]) -> Result<(), DeviceError> {
        verify_natively(ctx, data, signature)
    }
}

//------------ DH ------------------------------------------------------------

struct DhOps;

impl FamilyOps for DhOps {
    fn agree(&self, ctx: &mut DeviceContext, peer: Option<&[u8]>) -> Result<Vec<u8>, DeviceError> {
        let Some(peer) = peer else {
            if let Some(value) = &ctx.dh_public_value {
                return Ok(value.clone());
            }
            let public = ctx.alt_object.ok_or(DeviceError::NotInitialized)?;
            let value = read_bytes(&ctx.lock(), public, AttributeType::Value)?;
            ctx.dh_public_value = Some(value.clone());
            return Ok(value);
        };

        let key = ctx.object()?;
        let guard = ctx.lock();
        let session = guard.session()?;
        let mechanism = Mechanism::with_param(MechanismType::DH_PKCS_DERIVE, MechanismParam::DhPublic(peer.to_vec()));
        let object = traced(
            "C_DeriveKey",
            guard
                .token()
                .derive_key(session, &mechanism, key, &extractable_secret_template()),
        )
        .map_err(|rv| map_error(rv, DeviceError::BadData))?;
        take_value(&guard, object)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_type1_padding() {
        let mut block = vec![0x00, 0x01];
        block.extend_from_slice(&[0xFF; 10]);
        block.push(0);
        block.extend_from_slice(b"payload");
        assert_eq!(strip_pkcs1_padding(&block, 1).unwrap(), b"payload");
        assert!(strip_pkcs1_padding(&block, 2).is_err());
    }

    #[test]
    fn rejects_short_padding() {
        let mut block = vec![0x00, 0x02];
        block.extend_from_slice(&[0x11; 4]);
        block.push(0);
        block.extend_from_slice(&[0x42; 8]);
        assert!(matches!(strip_pkcs1_padding(&block, 2), Err(DeviceError::BadData)));
    }

    #[test]
    fn synthesized_padding_has_no_zeroes() {
        let payload = [7u8; 16];
        for _ in 0..20 {
            let block = add_pkcs1_type2_padding(&payload, 128).unwrap();
            assert_eq!(block.len(), 128);
            assert_eq!(&block[..2], &[0x00, 0x02]);
            assert!(block[2..128 - 17].iter().all(|b| *b != 0));
            assert_eq!(block[128 - 17], 0);
            assert_eq!(strip_pkcs1_padding(&block, 2).unwrap(), &payload);
        }
    }

    #[test]
    fn payload_too_large_for_padding() {
        assert!(add_pkcs1_type2_padding(&[1; 120], 128).is_err());
    }

    #[test]
    fn left_pads_to_size() {
        assert_eq!(left_pad(vec![1, 2], 4), vec![0, 0, 1, 2]);
        assert_eq!(left_pad(vec![1, 2, 3], 2), vec![1, 2, 3]);
    }
}
