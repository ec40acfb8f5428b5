//! An in-process software token.
//!
//! [`SoftToken`] implements the complete [`Token`] contract on top of
//! OpenSSL: sessions, login state, object storage, find cursors and
//! multi-part signing. It also counts calls and can be told to misbehave in
//! the ways real drivers are known to, which is what the test suite relies
//! on.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt,
    sync::{Mutex, MutexGuard, RwLock},
};

use openssl::{
    bn::{BigNum, BigNumContext},
    dh::Dh,
    dsa::{Dsa, DsaSig},
    ec::{EcGroup, EcKey, EcPoint, PointConversionForm},
    ecdsa::EcdsaSig,
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{PKey, Private, Public},
    pkey_ctx::PkeyCtx,
    rsa::{Padding, Rsa, RsaPrivateKeyBuilder},
    symm::{Cipher, Crypter, Mode as SymmMode},
};

use crate::{
    constants::SOFT_TOKEN_DRIVER_NAME,
    device::{
        token::{
            Attribute, AttributeType, KeyType, LibraryInfo, Mechanism, MechanismFlags, MechanismInfo, MechanismParam,
            MechanismType, ObjectClass, ObjectHandle, Rv, SessionHandle, SlotFlags, SlotId, SlotInfo, Token,
            TokenFlags, TokenInfo, UserType,
        },
        util::{Curve, adjust_key_parity, der_octet_string, der_to_rs},
    },
};

//------------ Call counting -------------------------------------------------

#[derive(Clone, Copy, Debug)]
pub enum FnIdx {
    LibraryInfo,
    SlotList,
    SlotInfo,
    TokenInfo,
    MechanismList,
    MechanismInfo,
    InitToken,
    OpenSession,
    CloseSession,
    Login,
    Logout,
    InitPin,
    SetPin,
    CreateObject,
    DestroyObject,
    GetAttribute,
    SetAttributes,
    FindObjectsInit,
    FindObjects,
    FindObjectsFinal,
    EncryptInit,
    Encrypt,
    DecryptInit,
    Decrypt,
    SignInit,
    Sign,
    SignUpdate,
    SignFinal,
    GenerateKey,
    GenerateKeyPair,
    UnwrapKey,
    DeriveKey,
    GenerateRandom,
    Finalize,
    Count,
}

#[derive(Debug)]
pub struct SoftTokenCallCounts {
    call_counts: RwLock<Vec<u32>>,
}

impl SoftTokenCallCounts {
    pub fn new() -> Self {
        let mut call_counts = Vec::with_capacity(FnIdx::Count as usize);
        call_counts.resize(FnIdx::Count as usize, 0);

        Self {
            call_counts: RwLock::new(call_counts),
        }
    }

    pub fn get(&self, fn_idx: FnIdx) -> u32 {
        self.call_counts.read().map(|counts| counts[fn_idx as usize]).unwrap_or(0)
    }

    pub fn inc(&self, fn_idx: FnIdx) {
        if let Ok(mut counts) = self.call_counts.write() {
            counts[fn_idx as usize] += 1;
        }
    }
}

impl Default for SoftTokenCallCounts {
    fn default() -> Self {
        Self::new()
    }
}

//------------ SoftTokenSettings ---------------------------------------------

/// How a software token presents itself, and how it misbehaves.
#[derive(Clone, Debug)]
pub struct SoftTokenSettings {
    pub label: String,
    pub so_pin: Option<String>,
    pub user_pin: Option<String>,
    pub min_pin_len: u64,
    pub max_pin_len: u64,
    pub write_protected: bool,
    pub login_required: bool,
    pub has_rng: bool,
    pub has_clock: bool,
    pub removable: bool,
    /// Cleared to pull a removable token out of its slot.
    pub token_present: bool,
    pub cryptoki_version: (u8, u8),
    pub mechanisms: Vec<(MechanismType, MechanismInfo)>,

    /// Mechanisms whose info query reports success without writing
    /// anything.
    pub untouched_mechanism_info: Vec<MechanismType>,
    /// `C_Login` answers "already logged in" without logging anybody in.
    pub false_already_logged_in: bool,
    /// `C_OpenSession` fails with this value.
    pub open_session_error: Option<Rv>,
    /// `C_Encrypt` fails with this value after a successful init.
    pub encrypt_error: Option<Rv>,
    /// Private keys are created with decryption only allowed via unwrap.
    pub unwrap_only_private_keys: bool,
}

impl Default for SoftTokenSettings {
    fn default() -> Self {
        SoftTokenSettings {
            label: "Soft token".to_string(),
            so_pin: Some("12345678".to_string()),
            user_pin: Some("1234".to_string()),
            min_pin_len: 4,
            max_pin_len: 32,
            write_protected: false,
            login_required: true,
            has_rng: true,
            has_clock: false,
            removable: false,
            token_present: true,
            cryptoki_version: (2, 40),
            mechanisms: default_mechanisms(),
            untouched_mechanism_info: vec![],
            false_already_logged_in: false,
            open_session_error: None,
            encrypt_error: None,
            unwrap_only_private_keys: false,
        }
    }
}

/// The mechanisms a software token supports out of the box.
pub fn default_mechanisms() -> Vec<(MechanismType, MechanismInfo)> {
    let crypt = MechanismFlags::ENCRYPT | MechanismFlags::DECRYPT;
    let sign = MechanismFlags::SIGN | MechanismFlags::VERIFY;
    let info = |min, max, flags| MechanismInfo {
        min_key_size: min,
        max_key_size: max,
        flags,
    };

    vec![
        (MechanismType::DES_ECB, info(8, 8, crypt)),
        (MechanismType::DES_CBC, info(8, 8, crypt)),
        (MechanismType::DES_KEY_GEN, info(8, 8, MechanismFlags::GENERATE)),
        (MechanismType::DES3_ECB, info(24, 24, crypt)),
        (MechanismType::DES3_CBC, info(24, 24, crypt)),
        (MechanismType::DES3_KEY_GEN, info(24, 24, MechanismFlags::GENERATE)),
        (MechanismType::AES_ECB, info(16, 32, crypt)),
        (MechanismType::AES_CBC, info(16, 32, crypt)),
        (MechanismType::AES_KEY_GEN, info(16, 32, MechanismFlags::GENERATE)),
        (MechanismType::SHA_1_HMAC, info(8, 256, sign)),
        (MechanismType::SHA256_HMAC, info(8, 256, sign)),
        (MechanismType::GENERIC_SECRET_KEY_GEN, info(8, 256, MechanismFlags::GENERATE)),
        (
            MechanismType::RSA_PKCS,
            info(1024, 4096, crypt | sign | MechanismFlags::UNWRAP),
        ),
        (MechanismType::RSA_X_509, info(1024, 4096, crypt | sign)),
        (
            MechanismType::RSA_PKCS_KEY_PAIR_GEN,
            info(1024, 4096, MechanismFlags::GENERATE_KEY_PAIR),
        ),
        (MechanismType::DSA, info(1024, 3072, sign)),
        (
            MechanismType::DSA_KEY_PAIR_GEN,
            info(1024, 3072, MechanismFlags::GENERATE_KEY_PAIR),
        ),
        (
            MechanismType::ECDSA,
            info(
                256,
                521,
                sign | MechanismFlags::EC_F_P | MechanismFlags::EC_NAMEDCURVE | MechanismFlags::EC_UNCOMPRESS,
            ),
        ),
        (
            MechanismType::EC_KEY_PAIR_GEN,
            info(256, 521, MechanismFlags::GENERATE_KEY_PAIR),
        ),
        (MechanismType::DH_PKCS_DERIVE, info(1024, 4096, MechanismFlags::DERIVE)),
        (
            MechanismType::DH_PKCS_KEY_PAIR_GEN,
            info(1024, 4096, MechanismFlags::GENERATE_KEY_PAIR),
        ),
    ]
}

//------------ Internal state ------------------------------------------------

#[derive(Clone, Debug)]
struct SoftObject {
    attributes: BTreeMap<AttributeType, Attribute>,
    /// Set for session objects, which go away with their session.
    session: Option<SessionHandle>,
}

impl SoftObject {
    fn new(template: &[Attribute], session: SessionHandle) -> Self {
        let mut attributes = BTreeMap::new();
        for attr in template {
            attributes.insert(attr.attribute_type(), attr.clone());
        }
        let is_token = attributes
            .get(&AttributeType::Token)
            .and_then(Attribute::as_bool)
            .unwrap_or(false);
        SoftObject {
            attributes,
            session: if is_token { None } else { Some(session) },
        }
    }

    fn set(&mut self, attr: Attribute) {
        self.attributes.insert(attr.attribute_type(), attr);
    }

    fn flag(&self, attr: AttributeType) -> bool {
        self.attributes.get(&attr).and_then(Attribute::as_bool).unwrap_or(false)
    }

    fn bytes(&self, attr: AttributeType) -> Result<&[u8], Rv> {
        self.attributes
            .get(&attr)
            .and_then(Attribute::as_bytes)
            .ok_or(Rv::TemplateIncomplete)
    }

    fn bignum(&self, attr: AttributeType) -> Result<BigNum, Rv> {
        BigNum::from_slice(self.bytes(attr)?).map_err(ossl)
    }

    fn class(&self) -> Option<ObjectClass> {
        match self.attributes.get(&AttributeType::Class) {
            Some(Attribute::Class(class)) => Some(*class),
            _ => None,
        }
    }

    fn key_type(&self) -> Option<KeyType> {
        match self.attributes.get(&AttributeType::KeyType) {
            Some(Attribute::KeyType(key_type)) => Some(*key_type),
            _ => None,
        }
    }

    fn matches(&self, template: &[Attribute]) -> bool {
        template
            .iter()
            .all(|attr| self.attributes.get(&attr.attribute_type()) == Some(attr))
    }

    fn is_sensitive(&self, attr: AttributeType) -> bool {
        let unextractable =
            self.attributes.contains_key(&AttributeType::Extractable) && !self.flag(AttributeType::Extractable);
        let hidden = self.flag(AttributeType::Sensitive) || unextractable;
        match attr {
            AttributeType::PrivateExponent
            | AttributeType::Prime1
            | AttributeType::Prime2
            | AttributeType::Exponent1
            | AttributeType::Exponent2
            | AttributeType::Coefficient => true,
            AttributeType::Value => {
                self.class() != Some(ObjectClass::PUBLIC_KEY)
                    && self.class() != Some(ObjectClass::CERTIFICATE)
                    && hidden
            }
            _ => false,
        }
    }

    fn rsa_public(&self) -> Result<Rsa<Public>, Rv> {
        Rsa::from_public_components(self.bignum(AttributeType::Modulus)?, self.bignum(AttributeType::PublicExponent)?)
            .map_err(ossl)
    }

    fn rsa_private(&self) -> Result<Rsa<Private>, Rv> {
        let n = self.bignum(AttributeType::Modulus)?;
        let e = self.bignum(AttributeType::PublicExponent)?;
        let d = self.bignum(AttributeType::PrivateExponent)?;
        if self.attributes.contains_key(&AttributeType::Prime1) {
            Rsa::from_private_components(
                n,
                e,
                d,
                self.bignum(AttributeType::Prime1)?,
                self.bignum(AttributeType::Prime2)?,
                self.bignum(AttributeType::Exponent1)?,
                self.bignum(AttributeType::Exponent2)?,
                self.bignum(AttributeType::Coefficient)?,
            )
            .map_err(ossl)
        } else {
            RsaPrivateKeyBuilder::new(n, e, d).map_err(ossl).map(|builder| builder.build())
        }
    }

    fn curve(&self) -> Result<Curve, Rv> {
        Curve::from_params(self.bytes(AttributeType::EcParams)?).ok_or(Rv::AttributeValueInvalid)
    }
}

#[derive(Clone, Debug)]
struct ActiveOp {
    mechanism: Mechanism,
    key: ObjectHandle,
}

#[derive(Debug, Default)]
struct SoftSession {
    read_write: bool,
    find: Option<VecDeque<ObjectHandle>>,
    encrypt: Option<ActiveOp>,
    decrypt: Option<ActiveOp>,
    sign: Option<(ActiveOp, Vec<u8>)>,
}

#[derive(Debug)]
struct SoftState {
    settings: SoftTokenSettings,
    sessions: HashMap<SessionHandle, SoftSession>,
    objects: BTreeMap<ObjectHandle, SoftObject>,
    next_handle: u64,
    logged_in: Option<UserType>,
    finalized: bool,
}

impl SoftState {
    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn session(&mut self, session: SessionHandle) -> Result<&mut SoftSession, Rv> {
        if self.finalized {
            return Err(Rv::CryptokiNotInitialized);
        }
        self.sessions.get_mut(&session).ok_or(Rv::SessionHandleInvalid)
    }

    fn object(&self, object: ObjectHandle) -> Result<&SoftObject, Rv> {
        let obj = self.objects.get(&object).ok_or(Rv::ObjectHandleInvalid)?;
        if obj.flag(AttributeType::Private) && self.logged_in.is_none() && self.settings.login_required {
            return Err(Rv::ObjectHandleInvalid);
        }
        Ok(obj)
    }

    fn key(&self, key: ObjectHandle) -> Result<&SoftObject, Rv> {
        self.object(key).map_err(|_| Rv::KeyHandleInvalid)
    }

    fn check_mechanism(&self, mechanism: MechanismType) -> Result<(), Rv> {
        if self.settings.mechanisms.iter().any(|(mech, _)| *mech == mechanism) {
            Ok(())
        } else {
            Err(Rv::MechanismInvalid)
        }
    }

    fn token_flags(&self) -> TokenFlags {
        let settings = &self.settings;
        let mut flags = 0;
        if settings.has_rng {
            flags |= TokenFlags::RNG;
        }
        if settings.write_protected {
            flags |= TokenFlags::WRITE_PROTECTED;
        }
        if settings.login_required {
            flags |= TokenFlags::LOGIN_REQUIRED;
        }
        if settings.user_pin.is_some() {
            flags |= TokenFlags::USER_PIN_INITIALIZED;
        }
        if settings.has_clock {
            flags |= TokenFlags::CLOCK_ON_TOKEN;
        }
        if settings.so_pin.is_some() {
            flags |= TokenFlags::TOKEN_INITIALIZED;
        }
        TokenFlags(flags)
    }

    /// Adds an object, refusing what the session or login state forbids.
    fn add_object(&mut self, session: SessionHandle, object: SoftObject) -> Result<ObjectHandle, Rv> {
        let read_write = self.session(session)?.read_write;
        if object.session.is_none() && !read_write {
            return Err(Rv::SessionReadOnly);
        }
        if object.flag(AttributeType::Private) && self.settings.login_required && self.logged_in.is_none() {
            return Err(Rv::UserNotLoggedIn);
        }
        let handle = self.next();
        self.objects.insert(handle, object);
        Ok(handle)
    }
}

//------------ SoftToken -----------------------------------------------------

pub struct SoftToken {
    state: Mutex<SoftState>,
    fn_call_counts: SoftTokenCallCounts,
}

impl fmt::Debug for SoftToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftToken").finish()
    }
}

/// The only slot a software token has.
pub const SOFT_TOKEN_SLOT: SlotId = 1;

impl SoftToken {
    pub fn new(settings: SoftTokenSettings) -> Self {
        SoftToken {
            state: Mutex::new(SoftState {
                settings,
                sessions: HashMap::new(),
                objects: BTreeMap::new(),
                next_handle: 0,
                logged_in: None,
                finalized: false,
            }),
            fn_call_counts: SoftTokenCallCounts::new(),
        }
    }

    pub fn call_counts(&self) -> &SoftTokenCallCounts {
        &self.fn_call_counts
    }

    /// The attributes stored for an object, sensitive ones included.
    pub fn object_attributes(&self, object: ObjectHandle) -> Option<Vec<Attribute>> {
        self.state()
            .objects
            .get(&object)
            .map(|obj| obj.attributes.values().cloned().collect())
    }

    /// The number of objects currently stored.
    pub fn object_count(&self) -> usize {
        self.state().objects.len()
    }

    /// Changes the settings of a running token.
    pub fn update_settings(&self, op: impl FnOnce(&mut SoftTokenSettings)) {
        op(&mut self.state().settings)
    }

    /// Stores an object directly, bypassing sessions and login.
    pub fn insert_object(&self, template: &[Attribute]) -> ObjectHandle {
        let mut state = self.state();
        let handle = state.next();
        let mut object = SoftObject::new(template, 0);
        object.session = None;
        state.objects.insert(handle, object);
        handle
    }

    fn state(&self) -> MutexGuard<'_, SoftState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_slot(slot: SlotId) -> Result<(), Rv> {
        if slot == SOFT_TOKEN_SLOT {
            Ok(())
        } else {
            Err(Rv::ArgumentsBad)
        }
    }

    fn check_pin(state: &SoftState, pin: &str) -> Result<(), Rv> {
        let len = pin.len() as u64;
        if len < state.settings.min_pin_len || len > state.settings.max_pin_len {
            return Err(Rv::PinLenRange);
        }
        Ok(())
    }
}

fn ossl(_err: ErrorStack) -> Rv {
    Rv::FunctionFailed
}

fn bool_attr(template: &[Attribute], attr: AttributeType) -> Option<bool> {
    template
        .iter()
        .find(|a| a.attribute_type() == attr)
        .and_then(Attribute::as_bool)
}

fn bytes_attr(template: &[Attribute], attr: AttributeType) -> Option<&[u8]> {
    template
        .iter()
        .find(|a| a.attribute_type() == attr)
        .and_then(Attribute::as_bytes)
}

fn ulong_attr(template: &[Attribute], attr: AttributeType) -> Option<u64> {
    template
        .iter()
        .find(|a| a.attribute_type() == attr)
        .and_then(Attribute::as_ulong)
}

//------------ Crypto helpers ------------------------------------------------

fn symmetric_cipher(mechanism: MechanismType, key_len: usize) -> Result<Cipher, Rv> {
    let cipher = match (mechanism, key_len) {
        (MechanismType::DES_ECB, 8) => Cipher::des_ecb(),
        (MechanismType::DES_CBC, 8) => Cipher::des_cbc(),
        (MechanismType::DES3_ECB, 24) => Cipher::des_ede3(),
        (MechanismType::DES3_CBC, 24) => Cipher::des_ede3_cbc(),
        (MechanismType::AES_ECB, 16) => Cipher::aes_128_ecb(),
        (MechanismType::AES_ECB, 24) => Cipher::aes_192_ecb(),
        (MechanismType::AES_ECB, 32) => Cipher::aes_256_ecb(),
        (MechanismType::AES_CBC, 16) => Cipher::aes_128_cbc(),
        (MechanismType::AES_CBC, 24) => Cipher::aes_192_cbc(),
        (MechanismType::AES_CBC, 32) => Cipher::aes_256_cbc(),
        (MechanismType::DES_ECB, _)
        | (MechanismType::DES_CBC, _)
        | (MechanismType::DES3_ECB, _)
        | (MechanismType::DES3_CBC, _)
        | (MechanismType::AES_ECB, _)
        | (MechanismType::AES_CBC, _) => return Err(Rv::KeySizeRange),
        _ => return Err(Rv::MechanismInvalid),
    };
    Ok(cipher)
}

fn symmetric_crypt(op: &ActiveOp, key: &SoftObject, mode: SymmMode, data: &[u8]) -> Result<Vec<u8>, Rv> {
    let key_value = key.bytes(AttributeType::Value)?;
    let cipher = symmetric_cipher(op.mechanism.mechanism_type, key_value.len())?;
    if data.len() % cipher.block_size() != 0 {
        return Err(match mode {
            SymmMode::Encrypt => Rv::DataLenRange,
            SymmMode::Decrypt => Rv::EncryptedDataLenRange,
        });
    }
    let iv = match &op.mechanism.param {
        MechanismParam::Iv(iv) => Some(iv.as_slice()),
        MechanismParam::None => None,
        _ => return Err(Rv::MechanismParamInvalid),
    };
    if cipher.iv_len().is_some() != iv.is_some() {
        return Err(Rv::MechanismParamInvalid);
    }

    let mut crypter = Crypter::new(cipher, mode, key_value, iv).map_err(ossl)?;
    crypter.pad(false);
    let mut out = vec![0; data.len() + cipher.block_size()];
    let mut count = crypter.update(data, &mut out).map_err(ossl)?;
    count += crypter.finalize(&mut out[count..]).map_err(ossl)?;
    out.truncate(count);
    Ok(out)
}

fn hmac_digest(mechanism: MechanismType) -> Result<MessageDigest, Rv> {
    match mechanism {
        MechanismType::MD5_HMAC => Ok(MessageDigest::md5()),
        MechanismType::SHA_1_HMAC => Ok(MessageDigest::sha1()),
        MechanismType::RIPEMD160_HMAC => Ok(MessageDigest::ripemd160()),
        MechanismType::SHA256_HMAC => Ok(MessageDigest::sha256()),
        _ => Err(Rv::MechanismInvalid),
    }
}

fn hmac(mechanism: MechanismType, key: &SoftObject, data: &[u8]) -> Result<Vec<u8>, Rv> {
    let digest = hmac_digest(mechanism)?;
    let pkey = PKey::hmac(key.bytes(AttributeType::Value)?).map_err(ossl)?;
    let mut signer = openssl::sign::Signer::new(digest, &pkey).map_err(ossl)?;
    signer.update(data).map_err(ossl)?;
    signer.sign_to_vec().map_err(ossl)
}

fn rsa_padding(mechanism: MechanismType) -> Result<Padding, Rv> {
    match mechanism {
        MechanismType::RSA_PKCS => Ok(Padding::PKCS1),
        MechanismType::RSA_X_509 => Ok(Padding::NONE),
        _ => Err(Rv::MechanismInvalid),
    }
}

fn dsa_private(key: &SoftObject) -> Result<PKey<Private>, Rv> {
    let p = key.bignum(AttributeType::Prime)?;
    let q = key.bignum(AttributeType::Subprime)?;
    let g = key.bignum(AttributeType::Base)?;
    let x = key.bignum(AttributeType::Value)?;
    let mut ctx = BigNumContext::new().map_err(ossl)?;
    let mut y = BigNum::new().map_err(ossl)?;
    y.mod_exp(&g, &x, &p, &mut ctx).map_err(ossl)?;
    let dsa = Dsa::from_private_components(p, q, g, x, y).map_err(ossl)?;
    PKey::from_dsa(dsa).map_err(ossl)
}

fn ec_private(key: &SoftObject) -> Result<(EcKey<Private>, Curve), Rv> {
    let curve = key.curve()?;
    let group = EcGroup::from_curve_name(curve.nid()).map_err(ossl)?;
    let d = key.bignum(AttributeType::Value)?;
    let ctx = BigNumContext::new().map_err(ossl)?;
    let mut point = EcPoint::new(&group).map_err(ossl)?;
    point.mul_generator(&group, &d, &ctx).map_err(ossl)?;
    let ec = EcKey::from_private_components(&group, &d, &point).map_err(ossl)?;
    Ok((ec, curve))
}

fn sign_once(op: &ActiveOp, key: &SoftObject, data: &[u8]) -> Result<Vec<u8>, Rv> {
    match op.mechanism.mechanism_type {
        MechanismType::MD5_HMAC
        | MechanismType::SHA_1_HMAC
        | MechanismType::RIPEMD160_HMAC
        | MechanismType::SHA256_HMAC => hmac(op.mechanism.mechanism_type, key, data),
        MechanismType::RSA_PKCS | MechanismType::RSA_X_509 => {
            let rsa = key.rsa_private()?;
            let padding = rsa_padding(op.mechanism.mechanism_type)?;
            let mut out = vec![0; rsa.size() as usize];
            let len = rsa
                .private_encrypt(data, &mut out, padding)
                .map_err(|_| Rv::DataLenRange)?;
            out.truncate(len);
            Ok(out)
        }
        MechanismType::DSA => {
            let pkey = dsa_private(key)?;
            let q_len = key.bytes(AttributeType::Subprime)?.len();
            let mut ctx = PkeyCtx::new(&pkey).map_err(ossl)?;
            ctx.sign_init().map_err(ossl)?;
            let mut der = vec![];
            ctx.sign_to_vec(data, &mut der).map_err(ossl)?;
            let sig = DsaSig::from_der(&der).map_err(ossl)?;
            let mut out = sig.r().to_vec_padded(q_len as i32).map_err(ossl)?;
            out.extend_from_slice(&sig.s().to_vec_padded(q_len as i32).map_err(ossl)?);
            Ok(out)
        }
        MechanismType::ECDSA => {
            let (ec, curve) = ec_private(key)?;
            let sig = EcdsaSig::sign(data, &ec).map_err(ossl)?;
            der_to_rs(&sig.to_der().map_err(ossl)?, curve.field_size()).map_err(ossl)
        }
        _ => Err(Rv::MechanismInvalid),
    }
}

fn rsa_encrypt(op: &ActiveOp, key: &SoftObject, data: &[u8]) -> Result<Vec<u8>, Rv> {
    let rsa = key.rsa_public()?;
    let padding = rsa_padding(op.mechanism.mechanism_type)?;
    let mut out = vec![0; rsa.size() as usize];
    let len = rsa
        .public_encrypt(data, &mut out, padding)
        .map_err(|_| Rv::DataLenRange)?;
    out.truncate(len);
    Ok(out)
}

fn rsa_decrypt(mechanism: MechanismType, key: &SoftObject, data: &[u8]) -> Result<Vec<u8>, Rv> {
    let rsa = key.rsa_private()?;
    let padding = rsa_padding(mechanism)?;
    if data.len() != rsa.size() as usize {
        return Err(Rv::EncryptedDataLenRange);
    }
    let mut out = vec![0; rsa.size() as usize];
    let len = rsa
        .private_decrypt(data, &mut out, padding)
        .map_err(|_| Rv::EncryptedDataInvalid)?;
    out.truncate(len);
    Ok(out)
}

//------------ Token impl ----------------------------------------------------

impl Token for SoftToken {
    fn library_info(&self) -> Result<LibraryInfo, Rv> {
        self.fn_call_counts.inc(FnIdx::LibraryInfo);
        let state = self.state();
        Ok(LibraryInfo {
            cryptoki_version: state.settings.cryptoki_version,
            manufacturer: "NLnet Labs".to_string(),
            description: format!("{:<32}", SOFT_TOKEN_DRIVER_NAME),
        })
    }

    fn slot_list(&self) -> Result<Vec<SlotId>, Rv> {
        self.fn_call_counts.inc(FnIdx::SlotList);
        Ok(vec![SOFT_TOKEN_SLOT])
    }

    fn slot_info(&self, slot: SlotId) -> Result<SlotInfo, Rv> {
        self.fn_call_counts.inc(FnIdx::SlotInfo);
        Self::check_slot(slot)?;
        let state = self.state();
        let mut flags = 0;
        if state.settings.token_present {
            flags |= SlotFlags::TOKEN_PRESENT;
        }
        if state.settings.removable {
            flags |= SlotFlags::REMOVABLE_DEVICE;
        }
        Ok(SlotInfo {
            description: "Software slot".to_string(),
            manufacturer: "NLnet Labs".to_string(),
            flags: SlotFlags(flags),
        })
    }

    fn token_info(&self, slot: SlotId) -> Result<TokenInfo, Rv> {
        self.fn_call_counts.inc(FnIdx::TokenInfo);
        Self::check_slot(slot)?;
        let state = self.state();
        if !state.settings.token_present {
            return Err(Rv::TokenNotPresent);
        }
        let utc_time = if state.settings.has_clock {
            chrono::Utc::now().format("%Y%m%d%H%M%S00").to_string()
        } else {
            String::new()
        };
        Ok(TokenInfo {
            label: format!("{:<32}", state.settings.label),
            manufacturer: "NLnet Labs".to_string(),
            model: "p11device soft".to_string(),
            serial_number: "0000000000000001".to_string(),
            flags: state.token_flags(),
            min_pin_len: state.settings.min_pin_len,
            max_pin_len: state.settings.max_pin_len,
            utc_time,
        })
    }

    fn mechanism_list(&self, slot: SlotId) -> Result<Vec<MechanismType>, Rv> {
        self.fn_call_counts.inc(FnIdx::MechanismList);
        Self::check_slot(slot)?;
        let state = self.state();
        let mut list: Vec<_> = state.settings.mechanisms.iter().map(|(mech, _)| *mech).collect();
        for mech in &state.settings.untouched_mechanism_info {
            if !list.contains(mech) {
                list.push(*mech);
            }
        }
        Ok(list)
    }

    fn mechanism_info(&self, slot: SlotId, mechanism: MechanismType, info: &mut MechanismInfo) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::MechanismInfo);
        Self::check_slot(slot)?;
        let state = self.state();
        if state.settings.untouched_mechanism_info.contains(&mechanism) {
            return Ok(());
        }
        let found = state
            .settings
            .mechanisms
            .iter()
            .find(|(mech, _)| *mech == mechanism)
            .ok_or(Rv::MechanismInvalid)?;
        *info = found.1;
        Ok(())
    }

    fn init_token(&self, slot: SlotId, so_pin: &str, label: &str) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::InitToken);
        Self::check_slot(slot)?;
        let mut state = self.state();
        Self::check_pin(&state, so_pin)?;
        if !state.sessions.is_empty() {
            return Err(Rv::SessionExists);
        }
        if state.settings.write_protected {
            return Err(Rv::TokenWriteProtected);
        }
        if let Some(current) = &state.settings.so_pin {
            if current != so_pin {
                return Err(Rv::PinIncorrect);
            }
        }
        state.objects.clear();
        state.logged_in = None;
        state.settings.so_pin = Some(so_pin.to_string());
        state.settings.user_pin = None;
        state.settings.label = label.trim_end().to_string();
        Ok(())
    }

    fn open_session(&self, slot: SlotId, read_write: bool) -> Result<SessionHandle, Rv> {
        self.fn_call_counts.inc(FnIdx::OpenSession);
        Self::check_slot(slot)?;
        let mut state = self.state();
        if state.finalized {
            return Err(Rv::CryptokiNotInitialized);
        }
        if let Some(rv) = state.settings.open_session_error {
            return Err(rv);
        }
        if read_write && state.settings.write_protected {
            return Err(Rv::TokenWriteProtected);
        }
        let handle = state.next();
        state.sessions.insert(
            handle,
            SoftSession {
                read_write,
                ..Default::default()
            },
        );
        Ok(handle)
    }

    fn close_session(&self, session: SessionHandle) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::CloseSession);
        let mut state = self.state();
        state.sessions.remove(&session).ok_or(Rv::SessionHandleInvalid)?;
        state.objects.retain(|_, obj| obj.session != Some(session));
        if state.sessions.is_empty() {
            state.logged_in = None;
        }
        Ok(())
    }

    fn login(&self, session: SessionHandle, user_type: UserType, pin: &str) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::Login);
        let mut state = self.state();
        let read_write = state.session(session)?.read_write;
        if state.settings.false_already_logged_in {
            return Err(Rv::UserAlreadyLoggedIn);
        }
        if let Some(current) = state.logged_in {
            return Err(if current == user_type {
                Rv::UserAlreadyLoggedIn
            } else {
                Rv::UserAnotherAlreadyLoggedIn
            });
        }
        let expected = match user_type {
            UserType::So => {
                if !read_write {
                    return Err(Rv::SessionReadOnlyExists);
                }
                state.settings.so_pin.clone()
            }
            UserType::User => Some(state.settings.user_pin.clone().ok_or(Rv::UserPinNotInitialized)?),
        };
        match expected {
            Some(expected) if expected == pin => {
                state.logged_in = Some(user_type);
                Ok(())
            }
            _ => Err(Rv::PinIncorrect),
        }
    }

    fn logout(&self, session: SessionHandle) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::Logout);
        let mut state = self.state();
        state.session(session)?;
        if state.logged_in.take().is_none() {
            return Err(Rv::UserNotLoggedIn);
        }
        Ok(())
    }

    fn init_pin(&self, session: SessionHandle, pin: &str) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::InitPin);
        let mut state = self.state();
        state.session(session)?;
        if state.logged_in != Some(UserType::So) {
            return Err(Rv::UserNotLoggedIn);
        }
        Self::check_pin(&state, pin)?;
        state.settings.user_pin = Some(pin.to_string());
        Ok(())
    }

    fn set_pin(&self, session: SessionHandle, old_pin: &str, new_pin: &str) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::SetPin);
        let mut state = self.state();
        if !state.session(session)?.read_write {
            return Err(Rv::SessionReadOnly);
        }
        Self::check_pin(&state, new_pin)?;
        let target = match state.logged_in {
            Some(UserType::So) => &mut state.settings.so_pin,
            _ => &mut state.settings.user_pin,
        };
        match target {
            Some(current) if current == old_pin => {
                *current = new_pin.to_string();
                Ok(())
            }
            Some(_) => Err(Rv::PinIncorrect),
            None => Err(Rv::UserPinNotInitialized),
        }
    }

    fn create_object(&self, session: SessionHandle, template: &[Attribute]) -> Result<ObjectHandle, Rv> {
        self.fn_call_counts.inc(FnIdx::CreateObject);
        let mut state = self.state();
        if bool_attr(template, AttributeType::Token).unwrap_or(false) && state.settings.write_protected {
            return Err(Rv::TokenWriteProtected);
        }
        let object = SoftObject::new(template, session);
        let class = object.class().ok_or(Rv::TemplateIncomplete)?;
        if class != ObjectClass::CERTIFICATE {
            object.key_type().ok_or(Rv::TemplateIncomplete)?;
        }
        state.add_object(session, object)
    }

    fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::DestroyObject);
        let mut state = self.state();
        let read_write = state.session(session)?.read_write;
        let obj = state.object(object)?;
        if obj.session.is_none() && !read_write {
            return Err(Rv::SessionReadOnly);
        }
        state.objects.remove(&object);
        Ok(())
    }

    fn get_attribute(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: AttributeType,
    ) -> Result<Attribute, Rv> {
        self.fn_call_counts.inc(FnIdx::GetAttribute);
        let mut state = self.state();
        state.session(session)?;
        let obj = state.object(object)?;
        if obj.is_sensitive(attribute) {
            return Err(Rv::AttributeSensitive);
        }
        obj.attributes.get(&attribute).cloned().ok_or(Rv::AttributeTypeInvalid)
    }

    fn set_attributes(&self, session: SessionHandle, object: ObjectHandle, template: &[Attribute]) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::SetAttributes);
        let mut state = self.state();
        let read_write = state.session(session)?.read_write;
        let is_token = state.object(object)?.session.is_none();
        if is_token && !read_write {
            return Err(Rv::SessionReadOnly);
        }
        let obj = state.objects.get_mut(&object).ok_or(Rv::ObjectHandleInvalid)?;
        for attr in template {
            obj.set(attr.clone());
        }
        Ok(())
    }

    fn find_objects_init(&self, session: SessionHandle, template: &[Attribute]) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::FindObjectsInit);
        let mut state = self.state();
        if state.session(session)?.find.is_some() {
            return Err(Rv::OperationActive);
        }
        let hide_private = state.settings.login_required && state.logged_in.is_none();
        let found: VecDeque<ObjectHandle> = state
            .objects
            .iter()
            .filter(|(_, obj)| !(hide_private && obj.flag(AttributeType::Private)))
            .filter(|(_, obj)| obj.session.is_none() || obj.session == Some(session))
            .filter(|(_, obj)| obj.matches(template))
            .map(|(handle, _)| *handle)
            .collect();
        state.session(session)?.find = Some(found);
        Ok(())
    }

    fn find_objects(&self, session: SessionHandle, max: usize) -> Result<Vec<ObjectHandle>, Rv> {
        self.fn_call_counts.inc(FnIdx::FindObjects);
        let mut state = self.state();
        let find = state.session(session)?.find.as_mut().ok_or(Rv::OperationNotInitialized)?;
        let count = max.min(find.len());
        Ok(find.drain(..count).collect())
    }

    fn find_objects_final(&self, session: SessionHandle) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::FindObjectsFinal);
        let mut state = self.state();
        state.session(session)?.find.take().ok_or(Rv::OperationNotInitialized)?;
        Ok(())
    }

    fn encrypt_init(&self, session: SessionHandle, mechanism: &Mechanism, key: ObjectHandle) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::EncryptInit);
        let mut state = self.state();
        state.check_mechanism(mechanism.mechanism_type)?;
        let obj = state.key(key)?;
        let allowed = if obj.class() == Some(ObjectClass::PRIVATE_KEY) {
            true
        } else {
            obj.flag(AttributeType::Encrypt)
        };
        if !allowed {
            return Err(Rv::KeyFunctionNotPermitted);
        }
        let sess = state.session(session)?;
        if sess.encrypt.is_some() {
            return Err(Rv::OperationActive);
        }
        sess.encrypt = Some(ActiveOp {
            mechanism: mechanism.clone(),
            key,
        });
        Ok(())
    }

    fn encrypt(&self, session: SessionHandle, data: &[u8]) -> Result<Vec<u8>, Rv> {
        self.fn_call_counts.inc(FnIdx::Encrypt);
        let mut state = self.state();
        let op = state.session(session)?.encrypt.take().ok_or(Rv::OperationNotInitialized)?;
        if let Some(rv) = state.settings.encrypt_error {
            return Err(rv);
        }
        let key = state.key(op.key)?;
        match op.mechanism.mechanism_type {
            MechanismType::RSA_PKCS | MechanismType::RSA_X_509 => rsa_encrypt(&op, key, data),
            _ => symmetric_crypt(&op, key, SymmMode::Encrypt, data),
        }
    }

    fn decrypt_init(&self, session: SessionHandle, mechanism: &Mechanism, key: ObjectHandle) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::DecryptInit);
        let mut state = self.state();
        state.check_mechanism(mechanism.mechanism_type)?;
        if !state.key(key)?.flag(AttributeType::Decrypt) {
            return Err(Rv::KeyFunctionNotPermitted);
        }
        let sess = state.session(session)?;
        if sess.decrypt.is_some() {
            return Err(Rv::OperationActive);
        }
        sess.decrypt = Some(ActiveOp {
            mechanism: mechanism.clone(),
            key,
        });
        Ok(())
    }

    fn decrypt(&self, session: SessionHandle, data: &[u8]) -> Result<Vec<u8>, Rv> {
        self.fn_call_counts.inc(FnIdx::Decrypt);
        let mut state = self.state();
        let op = state.session(session)?.decrypt.take().ok_or(Rv::OperationNotInitialized)?;
        let key = state.key(op.key)?;
        match op.mechanism.mechanism_type {
            MechanismType::RSA_PKCS | MechanismType::RSA_X_509 => rsa_decrypt(op.mechanism.mechanism_type, key, data),
            _ => symmetric_crypt(&op, key, SymmMode::Decrypt, data),
        }
    }

    fn sign_init(&self, session: SessionHandle, mechanism: &Mechanism, key: ObjectHandle) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::SignInit);
        let mut state = self.state();
        state.check_mechanism(mechanism.mechanism_type)?;
        if !state.key(key)?.flag(AttributeType::Sign) {
            return Err(Rv::KeyFunctionNotPermitted);
        }
        let sess = state.session(session)?;
        if sess.sign.is_some() {
            return Err(Rv::OperationActive);
        }
        sess.sign = Some((
            ActiveOp {
                mechanism: mechanism.clone(),
                key,
            },
            vec![],
        ));
        Ok(())
    }

    fn sign(&self, session: SessionHandle, data: &[u8]) -> Result<Vec<u8>, Rv> {
        self.fn_call_counts.inc(FnIdx::Sign);
        let mut state = self.state();
        let (op, _) = state.session(session)?.sign.take().ok_or(Rv::OperationNotInitialized)?;
        let key = state.key(op.key)?;
        sign_once(&op, key, data)
    }

    fn sign_update(&self, session: SessionHandle, data: &[u8]) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::SignUpdate);
        let mut state = self.state();
        let (_, buffered) = state.session(session)?.sign.as_mut().ok_or(Rv::OperationNotInitialized)?;
        buffered.extend_from_slice(data);
        Ok(())
    }

    fn sign_final(&self, session: SessionHandle) -> Result<Vec<u8>, Rv> {
        self.fn_call_counts.inc(FnIdx::SignFinal);
        let mut state = self.state();
        let (op, buffered) = state.session(session)?.sign.take().ok_or(Rv::OperationNotInitialized)?;
        let key = state.key(op.key)?;
        sign_once(&op, key, &buffered)
    }

    fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        template: &[Attribute],
    ) -> Result<ObjectHandle, Rv> {
        self.fn_call_counts.inc(FnIdx::GenerateKey);
        let mut state = self.state();
        state.check_mechanism(mechanism.mechanism_type)?;
        let (key_type, len) = match mechanism.mechanism_type {
            MechanismType::DES_KEY_GEN => (KeyType::DES, 8),
            MechanismType::DES3_KEY_GEN => (KeyType::DES3, 24),
            MechanismType::AES_KEY_GEN => {
                let len = ulong_attr(template, AttributeType::ValueLen).ok_or(Rv::TemplateIncomplete)?;
                if ![16, 24, 32].contains(&len) {
                    return Err(Rv::KeySizeRange);
                }
                (KeyType::AES, len as usize)
            }
            MechanismType::GENERIC_SECRET_KEY_GEN => {
                let len = ulong_attr(template, AttributeType::ValueLen).ok_or(Rv::TemplateIncomplete)?;
                (KeyType::GENERIC_SECRET, len as usize)
            }
            _ => return Err(Rv::MechanismInvalid),
        };
        let mut value = vec![0; len];
        openssl::rand::rand_bytes(&mut value).map_err(ossl)?;
        if key_type == KeyType::DES || key_type == KeyType::DES3 {
            adjust_key_parity(&mut value);
        }
        let mut object = SoftObject::new(template, session);
        object.set(Attribute::Class(ObjectClass::SECRET_KEY));
        object.set(Attribute::KeyType(key_type));
        object.set(Attribute::Value(value));
        object.attributes.remove(&AttributeType::ValueLen);
        state.add_object(session, object)
    }

    fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), Rv> {
        self.fn_call_counts.inc(FnIdx::GenerateKeyPair);
        let mut state = self.state();
        state.check_mechanism(mechanism.mechanism_type)?;
        let unwrap_only = state.settings.unwrap_only_private_keys;

        let mut public = SoftObject::new(public_template, session);
        let mut private = SoftObject::new(private_template, session);
        public.set(Attribute::Class(ObjectClass::PUBLIC_KEY));
        private.set(Attribute::Class(ObjectClass::PRIVATE_KEY));

        match mechanism.mechanism_type {
            MechanismType::RSA_PKCS_KEY_PAIR_GEN => {
                let bits = ulong_attr(public_template, AttributeType::ModulusBits).ok_or(Rv::TemplateIncomplete)?;
                let exponent = match bytes_attr(public_template, AttributeType::PublicExponent) {
                    Some(e) => BigNum::from_slice(e).map_err(ossl)?,
                    None => BigNum::from_u32(65537).map_err(ossl)?,
                };
                let rsa = Rsa::generate_with_e(bits as u32, &exponent).map_err(|_| Rv::KeySizeRange)?;
                let n = rsa.n().to_vec();
                let e = rsa.e().to_vec();
                for obj in [&mut public, &mut private] {
                    obj.set(Attribute::KeyType(KeyType::RSA));
                    obj.set(Attribute::Modulus(n.clone()));
                    obj.set(Attribute::PublicExponent(e.clone()));
                }
                public.set(Attribute::ModulusBits(bits));
                private.set(Attribute::PrivateExponent(rsa.d().to_vec()));
                if let (Some(p), Some(q), Some(dp), Some(dq), Some(qi)) =
                    (rsa.p(), rsa.q(), rsa.dmp1(), rsa.dmq1(), rsa.iqmp())
                {
                    private.set(Attribute::Prime1(p.to_vec()));
                    private.set(Attribute::Prime2(q.to_vec()));
                    private.set(Attribute::Exponent1(dp.to_vec()));
                    private.set(Attribute::Exponent2(dq.to_vec()));
                    private.set(Attribute::Coefficient(qi.to_vec()));
                }
            }
            MechanismType::DSA_KEY_PAIR_GEN => {
                let p = BigNum::from_slice(bytes_attr(public_template, AttributeType::Prime).ok_or(Rv::TemplateIncomplete)?)
                    .map_err(ossl)?;
                let q = BigNum::from_slice(
                    bytes_attr(public_template, AttributeType::Subprime).ok_or(Rv::TemplateIncomplete)?,
                )
                .map_err(ossl)?;
                let g = BigNum::from_slice(bytes_attr(public_template, AttributeType::Base).ok_or(Rv::TemplateIncomplete)?)
                    .map_err(ossl)?;
                let dsa = Dsa::from_pqg(p, q, g).map_err(ossl)?.generate_key().map_err(ossl)?;
                for obj in [&mut public, &mut private] {
                    obj.set(Attribute::KeyType(KeyType::DSA));
                    obj.set(Attribute::Prime(dsa.p().to_vec()));
                    obj.set(Attribute::Subprime(dsa.q().to_vec()));
                    obj.set(Attribute::Base(dsa.g().to_vec()));
                }
                public.set(Attribute::Value(dsa.pub_key().to_vec()));
                private.set(Attribute::Value(dsa.priv_key().to_vec()));
            }
            MechanismType::EC_KEY_PAIR_GEN => {
                let params = bytes_attr(public_template, AttributeType::EcParams).ok_or(Rv::TemplateIncomplete)?;
                let curve = Curve::from_params(params).ok_or(Rv::AttributeValueInvalid)?;
                let group = EcGroup::from_curve_name(curve.nid()).map_err(ossl)?;
                let ec = EcKey::generate(&group).map_err(ossl)?;
                let mut ctx = BigNumContext::new().map_err(ossl)?;
                let point = ec
                    .public_key()
                    .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)
                    .map_err(ossl)?;
                for obj in [&mut public, &mut private] {
                    obj.set(Attribute::KeyType(KeyType::EC));
                    obj.set(Attribute::EcParams(curve.params().to_vec()));
                }
                public.set(Attribute::EcPoint(der_octet_string(&point)));
                private.set(Attribute::Value(ec.private_key().to_vec()));
            }
            MechanismType::DH_PKCS_KEY_PAIR_GEN => {
                let p = BigNum::from_slice(bytes_attr(public_template, AttributeType::Prime).ok_or(Rv::TemplateIncomplete)?)
                    .map_err(ossl)?;
                let g = BigNum::from_slice(bytes_attr(public_template, AttributeType::Base).ok_or(Rv::TemplateIncomplete)?)
                    .map_err(ossl)?;
                let dh = Dh::from_pqg(p, None, g).map_err(ossl)?.generate_key().map_err(ossl)?;
                for obj in [&mut public, &mut private] {
                    obj.set(Attribute::KeyType(KeyType::DH));
                    obj.set(Attribute::Prime(dh.prime_p().to_vec()));
                    obj.set(Attribute::Base(dh.generator().to_vec()));
                }
                public.set(Attribute::Value(dh.public_key().to_vec()));
                private.set(Attribute::Value(dh.private_key().to_vec()));
            }
            _ => return Err(Rv::MechanismInvalid),
        }

        if unwrap_only && private.flag(AttributeType::Decrypt) {
            private.set(Attribute::Decrypt(false));
            private.set(Attribute::Unwrap(true));
        }

        let public_handle = state.add_object(session, public)?;
        match state.add_object(session, private) {
            Ok(private_handle) => Ok((public_handle, private_handle)),
            Err(rv) => {
                state.objects.remove(&public_handle);
                Err(rv)
            }
        }
    }

    fn unwrap_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        unwrapping_key: ObjectHandle,
        wrapped: &[u8],
        template: &[Attribute],
    ) -> Result<ObjectHandle, Rv> {
        self.fn_call_counts.inc(FnIdx::UnwrapKey);
        let mut state = self.state();
        state.check_mechanism(mechanism.mechanism_type)?;
        let key = state.key(unwrapping_key)?;
        if !key.flag(AttributeType::Unwrap) {
            return Err(Rv::KeyFunctionNotPermitted);
        }
        let value = rsa_decrypt(mechanism.mechanism_type, key, wrapped).map_err(|rv| match rv {
            Rv::EncryptedDataInvalid => Rv::WrappedKeyInvalid,
            Rv::EncryptedDataLenRange => Rv::WrappedKeyLenRange,
            other => other,
        })?;
        let mut object = SoftObject::new(template, session);
        object.set(Attribute::Value(value));
        state.add_object(session, object)
    }

    fn derive_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        base_key: ObjectHandle,
        template: &[Attribute],
    ) -> Result<ObjectHandle, Rv> {
        self.fn_call_counts.inc(FnIdx::DeriveKey);
        let mut state = self.state();
        state.check_mechanism(mechanism.mechanism_type)?;
        let other_public = match (&mechanism.mechanism_type, &mechanism.param) {
            (&MechanismType::DH_PKCS_DERIVE, MechanismParam::DhPublic(value)) => value.clone(),
            (&MechanismType::DH_PKCS_DERIVE, _) => return Err(Rv::MechanismParamInvalid),
            _ => return Err(Rv::MechanismInvalid),
        };
        let key = state.key(base_key)?;
        if !key.flag(AttributeType::Derive) {
            return Err(Rv::KeyFunctionNotPermitted);
        }
        let dh = Dh::from_pqg(key.bignum(AttributeType::Prime)?, None, key.bignum(AttributeType::Base)?)
            .map_err(ossl)?
            .set_private_key(key.bignum(AttributeType::Value)?)
            .map_err(ossl)?;
        let other = BigNum::from_slice(&other_public).map_err(ossl)?;
        let mut secret = dh.compute_key(&other).map_err(|_| Rv::DataInvalid)?;
        if let Some(len) = ulong_attr(template, AttributeType::ValueLen) {
            secret.truncate(len as usize);
        }
        let mut object = SoftObject::new(template, session);
        object.set(Attribute::Value(secret));
        object.attributes.remove(&AttributeType::ValueLen);
        state.add_object(session, object)
    }

    fn generate_random(&self, session: SessionHandle, buffer: &mut [u8]) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::GenerateRandom);
        let mut state = self.state();
        state.session(session)?;
        if !state.settings.has_rng {
            return Err(Rv::RandomNoRng);
        }
        openssl::rand::rand_bytes(buffer).map_err(ossl)
    }

    fn finalize(&self) -> Result<(), Rv> {
        self.fn_call_counts.inc(FnIdx::Finalize);
        let mut state = self.state();
        state.sessions.clear();
        state.objects.retain(|_, obj| obj.session.is_none());
        state.logged_in = None;
        state.finalized = true;
        Ok(())
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn logged_in_token() -> (SoftToken, SessionHandle) {
        let token = SoftToken::new(SoftTokenSettings::default());
        let session = token.open_session(SOFT_TOKEN_SLOT, true).unwrap();
        token.login(session, UserType::User, "1234").unwrap();
        (token, session)
    }

    #[test]
    fn write_protected_token_refuses_rw_session() {
        let token = SoftToken::new(SoftTokenSettings {
            write_protected: true,
            ..Default::default()
        });
        assert_eq!(token.open_session(SOFT_TOKEN_SLOT, true), Err(Rv::TokenWriteProtected));
        assert!(token.open_session(SOFT_TOKEN_SLOT, false).is_ok());
    }

    #[test]
    fn untouched_mechanism_info_keeps_seed() {
        let token = SoftToken::new(SoftTokenSettings {
            untouched_mechanism_info: vec![MechanismType::AES_ECB],
            ..Default::default()
        });
        let mut info = MechanismInfo {
            min_key_size: 1,
            max_key_size: 2,
            flags: MechanismFlags::empty(),
        };
        token.mechanism_info(SOFT_TOKEN_SLOT, MechanismType::AES_ECB, &mut info).unwrap();
        assert_eq!((info.min_key_size, info.max_key_size), (1, 2));
    }

    #[test]
    fn private_objects_need_login() {
        let token = SoftToken::new(SoftTokenSettings::default());
        let session = token.open_session(SOFT_TOKEN_SLOT, true).unwrap();
        let template = [
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::KeyType(KeyType::AES),
            Attribute::Private(true),
            Attribute::Value(vec![0; 16]),
        ];
        assert_eq!(token.create_object(session, &template), Err(Rv::UserNotLoggedIn));
        token.login(session, UserType::User, "1234").unwrap();
        assert!(token.create_object(session, &template).is_ok());
    }

    #[test]
    fn session_objects_go_away_with_session() {
        let (token, session) = logged_in_token();
        token
            .create_object(
                session,
                &[
                    Attribute::Class(ObjectClass::SECRET_KEY),
                    Attribute::KeyType(KeyType::AES),
                    Attribute::Token(false),
                    Attribute::Value(vec![0; 16]),
                ],
            )
            .unwrap();
        assert_eq!(token.object_count(), 1);
        token.close_session(session).unwrap();
        assert_eq!(token.object_count(), 0);
    }

    #[test]
    fn aes_cbc_round_trip() {
        let (token, session) = logged_in_token();
        let key = token
            .create_object(
                session,
                &[
                    Attribute::Class(ObjectClass::SECRET_KEY),
                    Attribute::KeyType(KeyType::AES),
                    Attribute::Encrypt(true),
                    Attribute::Decrypt(true),
                    Attribute::Value(vec![7; 16]),
                ],
            )
            .unwrap();
        let mech = Mechanism::with_param(MechanismType::AES_CBC, MechanismParam::Iv(vec![1; 16]));
        let plain = vec![42u8; 32];
        token.encrypt_init(session, &mech, key).unwrap();
        let cipher = token.encrypt(session, &plain).unwrap();
        assert_eq!(cipher.len(), 32);
        token.decrypt_init(session, &mech, key).unwrap();
        assert_eq!(token.decrypt(session, &cipher).unwrap(), plain);
    }

    #[test]
    fn second_sign_init_is_refused() {
        let (token, session) = logged_in_token();
        let key = token
            .create_object(
                session,
                &[
                    Attribute::Class(ObjectClass::SECRET_KEY),
                    Attribute::KeyType(KeyType::GENERIC_SECRET),
                    Attribute::Sign(true),
                    Attribute::Value(vec![7; 20]),
                ],
            )
            .unwrap();
        let mech = Mechanism::new(MechanismType::SHA_1_HMAC);
        token.sign_init(session, &mech, key).unwrap();
        assert_eq!(token.sign_init(session, &mech, key), Err(Rv::OperationActive));
        token.sign_update(session, b"data").unwrap();
        assert_eq!(token.sign_final(session).unwrap().len(), 20);
        token.sign_init(session, &mech, key).unwrap();
    }

    #[test]
    fn find_objects_cursor() {
        let (token, session) = logged_in_token();
        for _ in 0..3 {
            token
                .create_object(
                    session,
                    &[
                        Attribute::Class(ObjectClass::SECRET_KEY),
                        Attribute::KeyType(KeyType::AES),
                        Attribute::Label(b"same".to_vec()),
                        Attribute::Value(vec![0; 16]),
                    ],
                )
                .unwrap();
        }
        token.find_objects_init(session, &[Attribute::Label(b"same".to_vec())]).unwrap();
        assert_eq!(token.find_objects(session, 2).unwrap().len(), 2);
        assert_eq!(token.find_objects(session, 2).unwrap().len(), 1);
        token.find_objects_final(session).unwrap();
        assert_eq!(token.find_objects(session, 1), Err(Rv::OperationNotInitialized));
    }

    #[test]
    fn call_counts() {
        let (token, session) = logged_in_token();
        assert_eq!(token.call_counts().get(FnIdx::OpenSession), 1);
        assert_eq!(token.call_counts().get(FnIdx::Login), 1);
        token.close_session(session).unwrap();
        assert_eq!(token.call_counts().get(FnIdx::CloseSession), 1);
    }
}
