//! Vendor PKCS#11 libraries, bound through the `cryptoki` crate.
//!
//! The `cryptoki` API merges the init and single-part calls of an operation
//! into one method. [`CryptokiToken`] keeps what an `*_init` call was given
//! per session and issues the combined call when the data arrives, so the
//! layers above see the plain PKCS#11 sequence.

use std::{
    collections::HashMap,
    fmt,
    path::Path,
    sync::{Mutex, MutexGuard},
};

use ::cryptoki::{
    context::{CInitializeArgs, Pkcs11},
    error::{Error as CryptokiError, RvError},
    mechanism::{Mechanism as CkMechanism, MechanismType as CkMechanismType},
    object::{
        Attribute as CkAttribute, AttributeType as CkAttributeType, CertificateType as CkCertificateType,
        KeyType as CkKeyType, ObjectClass as CkObjectClass, ObjectHandle as CkObjectHandle,
    },
    session::{Session, UserType as CkUserType},
    slot::Slot,
    types::{AuthPin, Ulong},
};

use crate::device::token::{
    Attribute, AttributeType, CertificateType, KeyType, LibraryInfo, Mechanism, MechanismFlags, MechanismInfo,
    MechanismParam, MechanismType, ObjectClass, ObjectHandle, Rv, SessionHandle, SlotFlags, SlotId, SlotInfo, Token,
    TokenFlags, TokenInfo, UserType,
};

//------------ Pending -------------------------------------------------------

/// What an init call left for the following data call.
#[derive(Clone, Debug)]
enum Pending {
    Encrypt(Mechanism, ObjectHandle),
    Decrypt(Mechanism, ObjectHandle),
    /// A sign operation, and whether the library has been told yet.
    Sign(Mechanism, ObjectHandle, bool),
    Find(Vec<Attribute>, usize),
}

struct OpenSession {
    session: Session,
    pending: Option<Pending>,
}

#[derive(Default)]
struct CryptokiState {
    slots: HashMap<SlotId, Slot>,
    sessions: HashMap<SessionHandle, OpenSession>,
    objects: HashMap<ObjectHandle, CkObjectHandle>,
    next_session: SessionHandle,
}

impl CryptokiState {
    fn slot(&self, slot: SlotId) -> Result<Slot, Rv> {
        self.slots.get(&slot).copied().ok_or(Rv::ArgumentsBad)
    }

    fn session(&mut self, session: SessionHandle) -> Result<&mut OpenSession, Rv> {
        self.sessions.get_mut(&session).ok_or(Rv::SessionHandleInvalid)
    }

    fn object(&self, object: ObjectHandle) -> Result<CkObjectHandle, Rv> {
        self.objects.get(&object).copied().ok_or(Rv::ObjectHandleInvalid)
    }

    fn adopt(&mut self, object: CkObjectHandle) -> ObjectHandle {
        let handle = object.handle() as ObjectHandle;
        self.objects.insert(handle, object);
        handle
    }

    /// Takes the operation an init call set up, if it is of the right kind.
    fn take_pending(&mut self, session: SessionHandle) -> Result<Pending, Rv> {
        self.session(session)?.pending.take().ok_or(Rv::OperationNotInitialized)
    }
}

//------------ CryptokiToken -------------------------------------------------

pub struct CryptokiToken {
    name: String,
    context: Pkcs11,
    state: Mutex<CryptokiState>,
}

impl fmt::Debug for CryptokiToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CryptokiToken").field("name", &self.name).finish()
    }
}

impl CryptokiToken {
    /// Loads and initialises a PKCS#11 library.
    ///
    /// A library that was already initialised by someone else in this
    /// process is used as is.
    pub fn load(lib_path: &Path) -> Result<Self, Rv> {
        let context = Pkcs11::new(lib_path).map_err(|err| {
            error!("Unable to load PKCS#11 library '{}': {}", lib_path.display(), err);
            Rv::GeneralError
        })?;
        match context.initialize(CInitializeArgs::OsThreads) {
            Ok(()) => {}
            Err(CryptokiError::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {
                debug!("PKCS#11 library '{}' was already initialised", lib_path.display());
            }
            Err(err) => return Err(rv_from(err)),
        }
        let name = lib_path.display().to_string();
        Ok(CryptokiToken {
            name,
            context,
            state: Mutex::new(CryptokiState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, CryptokiState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `op` on an open session.
    fn with_session<T>(
        &self,
        session: SessionHandle,
        op: impl FnOnce(&Session, &mut CryptokiState) -> Result<T, Rv>,
    ) -> Result<T, Rv> {
        let mut state = self.state();
        let open = state.sessions.remove(&session).ok_or(Rv::SessionHandleInvalid)?;
        let res = op(&open.session, &mut state);
        state.sessions.insert(session, open);
        res
    }

    fn init_operation(&self, session: SessionHandle, pending: Pending) -> Result<(), Rv> {
        let mut state = self.state();
        let open = state.session(session)?;
        if open.pending.is_some() {
            return Err(Rv::OperationActive);
        }
        open.pending = Some(pending);
        Ok(())
    }

    fn pending_key(
        &self,
        session: SessionHandle,
        expect: fn(Pending) -> Option<(Mechanism, ObjectHandle)>,
    ) -> Result<(Mechanism, ObjectHandle), Rv> {
        let pending = self.state().take_pending(session)?;
        expect(pending).ok_or(Rv::OperationNotInitialized)
    }

    /// Makes sure the library has seen `C_SignInit` for a pending sign
    /// operation.
    fn start_sign(&self, session: SessionHandle) -> Result<(), Rv> {
        let (mechanism, key) = {
            let mut state = self.state();
            match &mut state.session(session)?.pending {
                Some(Pending::Sign(_, _, true)) => return Ok(()),
                Some(Pending::Sign(mechanism, key, started)) => {
                    *started = true;
                    (mechanism.clone(), *key)
                }
                _ => return Err(Rv::OperationNotInitialized),
            }
        };
        let mech = ck_mechanism(&mechanism)?;
        let res = self.with_session(session, |session, state| {
            session.sign_init(&mech, state.object(key)?).map_err(rv_from)
        });
        if res.is_err() {
            self.state().session(session)?.pending = None;
        }
        res
    }
}

//------------ Conversions ---------------------------------------------------

fn rv_from(err: CryptokiError) -> Rv {
    let rv = match err {
        CryptokiError::Pkcs11(rv, _) => rv,
        other => {
            debug!("cryptoki error: {}", other);
            return Rv::GeneralError;
        }
    };
    match rv {
        RvError::HostMemory => Rv::HostMemory,
        RvError::GeneralError => Rv::GeneralError,
        RvError::FunctionFailed => Rv::FunctionFailed,
        RvError::ArgumentsBad => Rv::ArgumentsBad,
        RvError::AttributeSensitive => Rv::AttributeSensitive,
        RvError::AttributeTypeInvalid => Rv::AttributeTypeInvalid,
        RvError::AttributeValueInvalid => Rv::AttributeValueInvalid,
        RvError::DataInvalid => Rv::DataInvalid,
        RvError::DataLenRange => Rv::DataLenRange,
        RvError::DeviceError => Rv::DeviceError,
        RvError::DeviceMemory => Rv::DeviceMemory,
        RvError::DeviceRemoved => Rv::DeviceRemoved,
        RvError::EncryptedDataInvalid => Rv::EncryptedDataInvalid,
        RvError::EncryptedDataLenRange => Rv::EncryptedDataLenRange,
        RvError::FunctionNotSupported => Rv::FunctionNotSupported,
        RvError::KeyHandleInvalid => Rv::KeyHandleInvalid,
        RvError::KeySizeRange => Rv::KeySizeRange,
        RvError::KeyTypeInconsistent => Rv::KeyTypeInconsistent,
        RvError::KeyFunctionNotPermitted => Rv::KeyFunctionNotPermitted,
        RvError::KeyNotWrappable => Rv::KeyNotWrappable,
        RvError::KeyUnextractable => Rv::KeyUnextractable,
        RvError::MechanismInvalid => Rv::MechanismInvalid,
        RvError::MechanismParamInvalid => Rv::MechanismParamInvalid,
        RvError::ObjectHandleInvalid => Rv::ObjectHandleInvalid,
        RvError::OperationActive => Rv::OperationActive,
        RvError::OperationNotInitialized => Rv::OperationNotInitialized,
        RvError::PinIncorrect => Rv::PinIncorrect,
        RvError::PinInvalid => Rv::PinInvalid,
        RvError::PinLenRange => Rv::PinLenRange,
        RvError::PinExpired => Rv::PinExpired,
        RvError::PinLocked => Rv::PinLocked,
        RvError::SessionClosed => Rv::SessionClosed,
        RvError::SessionCount => Rv::SessionCount,
        RvError::SessionHandleInvalid => Rv::SessionHandleInvalid,
        RvError::SessionReadOnly => Rv::SessionReadOnly,
        RvError::SessionExists => Rv::SessionExists,
        RvError::SessionReadOnlyExists => Rv::SessionReadOnlyExists,
        RvError::SessionReadWriteSoExists => Rv::SessionReadWriteSoExists,
        RvError::SignatureInvalid => Rv::SignatureInvalid,
        RvError::SignatureLenRange => Rv::SignatureLenRange,
        RvError::TemplateIncomplete => Rv::TemplateIncomplete,
        RvError::TemplateInconsistent => Rv::TemplateInconsistent,
        RvError::TokenNotPresent => Rv::TokenNotPresent,
        RvError::TokenNotRecognized => Rv::TokenNotRecognized,
        RvError::TokenWriteProtected => Rv::TokenWriteProtected,
        RvError::UserAlreadyLoggedIn => Rv::UserAlreadyLoggedIn,
        RvError::UserNotLoggedIn => Rv::UserNotLoggedIn,
        RvError::UserPinNotInitialized => Rv::UserPinNotInitialized,
        RvError::UserTypeInvalid => Rv::UserTypeInvalid,
        RvError::UserAnotherAlreadyLoggedIn => Rv::UserAnotherAlreadyLoggedIn,
        RvError::WrappedKeyInvalid => Rv::WrappedKeyInvalid,
        RvError::WrappedKeyLenRange => Rv::WrappedKeyLenRange,
        RvError::RandomNoRng => Rv::RandomNoRng,
        RvError::InformationSensitive => Rv::InformationSensitive,
        RvError::BufferTooSmall => Rv::BufferTooSmall,
        RvError::CryptokiNotInitialized => Rv::CryptokiNotInitialized,
        RvError::CryptokiAlreadyInitialized => Rv::CryptokiAlreadyInitialized,
        other => {
            debug!("Unmapped PKCS#11 return value {:?}", other);
            Rv::GeneralError
        }
    }
}

/// The mechanisms this binding can express.
const KNOWN_MECHANISMS: &[MechanismType] = &[
    MechanismType::RSA_PKCS_KEY_PAIR_GEN,
    MechanismType::RSA_PKCS,
    MechanismType::RSA_X_509,
    MechanismType::DSA_KEY_PAIR_GEN,
    MechanismType::DSA,
    MechanismType::DES_KEY_GEN,
    MechanismType::DES_ECB,
    MechanismType::DES_CBC,
    MechanismType::DES3_KEY_GEN,
    MechanismType::DES3_ECB,
    MechanismType::DES3_CBC,
    MechanismType::SHA_1_HMAC,
    MechanismType::SHA256_HMAC,
    MechanismType::GENERIC_SECRET_KEY_GEN,
    MechanismType::EC_KEY_PAIR_GEN,
    MechanismType::ECDSA,
    MechanismType::AES_KEY_GEN,
    MechanismType::AES_ECB,
    MechanismType::AES_CBC,
];

fn iv_array<const N: usize>(param: &MechanismParam) -> Result<[u8; N], Rv> {
    match param {
        MechanismParam::Iv(iv) => iv.as_slice().try_into().map_err(|_| Rv::MechanismParamInvalid),
        _ => Err(Rv::MechanismParamInvalid),
    }
}

fn ck_mechanism(mechanism: &Mechanism) -> Result<CkMechanism<'static>, Rv> {
    let param = &mechanism.param;
    Ok(match mechanism.mechanism_type {
        MechanismType::RSA_PKCS_KEY_PAIR_GEN => CkMechanism::RsaPkcsKeyPairGen,
        MechanismType::RSA_PKCS => CkMechanism::RsaPkcs,
        MechanismType::RSA_X_509 => CkMechanism::RsaX509,
        MechanismType::DSA_KEY_PAIR_GEN => CkMechanism::DsaKeyPairGen,
        MechanismType::DSA => CkMechanism::Dsa,
        MechanismType::DES_KEY_GEN => CkMechanism::DesKeyGen,
        MechanismType::DES_ECB => CkMechanism::DesEcb,
        MechanismType::DES_CBC => CkMechanism::DesCbc(iv_array(param)?),
        MechanismType::DES3_KEY_GEN => CkMechanism::Des3KeyGen,
        MechanismType::DES3_ECB => CkMechanism::Des3Ecb,
        MechanismType::DES3_CBC => CkMechanism::Des3Cbc(iv_array(param)?),
        MechanismType::SHA_1_HMAC => CkMechanism::Sha1Hmac,
        MechanismType::SHA256_HMAC => CkMechanism::Sha256Hmac,
        MechanismType::GENERIC_SECRET_KEY_GEN => CkMechanism::GenericSecretKeyGen,
        MechanismType::EC_KEY_PAIR_GEN => CkMechanism::EccKeyPairGen,
        MechanismType::ECDSA => CkMechanism::Ecdsa,
        MechanismType::AES_KEY_GEN => CkMechanism::AesKeyGen,
        MechanismType::AES_ECB => CkMechanism::AesEcb,
        MechanismType::AES_CBC => CkMechanism::AesCbc(iv_array(param)?),
        _ => return Err(Rv::MechanismInvalid),
    })
}

fn ck_attribute(attr: &Attribute) -> CkAttribute {
    match attr {
        Attribute::Class(class) => CkAttribute::Class(match *class {
            ObjectClass::CERTIFICATE => CkObjectClass::CERTIFICATE,
            ObjectClass::PUBLIC_KEY => CkObjectClass::PUBLIC_KEY,
            ObjectClass::PRIVATE_KEY => CkObjectClass::PRIVATE_KEY,
            _ => CkObjectClass::SECRET_KEY,
        }),
        Attribute::KeyType(key_type) => CkAttribute::KeyType(ck_key_type(*key_type)),
        Attribute::CertificateType(_) => CkAttribute::CertificateType(CkCertificateType::X_509),
        Attribute::Token(v) => CkAttribute::Token(*v),
        Attribute::Private(v) => CkAttribute::Private(*v),
        Attribute::Sensitive(v) => CkAttribute::Sensitive(*v),
        Attribute::Extractable(v) => CkAttribute::Extractable(*v),
        Attribute::Encrypt(v) => CkAttribute::Encrypt(*v),
        Attribute::Decrypt(v) => CkAttribute::Decrypt(*v),
        Attribute::Wrap(v) => CkAttribute::Wrap(*v),
        Attribute::Unwrap(v) => CkAttribute::Unwrap(*v),
        Attribute::Sign(v) => CkAttribute::Sign(*v),
        Attribute::Verify(v) => CkAttribute::Verify(*v),
        Attribute::Derive(v) => CkAttribute::Derive(*v),
        Attribute::Label(v) => CkAttribute::Label(v.clone()),
        Attribute::Id(v) => CkAttribute::Id(v.clone()),
        Attribute::Url(v) => CkAttribute::Url(v.clone()),
        Attribute::Value(v) => CkAttribute::Value(v.clone()),
        Attribute::ValueLen(v) => CkAttribute::ValueLen(Ulong::from(*v as _)),
        Attribute::Subject(v) => CkAttribute::Subject(v.clone()),
        Attribute::Issuer(v) => CkAttribute::Issuer(v.clone()),
        Attribute::SerialNumber(v) => CkAttribute::SerialNumber(v.clone()),
        Attribute::Modulus(v) => CkAttribute::Modulus(v.clone()),
        Attribute::ModulusBits(v) => CkAttribute::ModulusBits(Ulong::from(*v as _)),
        Attribute::PublicExponent(v) => CkAttribute::PublicExponent(v.clone()),
        Attribute::PrivateExponent(v) => CkAttribute::PrivateExponent(v.clone()),
        Attribute::Prime1(v) => CkAttribute::Prime1(v.clone()),
        Attribute::Prime2(v) => CkAttribute::Prime2(v.clone()),
        Attribute::Exponent1(v) => CkAttribute::Exponent1(v.clone()),
        Attribute::Exponent2(v) => CkAttribute::Exponent2(v.clone()),
        Attribute::Coefficient(v) => CkAttribute::Coefficient(v.clone()),
        Attribute::Prime(v) => CkAttribute::Prime(v.clone()),
        Attribute::Subprime(v) => CkAttribute::Subprime(v.clone()),
        Attribute::Base(v) => CkAttribute::Base(v.clone()),
        Attribute::EcParams(v) => CkAttribute::EcParams(v.clone()),
        Attribute::EcPoint(v) => CkAttribute::EcPoint(v.clone()),
    }
}

fn ck_key_type(key_type: KeyType) -> CkKeyType {
    match key_type {
        KeyType::RSA => CkKeyType::RSA,
        KeyType::DSA => CkKeyType::DSA,
        KeyType::DH => CkKeyType::DH,
        KeyType::EC => CkKeyType::EC,
        KeyType::DES => CkKeyType::DES,
        KeyType::DES3 => CkKeyType::DES3,
        KeyType::AES => CkKeyType::AES,
        _ => CkKeyType::GENERIC_SECRET,
    }
}

fn key_type_from(key_type: CkKeyType) -> KeyType {
    match key_type {
        CkKeyType::RSA => KeyType::RSA,
        CkKeyType::DSA => KeyType::DSA,
        CkKeyType::DH => KeyType::DH,
        CkKeyType::EC => KeyType::EC,
        CkKeyType::DES => KeyType::DES,
        CkKeyType::DES3 => KeyType::DES3,
        CkKeyType::AES => KeyType::AES,
        CkKeyType::GENERIC_SECRET => KeyType::GENERIC_SECRET,
        other => KeyType(*other as u64),
    }
}

fn ck_attribute_type(attr: AttributeType) -> CkAttributeType {
    match attr {
        AttributeType::Class => CkAttributeType::Class,
        AttributeType::KeyType => CkAttributeType::KeyType,
        AttributeType::CertificateType => CkAttributeType::CertificateType,
        AttributeType::Token => CkAttributeType::Token,
        AttributeType::Private => CkAttributeType::Private,
        AttributeType::Sensitive => CkAttributeType::Sensitive,
        AttributeType::Extractable => CkAttributeType::Extractable,
        AttributeType::Encrypt => CkAttributeType::Encrypt,
        AttributeType::Decrypt => CkAttributeType::Decrypt,
        AttributeType::Wrap => CkAttributeType::Wrap,
        AttributeType::Unwrap => CkAttributeType::Unwrap,
        AttributeType::Sign => CkAttributeType::Sign,
        AttributeType::Verify => CkAttributeType::Verify,
        AttributeType::Derive => CkAttributeType::Derive,
        AttributeType::Label => CkAttributeType::Label,
        AttributeType::Id => CkAttributeType::Id,
        AttributeType::Url => CkAttributeType::Url,
        AttributeType::Value => CkAttributeType::Value,
        AttributeType::ValueLen => CkAttributeType::ValueLen,
        AttributeType::Subject => CkAttributeType::Subject,
        AttributeType::Issuer => CkAttributeType::Issuer,
        AttributeType::SerialNumber => CkAttributeType::SerialNumber,
        AttributeType::Modulus => CkAttributeType::Modulus,
        AttributeType::ModulusBits => CkAttributeType::ModulusBits,
        AttributeType::PublicExponent => CkAttributeType::PublicExponent,
        AttributeType::PrivateExponent => CkAttributeType::PrivateExponent,
        AttributeType::Prime1 => CkAttributeType::Prime1,
        AttributeType::Prime2 => CkAttributeType::Prime2,
        AttributeType::Exponent1 => CkAttributeType::Exponent1,
        AttributeType::Exponent2 => CkAttributeType::Exponent2,
        AttributeType::Coefficient => CkAttributeType::Coefficient,
        AttributeType::Prime => CkAttributeType::Prime,
        AttributeType::Subprime => CkAttributeType::Subprime,
        AttributeType::Base => CkAttributeType::Base,
        AttributeType::EcParams => CkAttributeType::EcParams,
        AttributeType::EcPoint => CkAttributeType::EcPoint,
    }
}

fn attribute_from(attr: CkAttribute) -> Option<Attribute> {
    Some(match attr {
        CkAttribute::Class(class) => Attribute::Class(match class {
            CkObjectClass::CERTIFICATE => ObjectClass::CERTIFICATE,
            CkObjectClass::PUBLIC_KEY => ObjectClass::PUBLIC_KEY,
            CkObjectClass::PRIVATE_KEY => ObjectClass::PRIVATE_KEY,
            CkObjectClass::SECRET_KEY => ObjectClass::SECRET_KEY,
            other => ObjectClass(*other as u64),
        }),
        CkAttribute::KeyType(key_type) => Attribute::KeyType(key_type_from(key_type)),
        CkAttribute::CertificateType(cert_type) => Attribute::CertificateType(CertificateType(*cert_type as u64)),
        CkAttribute::Token(v) => Attribute::Token(v),
        CkAttribute::Private(v) => Attribute::Private(v),
        CkAttribute::Sensitive(v) => Attribute::Sensitive(v),
        CkAttribute::Extractable(v) => Attribute::Extractable(v),
        CkAttribute::Encrypt(v) => Attribute::Encrypt(v),
        CkAttribute::Decrypt(v) => Attribute::Decrypt(v),
        CkAttribute::Wrap(v) => Attribute::Wrap(v),
        CkAttribute::Unwrap(v) => Attribute::Unwrap(v),
        CkAttribute::Sign(v) => Attribute::Sign(v),
        CkAttribute::Verify(v) => Attribute::Verify(v),
        CkAttribute::Derive(v) => Attribute::Derive(v),
        CkAttribute::Label(v) => Attribute::Label(v),
        CkAttribute::Id(v) => Attribute::Id(v),
        CkAttribute::Url(v) => Attribute::Url(v),
        CkAttribute::Value(v) => Attribute::Value(v),
        CkAttribute::ValueLen(v) => Attribute::ValueLen(*v as u64),
        CkAttribute::Subject(v) => Attribute::Subject(v),
        CkAttribute::Issuer(v) => Attribute::Issuer(v),
        CkAttribute::SerialNumber(v) => Attribute::SerialNumber(v),
        CkAttribute::Modulus(v) => Attribute::Modulus(v),
        CkAttribute::ModulusBits(v) => Attribute::ModulusBits(*v as u64),
        CkAttribute::PublicExponent(v) => Attribute::PublicExponent(v),
        CkAttribute::PrivateExponent(v) => Attribute::PrivateExponent(v),
        CkAttribute::Prime1(v) => Attribute::Prime1(v),
        CkAttribute::Prime2(v) => Attribute::Prime2(v),
        CkAttribute::Exponent1(v) => Attribute::Exponent1(v),
        CkAttribute::Exponent2(v) => Attribute::Exponent2(v),
        CkAttribute::Coefficient(v) => Attribute::Coefficient(v),
        CkAttribute::Prime(v) => Attribute::Prime(v),
        CkAttribute::Subprime(v) => Attribute::Subprime(v),
        CkAttribute::Base(v) => Attribute::Base(v),
        CkAttribute::EcParams(v) => Attribute::EcParams(v),
        CkAttribute::EcPoint(v) => Attribute::EcPoint(v),
        _ => return None,
    })
}

fn ck_template(template: &[Attribute]) -> Vec<CkAttribute> {
    template.iter().map(ck_attribute).collect()
}

fn ck_user_type(user_type: UserType) -> CkUserType {
    match user_type {
        UserType::So => CkUserType::So,
        UserType::User => CkUserType::User,
    }
}

fn auth_pin(pin: &str) -> AuthPin {
    AuthPin::new(pin.to_string().into())
}

//------------ Token impl ----------------------------------------------------

impl Token for CryptokiToken {
    fn library_info(&self) -> Result<LibraryInfo, Rv> {
        let info = self.context.get_library_info().map_err(rv_from)?;
        let version = info.cryptoki_version();
        Ok(LibraryInfo {
            cryptoki_version: (version.major(), version.minor()),
            manufacturer: info.manufacturer_id().to_string(),
            description: info.library_description().to_string(),
        })
    }

    fn slot_list(&self) -> Result<Vec<SlotId>, Rv> {
        let slots = self.context.get_slots_with_token().map_err(rv_from)?;
        let mut state = self.state();
        Ok(slots
            .into_iter()
            .map(|slot| {
                state.slots.insert(slot.id(), slot);
                slot.id()
            })
            .collect())
    }

    fn slot_info(&self, slot: SlotId) -> Result<SlotInfo, Rv> {
        let slot = self.state().slot(slot)?;
        let info = self.context.get_slot_info(slot).map_err(rv_from)?;
        let mut flags = 0;
        if info.token_present() {
            flags |= SlotFlags::TOKEN_PRESENT;
        }
        if info.removable_device() {
            flags |= SlotFlags::REMOVABLE_DEVICE;
        }
        if info.hardware_slot() {
            flags |= SlotFlags::HW_SLOT;
        }
        Ok(SlotInfo {
            description: info.slot_description().to_string(),
            manufacturer: info.manufacturer_id().to_string(),
            flags: SlotFlags(flags),
        })
    }

    fn token_info(&self, slot: SlotId) -> Result<TokenInfo, Rv> {
        let slot = self.state().slot(slot)?;
        let info = self.context.get_token_info(slot).map_err(rv_from)?;
        let mut flags = 0;
        for (set, flag) in [
            (info.rng(), TokenFlags::RNG),
            (info.write_protected(), TokenFlags::WRITE_PROTECTED),
            (info.login_required(), TokenFlags::LOGIN_REQUIRED),
            (info.user_pin_initialized(), TokenFlags::USER_PIN_INITIALIZED),
            (info.clock_on_token(), TokenFlags::CLOCK_ON_TOKEN),
            (info.token_initialized(), TokenFlags::TOKEN_INITIALIZED),
        ] {
            if set {
                flags |= flag;
            }
        }
        let utc_time = info
            .utc_time()
            .map(|t| {
                format!(
                    "{:04}{:02}{:02}{:02}{:02}{:02}00",
                    t.year, t.month, t.day, t.hour, t.minute, t.second
                )
            })
            .unwrap_or_default();
        Ok(TokenInfo {
            label: info.label().to_string(),
            manufacturer: info.manufacturer_id().to_string(),
            model: info.model().to_string(),
            serial_number: info.serial_number().to_string(),
            flags: TokenFlags(flags),
            min_pin_len: info.min_pin_length() as u64,
            max_pin_len: info.max_pin_length() as u64,
            utc_time,
        })
    }

    fn mechanism_list(&self, slot: SlotId) -> Result<Vec<MechanismType>, Rv> {
        let slot = self.state().slot(slot)?;
        let list = self.context.get_mechanism_list(slot).map_err(rv_from)?;
        Ok(list
            .into_iter()
            .map(|mech| MechanismType(*mech as u64))
            .filter(|mech| KNOWN_MECHANISMS.contains(mech))
            .collect())
    }

    /// The library writes into a fresh structure, a pre-seeded `info` is
    /// always overwritten.
    fn mechanism_info(&self, slot: SlotId, mechanism: MechanismType, info: &mut MechanismInfo) -> Result<(), Rv> {
        let slot = self.state().slot(slot)?;
        let mech = CkMechanismType::try_from(mechanism.0 as std::ffi::c_ulong).map_err(|_| Rv::MechanismInvalid)?;
        let reported = self.context.get_mechanism_info(slot, mech).map_err(rv_from)?;
        let mut flags = MechanismFlags::empty();
        for (set, flag) in [
            (reported.hardware(), MechanismFlags::HW),
            (reported.encrypt(), MechanismFlags::ENCRYPT),
            (reported.decrypt(), MechanismFlags::DECRYPT),
            (reported.digest(), MechanismFlags::DIGEST),
            (reported.sign(), MechanismFlags::SIGN),
            (reported.verify(), MechanismFlags::VERIFY),
            (reported.generate(), MechanismFlags::GENERATE),
            (reported.generate_key_pair(), MechanismFlags::GENERATE_KEY_PAIR),
            (reported.wrap(), MechanismFlags::WRAP),
            (reported.unwrap(), MechanismFlags::UNWRAP),
            (reported.derive(), MechanismFlags::DERIVE),
            (reported.ec_f_p(), MechanismFlags::EC_F_P),
            (reported.ec_from_named_curve(), MechanismFlags::EC_NAMEDCURVE),
            (reported.ec_uncompressed(), MechanismFlags::EC_UNCOMPRESS),
        ] {
            if set {
                flags = flags | flag;
            }
        }
        *info = MechanismInfo {
            min_key_size: reported.min_key_size() as u64,
            max_key_size: reported.max_key_size() as u64,
            flags,
        };
        Ok(())
    }

    fn init_token(&self, slot: SlotId, so_pin: &str, label: &str) -> Result<(), Rv> {
        let slot = self.state().slot(slot)?;
        self.context.init_token(slot, &auth_pin(so_pin), label).map_err(rv_from)
    }

    fn open_session(&self, slot: SlotId, read_write: bool) -> Result<SessionHandle, Rv> {
        let slot = self.state().slot(slot)?;
        let session = if read_write {
            self.context.open_rw_session(slot)
        } else {
            self.context.open_ro_session(slot)
        }
        .map_err(rv_from)?;
        let mut state = self.state();
        state.next_session += 1;
        let handle = state.next_session;
        state.sessions.insert(handle, OpenSession { session, pending: None });
        Ok(handle)
    }

    fn close_session(&self, session: SessionHandle) -> Result<(), Rv> {
        // Dropping the session closes it.
        self.state().sessions.remove(&session).map(drop).ok_or(Rv::SessionHandleInvalid)
    }

    fn login(&self, session: SessionHandle, user_type: UserType, pin: &str) -> Result<(), Rv> {
        self.with_session(session, |session, _| {
            session.login(ck_user_type(user_type), Some(&auth_pin(pin))).map_err(rv_from)
        })
    }

    fn logout(&self, session: SessionHandle) -> Result<(), Rv> {
        self.with_session(session, |session, _| session.logout().map_err(rv_from))
    }

    fn init_pin(&self, session: SessionHandle, pin: &str) -> Result<(), Rv> {
        self.with_session(session, |session, _| session.init_pin(&auth_pin(pin)).map_err(rv_from))
    }

    fn set_pin(&self, session: SessionHandle, old_pin: &str, new_pin: &str) -> Result<(), Rv> {
        self.with_session(session, |session, _| {
            session.set_pin(&auth_pin(old_pin), &auth_pin(new_pin)).map_err(rv_from)
        })
    }

    fn create_object(&self, session: SessionHandle, template: &[Attribute]) -> Result<ObjectHandle, Rv> {
        self.with_session(session, |session, state| {
            let object = session.create_object(&ck_template(template)).map_err(rv_from)?;
            Ok(state.adopt(object))
        })
    }

    fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> Result<(), Rv> {
        self.with_session(session, |session, state| {
            session.destroy_object(state.object(object)?).map_err(rv_from)?;
            state.objects.remove(&object);
            Ok(())
        })
    }

    fn get_attribute(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: AttributeType,
    ) -> Result<Attribute, Rv> {
        self.with_session(session, |session, state| {
            let found = session
                .get_attributes(state.object(object)?, &[ck_attribute_type(attribute)])
                .map_err(rv_from)?;
            found
                .into_iter()
                .find_map(attribute_from)
                .ok_or(Rv::AttributeTypeInvalid)
        })
    }

    fn set_attributes(&self, session: SessionHandle, object: ObjectHandle, template: &[Attribute]) -> Result<(), Rv> {
        self.with_session(session, |session, state| {
            session
                .update_attributes(state.object(object)?, &ck_template(template))
                .map_err(rv_from)
        })
    }

    fn find_objects_init(&self, session: SessionHandle, template: &[Attribute]) -> Result<(), Rv> {
        let mut state = self.state();
        let open = state.session(session)?;
        if open.pending.is_some() {
            return Err(Rv::OperationActive);
        }
        open.pending = Some(Pending::Find(template.to_vec(), 0));
        Ok(())
    }

    fn find_objects(&self, session: SessionHandle, max: usize) -> Result<Vec<ObjectHandle>, Rv> {
        let (template, seen) = match &self.state().session(session)?.pending {
            Some(Pending::Find(template, seen)) => (template.clone(), *seen),
            _ => return Err(Rv::OperationNotInitialized),
        };
        let handles = self.with_session(session, |session, state| {
            let found = session.find_objects(&ck_template(&template)).map_err(rv_from)?;
            Ok(found
                .into_iter()
                .skip(seen)
                .take(max)
                .map(|object| state.adopt(object))
                .collect::<Vec<_>>())
        })?;
        if let Some(Pending::Find(_, seen)) = &mut self.state().session(session)?.pending {
            *seen += handles.len();
        }
        Ok(handles)
    }

    fn find_objects_final(&self, session: SessionHandle) -> Result<(), Rv> {
        let mut state = self.state();
        match state.session(session)?.pending.take() {
            Some(Pending::Find(..)) => Ok(()),
            Some(other) => {
                state.session(session)?.pending = Some(other);
                Err(Rv::OperationNotInitialized)
            }
            None => Err(Rv::OperationNotInitialized),
        }
    }

    fn encrypt_init(&self, session: SessionHandle, mechanism: &Mechanism, key: ObjectHandle) -> Result<(), Rv> {
        self.init_operation(session, Pending::Encrypt(mechanism.clone(), key))
    }

    fn encrypt(&self, session: SessionHandle, data: &[u8]) -> Result<Vec<u8>, Rv> {
        let (mechanism, key) = self.pending_key(session, |p| match p {
            Pending::Encrypt(m, k) => Some((m, k)),
            _ => None,
        })?;
        self.with_session(session, |session, state| {
            session
                .encrypt(&ck_mechanism(&mechanism)?, state.object(key)?, data)
                .map_err(rv_from)
        })
    }

    fn decrypt_init(&self, session: SessionHandle, mechanism: &Mechanism, key: ObjectHandle) -> Result<(), Rv> {
        self.init_operation(session, Pending::Decrypt(mechanism.clone(), key))
    }

    fn decrypt(&self, session: SessionHandle, data: &[u8]) -> Result<Vec<u8>, Rv> {
        let (mechanism, key) = self.pending_key(session, |p| match p {
            Pending::Decrypt(m, k) => Some((m, k)),
            _ => None,
        })?;
        self.with_session(session, |session, state| {
            session
                .decrypt(&ck_mechanism(&mechanism)?, state.object(key)?, data)
                .map_err(rv_from)
        })
    }

    fn sign_init(&self, session: SessionHandle, mechanism: &Mechanism, key: ObjectHandle) -> Result<(), Rv> {
        ck_mechanism(mechanism)?;
        self.init_operation(session, Pending::Sign(mechanism.clone(), key, false))
    }

    fn sign(&self, session: SessionHandle, data: &[u8]) -> Result<Vec<u8>, Rv> {
        let (mechanism, key) = match self.state().take_pending(session)? {
            Pending::Sign(mechanism, key, false) => (mechanism, key),
            _ => return Err(Rv::OperationActive),
        };
        self.with_session(session, |session, state| {
            session
                .sign(&ck_mechanism(&mechanism)?, state.object(key)?, data)
                .map_err(rv_from)
        })
    }

    fn sign_update(&self, session: SessionHandle, data: &[u8]) -> Result<(), Rv> {
        self.start_sign(session)?;
        let res = self.with_session(session, |session, _| session.sign_update(data).map_err(rv_from));
        if res.is_err() {
            self.state().session(session)?.pending = None;
        }
        res
    }

    fn sign_final(&self, session: SessionHandle) -> Result<Vec<u8>, Rv> {
        self.start_sign(session)?;
        self.pending_key(session, |p| match p {
            Pending::Sign(m, k, _) => Some((m, k)),
            _ => None,
        })?;
        self.with_session(session, |session, _| session.sign_final().map_err(rv_from))
    }

    fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        template: &[Attribute],
    ) -> Result<ObjectHandle, Rv> {
        let mech = ck_mechanism(mechanism)?;
        self.with_session(session, |session, state| {
            let object = session.generate_key(&mech, &ck_template(template)).map_err(rv_from)?;
            Ok(state.adopt(object))
        })
    }

    fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), Rv> {
        let mech = ck_mechanism(mechanism)?;
        self.with_session(session, |session, state| {
            let (public, private) = session
                .generate_key_pair(&mech, &ck_template(public_template), &ck_template(private_template))
                .map_err(rv_from)?;
            Ok((state.adopt(public), state.adopt(private)))
        })
    }

    fn unwrap_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        unwrapping_key: ObjectHandle,
        wrapped: &[u8],
        template: &[Attribute],
    ) -> Result<ObjectHandle, Rv> {
        let mech = ck_mechanism(mechanism)?;
        self.with_session(session, |session, state| {
            let object = session
                .unwrap_key(&mech, state.object(unwrapping_key)?, wrapped, &ck_template(template))
                .map_err(rv_from)?;
            Ok(state.adopt(object))
        })
    }

    fn derive_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        base_key: ObjectHandle,
        template: &[Attribute],
    ) -> Result<ObjectHandle, Rv> {
        let mech = ck_mechanism(mechanism)?;
        self.with_session(session, |session, state| {
            let object = session
                .derive_key(&mech, state.object(base_key)?, &ck_template(template))
                .map_err(rv_from)?;
            Ok(state.adopt(object))
        })
    }

    fn generate_random(&self, session: SessionHandle, buffer: &mut [u8]) -> Result<(), Rv> {
        self.with_session(session, |session, _| session.generate_random_slice(buffer).map_err(rv_from))
    }

    /// Closes every session. `C_Finalize` itself is called when the last
    /// handle to the library goes away.
    fn finalize(&self) -> Result<(), Rv> {
        let mut state = self.state();
        state.sessions.clear();
        state.objects.clear();
        Ok(())
    }
}
