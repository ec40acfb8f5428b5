//! The function table of a security token.
//!
//! Every PKCS#11 entry point the device layer uses is a method on the
//! [`Token`] trait. All methods return the raw [`Rv`] on failure; mapping it
//! into a [`DeviceError`][crate::device::error::DeviceError] is the caller's
//! job and happens exactly once, at the call site.

use std::fmt;

#[cfg(feature = "hsm")]
pub mod cryptoki;
pub mod soft;

//------------ Handles --------------------------------------------------------

pub type SlotId = u64;
pub type SessionHandle = u64;
pub type ObjectHandle = u64;

//------------ MechanismType -------------------------------------------------

/// A device mechanism identifier, using the PKCS#11 numbering.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MechanismType(pub u64);

impl MechanismType {
    pub const RSA_PKCS_KEY_PAIR_GEN: Self = MechanismType(0x0000);
    pub const RSA_PKCS: Self = MechanismType(0x0001);
    pub const RSA_X_509: Self = MechanismType(0x0003);
    pub const DSA_KEY_PAIR_GEN: Self = MechanismType(0x0010);
    pub const DSA: Self = MechanismType(0x0011);
    pub const DH_PKCS_KEY_PAIR_GEN: Self = MechanismType(0x0020);
    pub const DH_PKCS_DERIVE: Self = MechanismType(0x0021);
    pub const RC2_KEY_GEN: Self = MechanismType(0x0100);
    pub const RC2_ECB: Self = MechanismType(0x0101);
    pub const RC2_CBC: Self = MechanismType(0x0102);
    pub const RC4_KEY_GEN: Self = MechanismType(0x0110);
    pub const RC4: Self = MechanismType(0x0111);
    pub const DES_KEY_GEN: Self = MechanismType(0x0120);
    pub const DES_ECB: Self = MechanismType(0x0121);
    pub const DES_CBC: Self = MechanismType(0x0122);
    pub const DES3_KEY_GEN: Self = MechanismType(0x0131);
    pub const DES3_ECB: Self = MechanismType(0x0132);
    pub const DES3_CBC: Self = MechanismType(0x0133);
    pub const MD5_HMAC: Self = MechanismType(0x0211);
    pub const SHA_1_HMAC: Self = MechanismType(0x0221);
    pub const RIPEMD160_HMAC: Self = MechanismType(0x0241);
    pub const SHA256_HMAC: Self = MechanismType(0x0251);
    pub const RC5_KEY_GEN: Self = MechanismType(0x0330);
    pub const RC5_ECB: Self = MechanismType(0x0331);
    pub const RC5_CBC: Self = MechanismType(0x0332);
    pub const GENERIC_SECRET_KEY_GEN: Self = MechanismType(0x0350);
    pub const EC_KEY_PAIR_GEN: Self = MechanismType(0x1040);
    pub const ECDSA: Self = MechanismType(0x1041);
    pub const AES_KEY_GEN: Self = MechanismType(0x1080);
    pub const AES_ECB: Self = MechanismType(0x1081);
    pub const AES_CBC: Self = MechanismType(0x1082);
    pub const BLOWFISH_KEY_GEN: Self = MechanismType(0x1090);
    pub const BLOWFISH_CBC: Self = MechanismType(0x1091);
}

impl fmt::Display for MechanismType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CKM_{:#06x}", self.0)
    }
}

//------------ MechanismFlags ------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MechanismFlags(pub u64);

impl MechanismFlags {
    pub const HW: Self = MechanismFlags(0x0000_0001);
    pub const ENCRYPT: Self = MechanismFlags(0x0000_0100);
    pub const DECRYPT: Self = MechanismFlags(0x0000_0200);
    pub const DIGEST: Self = MechanismFlags(0x0000_0400);
    pub const SIGN: Self = MechanismFlags(0x0000_0800);
    pub const VERIFY: Self = MechanismFlags(0x0000_2000);
    pub const GENERATE: Self = MechanismFlags(0x0000_8000);
    pub const GENERATE_KEY_PAIR: Self = MechanismFlags(0x0001_0000);
    pub const WRAP: Self = MechanismFlags(0x0002_0000);
    pub const UNWRAP: Self = MechanismFlags(0x0004_0000);
    pub const DERIVE: Self = MechanismFlags(0x0008_0000);
    pub const EC_F_P: Self = MechanismFlags(0x0010_0000);
    pub const EC_NAMEDCURVE: Self = MechanismFlags(0x0080_0000);
    pub const EC_UNCOMPRESS: Self = MechanismFlags(0x0100_0000);

    pub const fn empty() -> Self {
        MechanismFlags(0)
    }

    pub const fn union(self, other: Self) -> Self {
        MechanismFlags(self.0 | other.0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MechanismFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// What a token reports about one mechanism.
///
/// Key sizes are in bits for public-key and in bytes for most conventional
/// mechanisms, as reported, without any interpretation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MechanismInfo {
    pub min_key_size: u64,
    pub max_key_size: u64,
    pub flags: MechanismFlags,
}

//------------ Slot and token information -----------------------------------

#[derive(Clone, Debug, Default)]
pub struct LibraryInfo {
    pub cryptoki_version: (u8, u8),
    pub manufacturer: String,
    pub description: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SlotFlags(pub u64);

impl SlotFlags {
    pub const TOKEN_PRESENT: u64 = 0x0001;
    pub const REMOVABLE_DEVICE: u64 = 0x0002;
    pub const HW_SLOT: u64 = 0x0004;

    pub fn has(self, flag: u64) -> bool {
        self.0 & flag != 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct SlotInfo {
    pub description: String,
    pub manufacturer: String,
    pub flags: SlotFlags,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TokenFlags(pub u64);

impl TokenFlags {
    pub const RNG: u64 = 0x0001;
    pub const WRITE_PROTECTED: u64 = 0x0002;
    pub const LOGIN_REQUIRED: u64 = 0x0004;
    pub const USER_PIN_INITIALIZED: u64 = 0x0008;
    pub const CLOCK_ON_TOKEN: u64 = 0x0040;
    pub const TOKEN_INITIALIZED: u64 = 0x0400;

    pub fn has(self, flag: u64) -> bool {
        self.0 & flag != 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub flags: TokenFlags,
    pub min_pin_len: u64,
    pub max_pin_len: u64,
    /// The token clock as `YYYYMMDDhhmmss00`, empty when there is none.
    pub utc_time: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UserType {
    So,
    User,
}

//------------ Object model --------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ObjectClass(pub u64);

impl ObjectClass {
    pub const CERTIFICATE: Self = ObjectClass(1);
    pub const PUBLIC_KEY: Self = ObjectClass(2);
    pub const PRIVATE_KEY: Self = ObjectClass(3);
    pub const SECRET_KEY: Self = ObjectClass(4);
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct KeyType(pub u64);

impl KeyType {
    pub const RSA: Self = KeyType(0x00);
    pub const DSA: Self = KeyType(0x01);
    pub const DH: Self = KeyType(0x02);
    pub const EC: Self = KeyType(0x03);
    pub const GENERIC_SECRET: Self = KeyType(0x10);
    pub const RC2: Self = KeyType(0x11);
    pub const RC4: Self = KeyType(0x12);
    pub const DES: Self = KeyType(0x13);
    pub const DES3: Self = KeyType(0x15);
    pub const RC5: Self = KeyType(0x19);
    pub const AES: Self = KeyType(0x1F);
    pub const BLOWFISH: Self = KeyType(0x20);
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CertificateType(pub u64);

impl CertificateType {
    pub const X_509: Self = CertificateType(0);
}

/// The attribute tags this layer reads or writes.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum AttributeType {
    Class,
    KeyType,
    CertificateType,
    Token,
    Private,
    Sensitive,
    Extractable,
    Encrypt,
    Decrypt,
    Wrap,
    Unwrap,
    Sign,
    Verify,
    Derive,
    Label,
    Id,
    Url,
    Value,
    ValueLen,
    Subject,
    Issuer,
    SerialNumber,
    Modulus,
    ModulusBits,
    PublicExponent,
    PrivateExponent,
    Prime1,
    Prime2,
    Exponent1,
    Exponent2,
    Coefficient,
    Prime,
    Subprime,
    Base,
    EcParams,
    EcPoint,
}

/// An attribute together with its value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Attribute {
    Class(ObjectClass),
    KeyType(KeyType),
    CertificateType(CertificateType),
    Token(bool),
    Private(bool),
    Sensitive(bool),
    Extractable(bool),
    Encrypt(bool),
    Decrypt(bool),
    Wrap(bool),
    Unwrap(bool),
    Sign(bool),
    Verify(bool),
    Derive(bool),
    Label(Vec<u8>),
    Id(Vec<u8>),
    Url(Vec<u8>),
    Value(Vec<u8>),
    ValueLen(u64),
    Subject(Vec<u8>),
    Issuer(Vec<u8>),
    SerialNumber(Vec<u8>),
    Modulus(Vec<u8>),
    ModulusBits(u64),
    PublicExponent(Vec<u8>),
    PrivateExponent(Vec<u8>),
    Prime1(Vec<u8>),
    Prime2(Vec<u8>),
    Exponent1(Vec<u8>),
    Exponent2(Vec<u8>),
    Coefficient(Vec<u8>),
    Prime(Vec<u8>),
    Subprime(Vec<u8>),
    Base(Vec<u8>),
    EcParams(Vec<u8>),
    EcPoint(Vec<u8>),
}

impl Attribute {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Attribute::Class(_) => AttributeType::Class,
            Attribute::KeyType(_) => AttributeType::KeyType,
            Attribute::CertificateType(_) => AttributeType::CertificateType,
            Attribute::Token(_) => AttributeType::Token,
            Attribute::Private(_) => AttributeType::Private,
            Attribute::Sensitive(_) => AttributeType::Sensitive,
            Attribute::Extractable(_) => AttributeType::Extractable,
            Attribute::Encrypt(_) => AttributeType::Encrypt,
            Attribute::Decrypt(_) => AttributeType::Decrypt,
            Attribute::Wrap(_) => AttributeType::Wrap,
            Attribute::Unwrap(_) => AttributeType::Unwrap,
            Attribute::Sign(_) => AttributeType::Sign,
            Attribute::Verify(_) => AttributeType::Verify,
            Attribute::Derive(_) => AttributeType::Derive,
            Attribute::Label(_) => AttributeType::Label,
            Attribute::Id(_) => AttributeType::Id,
            Attribute::Url(_) => AttributeType::Url,
            Attribute::Value(_) => AttributeType::Value,
            Attribute::ValueLen(_) => AttributeType::ValueLen,
            Attribute::Subject(_) => AttributeType::Subject,
            Attribute::Issuer(_) => AttributeType::Issuer,
            Attribute::SerialNumber(_) => AttributeType::SerialNumber,
            Attribute::Modulus(_) => AttributeType::Modulus,
            Attribute::ModulusBits(_) => AttributeType::ModulusBits,
            Attribute::PublicExponent(_) => AttributeType::PublicExponent,
            Attribute::PrivateExponent(_) => AttributeType::PrivateExponent,
            Attribute::Prime1(_) => AttributeType::Prime1,
            Attribute::Prime2(_) => AttributeType::Prime2,
            Attribute::Exponent1(_) => AttributeType::Exponent1,
            Attribute::Exponent2(_) => AttributeType::Exponent2,
            Attribute::Coefficient(_) => AttributeType::Coefficient,
            Attribute::Prime(_) => AttributeType::Prime,
            Attribute::Subprime(_) => AttributeType::Subprime,
            Attribute::Base(_) => AttributeType::Base,
            Attribute::EcParams(_) => AttributeType::EcParams,
            Attribute::EcPoint(_) => AttributeType::EcPoint,
        }
    }

    /// The value of a boolean attribute.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Attribute::Token(v)
            | Attribute::Private(v)
            | Attribute::Sensitive(v)
            | Attribute::Extractable(v)
            | Attribute::Encrypt(v)
            | Attribute::Decrypt(v)
            | Attribute::Wrap(v)
            | Attribute::Unwrap(v)
            | Attribute::Sign(v)
            | Attribute::Verify(v)
            | Attribute::Derive(v) => Some(*v),
            _ => None,
        }
    }

    /// The value of a byte string attribute.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Attribute::Label(v)
            | Attribute::Id(v)
            | Attribute::Url(v)
            | Attribute::Value(v)
            | Attribute::Subject(v)
            | Attribute::Issuer(v)
            | Attribute::SerialNumber(v)
            | Attribute::Modulus(v)
            | Attribute::PublicExponent(v)
            | Attribute::PrivateExponent(v)
            | Attribute::Prime1(v)
            | Attribute::Prime2(v)
            | Attribute::Exponent1(v)
            | Attribute::Exponent2(v)
            | Attribute::Coefficient(v)
            | Attribute::Prime(v)
            | Attribute::Subprime(v)
            | Attribute::Base(v)
            | Attribute::EcParams(v)
            | Attribute::EcPoint(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// The value of a numeric attribute.
    pub fn as_ulong(&self) -> Option<u64> {
        match self {
            Attribute::ValueLen(v) | Attribute::ModulusBits(v) => Some(*v),
            Attribute::Class(c) => Some(c.0),
            Attribute::KeyType(k) => Some(k.0),
            Attribute::CertificateType(c) => Some(c.0),
            _ => None,
        }
    }

    /// Whether this is a secret that must not be left lying around.
    pub fn is_key_material(&self) -> bool {
        matches!(
            self,
            Attribute::Value(_)
                | Attribute::PrivateExponent(_)
                | Attribute::Prime1(_)
                | Attribute::Prime2(_)
                | Attribute::Exponent1(_)
                | Attribute::Exponent2(_)
                | Attribute::Coefficient(_)
        )
    }
}

//------------ Mechanism -----------------------------------------------------

/// Mechanism-specific parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MechanismParam {
    None,
    Iv(Vec<u8>),
    Rc2 { effective_bits: u64, iv: Option<Vec<u8>> },
    Rc5 { word_size: u64, rounds: u64, iv: Option<Vec<u8>> },
    /// The other party's public value for a Diffie-Hellman derivation.
    DhPublic(Vec<u8>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Mechanism {
    pub mechanism_type: MechanismType,
    pub param: MechanismParam,
}

impl Mechanism {
    pub fn new(mechanism_type: MechanismType) -> Self {
        Mechanism {
            mechanism_type,
            param: MechanismParam::None,
        }
    }

    pub fn with_param(mechanism_type: MechanismType, param: MechanismParam) -> Self {
        Mechanism { mechanism_type, param }
    }
}

//------------ Rv ------------------------------------------------------------

/// A token return value other than `CKR_OK`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rv {
    HostMemory,
    GeneralError,
    FunctionFailed,
    ArgumentsBad,
    AttributeSensitive,
    AttributeTypeInvalid,
    AttributeValueInvalid,
    DataInvalid,
    DataLenRange,
    DeviceError,
    DeviceMemory,
    DeviceRemoved,
    EncryptedDataInvalid,
    EncryptedDataLenRange,
    FunctionNotSupported,
    KeyHandleInvalid,
    KeySizeRange,
    KeyTypeInconsistent,
    KeyFunctionNotPermitted,
    KeyNotWrappable,
    KeyUnextractable,
    MechanismInvalid,
    MechanismParamInvalid,
    ObjectHandleInvalid,
    OperationActive,
    OperationNotInitialized,
    PinIncorrect,
    PinInvalid,
    PinLenRange,
    PinExpired,
    PinLocked,
    SessionClosed,
    SessionCount,
    SessionHandleInvalid,
    SessionReadOnly,
    SessionExists,
    SessionReadOnlyExists,
    SessionReadWriteSoExists,
    SignatureInvalid,
    SignatureLenRange,
    TemplateIncomplete,
    TemplateInconsistent,
    TokenNotPresent,
    TokenNotRecognized,
    TokenWriteProtected,
    UnwrappingKeySizeRange,
    WrappingKeySizeRange,
    UserAlreadyLoggedIn,
    UserNotLoggedIn,
    UserPinNotInitialized,
    UserTypeInvalid,
    UserAnotherAlreadyLoggedIn,
    WrappedKeyInvalid,
    WrappedKeyLenRange,
    RandomNoRng,
    InformationSensitive,
    BufferTooSmall,
    CryptokiNotInitialized,
    CryptokiAlreadyInitialized,
    Other(u64),
}

impl fmt::Display for Rv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rv::Other(code) => write!(f, "CKR_{:#x}", code),
            other => write!(f, "{:?}", other),
        }
    }
}

//------------ Token ---------------------------------------------------------

/// The PKCS#11 function table of one loaded driver.
///
/// Implementations must be usable from several threads at once. Higher
/// layers serialize all calls for one session, but different devices bound
/// to the same driver may call concurrently.
pub trait Token: Send + Sync + fmt::Debug {
    fn library_info(&self) -> Result<LibraryInfo, Rv>;

    /// Slots that currently have a token present.
    fn slot_list(&self) -> Result<Vec<SlotId>, Rv>;

    fn slot_info(&self, slot: SlotId) -> Result<SlotInfo, Rv>;

    fn token_info(&self, slot: SlotId) -> Result<TokenInfo, Rv>;

    fn mechanism_list(&self, slot: SlotId) -> Result<Vec<MechanismType>, Rv>;

    /// Fills in `info`, which the caller may have pre-seeded.
    fn mechanism_info(&self, slot: SlotId, mechanism: MechanismType, info: &mut MechanismInfo) -> Result<(), Rv>;

    fn init_token(&self, slot: SlotId, so_pin: &str, label: &str) -> Result<(), Rv>;

    fn open_session(&self, slot: SlotId, read_write: bool) -> Result<SessionHandle, Rv>;

    fn close_session(&self, session: SessionHandle) -> Result<(), Rv>;

    fn login(&self, session: SessionHandle, user_type: UserType, pin: &str) -> Result<(), Rv>;

    fn logout(&self, session: SessionHandle) -> Result<(), Rv>;

    fn init_pin(&self, session: SessionHandle, pin: &str) -> Result<(), Rv>;

    fn set_pin(&self, session: SessionHandle, old_pin: &str, new_pin: &str) -> Result<(), Rv>;

    fn create_object(&self, session: SessionHandle, template: &[Attribute]) -> Result<ObjectHandle, Rv>;

    fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> Result<(), Rv>;

    fn get_attribute(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: AttributeType,
    ) -> Result<Attribute, Rv>;

    fn set_attributes(&self, session: SessionHandle, object: ObjectHandle, template: &[Attribute]) -> Result<(), Rv>;

    fn find_objects_init(&self, session: SessionHandle, template: &[Attribute]) -> Result<(), Rv>;

    fn find_objects(&self, session: SessionHandle, max: usize) -> Result<Vec<ObjectHandle>, Rv>;

    fn find_objects_final(&self, session: SessionHandle) -> Result<(), Rv>;

    fn encrypt_init(&self, session: SessionHandle, mechanism: &Mechanism, key: ObjectHandle) -> Result<(), Rv>;

    fn encrypt(&self, session: SessionHandle, data: &[u8]) -> Result<Vec<u8>, Rv>;

    fn decrypt_init(&self, session: SessionHandle, mechanism: &Mechanism, key: ObjectHandle) -> Result<(), Rv>;

    fn decrypt(&self, session: SessionHandle, data: &[u8]) -> Result<Vec<u8>, Rv>;

    fn sign_init(&self, session: SessionHandle, mechanism: &Mechanism, key: ObjectHandle) -> Result<(), Rv>;

    fn sign(&self, session: SessionHandle, data: &[u8]) -> Result<Vec<u8>, Rv>;

    fn sign_update(&self, session: SessionHandle, data: &[u8]) -> Result<(), Rv>;

    fn sign_final(&self, session: SessionHandle) -> Result<Vec<u8>, Rv>;

    fn generate_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        template: &[Attribute],
    ) -> Result<ObjectHandle, Rv>;

    fn generate_key_pair(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> Result<(ObjectHandle, ObjectHandle), Rv>;

    fn unwrap_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        unwrapping_key: ObjectHandle,
        wrapped: &[u8],
        template: &[Attribute],
    ) -> Result<ObjectHandle, Rv>;

    fn derive_key(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism,
        base_key: ObjectHandle,
        template: &[Attribute],
    ) -> Result<ObjectHandle, Rv>;

    fn generate_random(&self, session: SessionHandle, buffer: &mut [u8]) -> Result<(), Rv>;

    /// Releases the driver, no further calls are made afterwards.
    fn finalize(&self) -> Result<(), Rv>;
}

/// Trims the blank padding PKCS#11 uses for fixed-size text fields.
pub fn trim_padded(text: &str) -> String {
    text.trim_end_matches([' ', '\0']).trim_start_matches(' ').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_padded_label() {
        assert_eq!(trim_padded("  My token      \0\0"), "My token");
        assert_eq!(trim_padded("                "), "");
    }

    #[test]
    fn mechanism_flags_contains() {
        let flags = MechanismFlags::SIGN | MechanismFlags::VERIFY;
        assert!(flags.contains(MechanismFlags::SIGN));
        assert!(!flags.contains(MechanismFlags::SIGN | MechanismFlags::ENCRYPT));
    }
}
