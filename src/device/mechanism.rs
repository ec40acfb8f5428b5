//! The static registry of mechanisms this layer knows how to drive.
//!
//! Each [`MechanismRecord`] ties an algorithm and mode to the device
//! mechanism that implements it, the mechanism used to generate keys for
//! it, the key type tag used in templates and the [`Family`] that performs
//! the actual operations.

use std::fmt;

use crate::{
    constants::{MAX_KEYSIZE, MAX_PKCSIZE, MAX_PKCSIZE_ECC, MIN_KEYSIZE, MIN_PKCSIZE, MIN_PKCSIZE_ECC},
    device::token::{KeyType, MechanismFlags, MechanismType},
};

//------------ Algorithm -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Algorithm {
    Des,
    TripleDes,
    Rc2,
    Rc4,
    Rc5,
    Aes,
    Blowfish,
    HmacMd5,
    HmacSha1,
    HmacRipemd160,
    HmacSha2,
    Dh,
    Rsa,
    Dsa,
    Ecdsa,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlgorithmClass {
    Conventional,
    Mac,
    Pkc,
}

impl Algorithm {
    pub const ALL: [Algorithm; 15] = [
        Algorithm::Des,
        Algorithm::TripleDes,
        Algorithm::Rc2,
        Algorithm::Rc4,
        Algorithm::Rc5,
        Algorithm::Aes,
        Algorithm::Blowfish,
        Algorithm::HmacMd5,
        Algorithm::HmacSha1,
        Algorithm::HmacRipemd160,
        Algorithm::HmacSha2,
        Algorithm::Dh,
        Algorithm::Rsa,
        Algorithm::Dsa,
        Algorithm::Ecdsa,
    ];

    pub fn class(self) -> AlgorithmClass {
        match self {
            Algorithm::Des
            | Algorithm::TripleDes
            | Algorithm::Rc2
            | Algorithm::Rc4
            | Algorithm::Rc5
            | Algorithm::Aes
            | Algorithm::Blowfish => AlgorithmClass::Conventional,
            Algorithm::HmacMd5 | Algorithm::HmacSha1 | Algorithm::HmacRipemd160 | Algorithm::HmacSha2 => {
                AlgorithmClass::Mac
            }
            Algorithm::Dh | Algorithm::Rsa | Algorithm::Dsa | Algorithm::Ecdsa => AlgorithmClass::Pkc,
        }
    }

    pub fn is_pkc(self) -> bool {
        self.class() == AlgorithmClass::Pkc
    }

    /// Discrete-log and elliptic curve algorithms.
    ///
    /// Keys for these can only be used from inside the device layer, they
    /// are never handed out for direct use.
    pub fn is_dlp_or_ecc(self) -> bool {
        matches!(self, Algorithm::Dh | Algorithm::Dsa | Algorithm::Ecdsa)
    }

    pub fn is_stream_cipher(self) -> bool {
        self == Algorithm::Rc4
    }

    /// DES-family keys carry a parity bit in every byte.
    pub fn needs_parity(self) -> bool {
        matches!(self, Algorithm::Des | Algorithm::TripleDes)
    }

    /// Algorithms whose device-reported key sizes can be taken seriously.
    ///
    /// Everything else reports values in units nobody agrees on.
    pub fn uses_reported_key_sizes(self) -> bool {
        matches!(
            self,
            Algorithm::Dh | Algorithm::Rsa | Algorithm::Dsa | Algorithm::Ecdsa | Algorithm::Rc4
        )
    }

    /// Maps a token key type back to an algorithm.
    ///
    /// Generic secret keys are taken to be HMAC-SHA1 keys, nothing else is
    /// stored under that type by this layer.
    pub fn from_key_type(key_type: KeyType) -> Option<Algorithm> {
        match key_type {
            KeyType::RSA => Some(Algorithm::Rsa),
            KeyType::DSA => Some(Algorithm::Dsa),
            KeyType::DH => Some(Algorithm::Dh),
            KeyType::EC => Some(Algorithm::Ecdsa),
            KeyType::GENERIC_SECRET => Some(Algorithm::HmacSha1),
            KeyType::RC2 => Some(Algorithm::Rc2),
            KeyType::RC4 => Some(Algorithm::Rc4),
            KeyType::DES => Some(Algorithm::Des),
            KeyType::DES3 => Some(Algorithm::TripleDes),
            KeyType::RC5 => Some(Algorithm::Rc5),
            KeyType::AES => Some(Algorithm::Aes),
            KeyType::BLOWFISH => Some(Algorithm::Blowfish),
            _ => None,
        }
    }

    /// The native capability template for this algorithm.
    pub fn native(self) -> &'static NativeCapability {
        match self {
            Algorithm::Des => &const { native(Algorithm::Des, 8, 8, 8, 8) },
            Algorithm::TripleDes => &const { native(Algorithm::TripleDes, 8, 9, 16, 24) },
            Algorithm::Rc2 => &const { native(Algorithm::Rc2, 8, MIN_KEYSIZE, 16, 128) },
            Algorithm::Rc4 => &const { native(Algorithm::Rc4, 1, MIN_KEYSIZE, 16, MAX_KEYSIZE) },
            Algorithm::Rc5 => &const { native(Algorithm::Rc5, 8, MIN_KEYSIZE, 16, 255) },
            Algorithm::Aes => &const { native(Algorithm::Aes, 16, 16, 16, 32) },
            Algorithm::Blowfish => &const { native(Algorithm::Blowfish, 8, MIN_KEYSIZE, 16, 56) },
            Algorithm::HmacMd5 => &const { native(Algorithm::HmacMd5, 16, MIN_KEYSIZE, 16, MAX_KEYSIZE) },
            Algorithm::HmacSha1 => &const { native(Algorithm::HmacSha1, 20, MIN_KEYSIZE, 16, MAX_KEYSIZE) },
            Algorithm::HmacRipemd160 => &const { native(Algorithm::HmacRipemd160, 20, MIN_KEYSIZE, 16, MAX_KEYSIZE) },
            Algorithm::HmacSha2 => &const { native(Algorithm::HmacSha2, 32, MIN_KEYSIZE, 16, MAX_KEYSIZE) },
            Algorithm::Dh => &const { native(Algorithm::Dh, 0, MIN_PKCSIZE, 128, MAX_PKCSIZE) },
            Algorithm::Rsa => &const { native(Algorithm::Rsa, 0, MIN_PKCSIZE, 128, MAX_PKCSIZE) },
            Algorithm::Dsa => &const { native(Algorithm::Dsa, 0, MIN_PKCSIZE, 128, MAX_PKCSIZE) },
            Algorithm::Ecdsa => &const { native(Algorithm::Ecdsa, 0, MIN_PKCSIZE_ECC, 32, MAX_PKCSIZE_ECC) },
        }
    }

    pub fn family(self) -> Family {
        match self {
            Algorithm::Des
            | Algorithm::TripleDes
            | Algorithm::Rc2
            | Algorithm::Rc4
            | Algorithm::Rc5
            | Algorithm::Aes
            | Algorithm::Blowfish => Family::Conventional,
            Algorithm::HmacMd5 | Algorithm::HmacSha1 | Algorithm::HmacRipemd160 | Algorithm::HmacSha2 => Family::Hmac,
            Algorithm::Dh => Family::Dh,
            Algorithm::Rsa => Family::Rsa,
            Algorithm::Dsa => Family::Dsa,
            Algorithm::Ecdsa => Family::Ecdsa,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Algorithm::Des => "DES",
            Algorithm::TripleDes => "3DES",
            Algorithm::Rc2 => "RC2",
            Algorithm::Rc4 => "RC4",
            Algorithm::Rc5 => "RC5",
            Algorithm::Aes => "AES",
            Algorithm::Blowfish => "Blowfish",
            Algorithm::HmacMd5 => "HMAC-MD5",
            Algorithm::HmacSha1 => "HMAC-SHA1",
            Algorithm::HmacRipemd160 => "HMAC-RIPEMD160",
            Algorithm::HmacSha2 => "HMAC-SHA2",
            Algorithm::Dh => "DH",
            Algorithm::Rsa => "RSA",
            Algorithm::Dsa => "DSA",
            Algorithm::Ecdsa => "ECDSA",
        };
        f.write_str(name)
    }
}

//------------ Mode ----------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Mode {
    /// No mode, for MAC and public-key algorithms.
    None,
    Ecb,
    Cbc,
    /// Stream output, used for RC4.
    Ofb,
}

impl Mode {
    pub fn needs_iv(self) -> bool {
        matches!(self, Mode::Cbc | Mode::Ofb)
    }
}

//------------ Family --------------------------------------------------------

/// The group of algorithms that share one implementation of the key and
/// crypto operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Family {
    Conventional,
    Hmac,
    Dh,
    Rsa,
    Dsa,
    Ecdsa,
}

//------------ MechanismRecord -----------------------------------------------

#[derive(Clone, Debug)]
pub struct MechanismRecord {
    pub mechanism: MechanismType,
    pub keygen_mechanism: MechanismType,
    /// The mechanism used for operations that are not tied to one mode.
    pub default_mechanism: MechanismType,
    pub algorithm: Algorithm,
    pub mode: Mode,
    pub key_type: KeyType,
    /// Flags a device must report for the mechanism to be fully usable.
    pub required_flags: MechanismFlags,
}

impl MechanismRecord {
    const fn conv(
        mechanism: MechanismType,
        keygen_mechanism: MechanismType,
        default_mechanism: MechanismType,
        algorithm: Algorithm,
        mode: Mode,
        key_type: KeyType,
    ) -> Self {
        MechanismRecord {
            mechanism,
            keygen_mechanism,
            default_mechanism,
            algorithm,
            mode,
            key_type,
            required_flags: MechanismFlags::empty(),
        }
    }

    const fn pkc(
        mechanism: MechanismType,
        keygen_mechanism: MechanismType,
        algorithm: Algorithm,
        key_type: KeyType,
        required_flags: MechanismFlags,
    ) -> Self {
        MechanismRecord {
            mechanism,
            keygen_mechanism,
            default_mechanism: mechanism,
            algorithm,
            mode: Mode::None,
            key_type,
            required_flags,
        }
    }

    pub fn family(&self) -> Family {
        self.algorithm.family()
    }
}

/// Conventional encryption and MAC mechanisms.
pub static CONVENTIONAL_MECHANISMS: &[MechanismRecord] = &[
    MechanismRecord::conv(
        MechanismType::DES_ECB,
        MechanismType::DES_KEY_GEN,
        MechanismType::DES_CBC,
        Algorithm::Des,
        Mode::Ecb,
        KeyType::DES,
    ),
    MechanismRecord::conv(
        MechanismType::DES_CBC,
        MechanismType::DES_KEY_GEN,
        MechanismType::DES_CBC,
        Algorithm::Des,
        Mode::Cbc,
        KeyType::DES,
    ),
    MechanismRecord::conv(
        MechanismType::DES3_ECB,
        MechanismType::DES3_KEY_GEN,
        MechanismType::DES3_CBC,
        Algorithm::TripleDes,
        Mode::Ecb,
        KeyType::DES3,
    ),
    MechanismRecord::conv(
        MechanismType::DES3_CBC,
        MechanismType::DES3_KEY_GEN,
        MechanismType::DES3_CBC,
        Algorithm::TripleDes,
        Mode::Cbc,
        KeyType::DES3,
    ),
    MechanismRecord::conv(
        MechanismType::RC2_ECB,
        MechanismType::RC2_KEY_GEN,
        MechanismType::RC2_CBC,
        Algorithm::Rc2,
        Mode::Ecb,
        KeyType::RC2,
    ),
    MechanismRecord::conv(
        MechanismType::RC2_CBC,
        MechanismType::RC2_KEY_GEN,
        MechanismType::RC2_CBC,
        Algorithm::Rc2,
        Mode::Cbc,
        KeyType::RC2,
    ),
    MechanismRecord::conv(
        MechanismType::RC4,
        MechanismType::RC4_KEY_GEN,
        MechanismType::RC4,
        Algorithm::Rc4,
        Mode::Ofb,
        KeyType::RC4,
    ),
    MechanismRecord::conv(
        MechanismType::RC5_ECB,
        MechanismType::RC5_KEY_GEN,
        MechanismType::RC5_CBC,
        Algorithm::Rc5,
        Mode::Ecb,
        KeyType::RC5,
    ),
    MechanismRecord::conv(
        MechanismType::RC5_CBC,
        MechanismType::RC5_KEY_GEN,
        MechanismType::RC5_CBC,
        Algorithm::Rc5,
        Mode::Cbc,
        KeyType::RC5,
    ),
    MechanismRecord::conv(
        MechanismType::AES_ECB,
        MechanismType::AES_KEY_GEN,
        MechanismType::AES_CBC,
        Algorithm::Aes,
        Mode::Ecb,
        KeyType::AES,
    ),
    MechanismRecord::conv(
        MechanismType::AES_CBC,
        MechanismType::AES_KEY_GEN,
        MechanismType::AES_CBC,
        Algorithm::Aes,
        Mode::Cbc,
        KeyType::AES,
    ),
    MechanismRecord::conv(
        MechanismType::BLOWFISH_CBC,
        MechanismType::BLOWFISH_KEY_GEN,
        MechanismType::BLOWFISH_CBC,
        Algorithm::Blowfish,
        Mode::Cbc,
        KeyType::BLOWFISH,
    ),
    MechanismRecord::conv(
        MechanismType::MD5_HMAC,
        MechanismType::GENERIC_SECRET_KEY_GEN,
        MechanismType::MD5_HMAC,
        Algorithm::HmacMd5,
        Mode::None,
        KeyType::GENERIC_SECRET,
    ),
    MechanismRecord::conv(
        MechanismType::SHA_1_HMAC,
        MechanismType::GENERIC_SECRET_KEY_GEN,
        MechanismType::SHA_1_HMAC,
        Algorithm::HmacSha1,
        Mode::None,
        KeyType::GENERIC_SECRET,
    ),
    MechanismRecord::conv(
        MechanismType::RIPEMD160_HMAC,
        MechanismType::GENERIC_SECRET_KEY_GEN,
        MechanismType::RIPEMD160_HMAC,
        Algorithm::HmacRipemd160,
        Mode::None,
        KeyType::GENERIC_SECRET,
    ),
    MechanismRecord::conv(
        MechanismType::SHA256_HMAC,
        MechanismType::GENERIC_SECRET_KEY_GEN,
        MechanismType::SHA256_HMAC,
        Algorithm::HmacSha2,
        Mode::None,
        KeyType::GENERIC_SECRET,
    ),
];

/// Public-key mechanisms.
///
/// RSA is driven through `RSA_PKCS` because a number of tokens that do raw
/// RSA only report the PKCS #1 mechanism. The operation code translates
/// between the raw view callers have and the padded one the device sees.
pub static PKC_MECHANISMS: &[MechanismRecord] = &[
    MechanismRecord::pkc(
        MechanismType::DH_PKCS_DERIVE,
        MechanismType::DH_PKCS_KEY_PAIR_GEN,
        Algorithm::Dh,
        KeyType::DH,
        MechanismFlags::empty(),
    ),
    MechanismRecord::pkc(
        MechanismType::RSA_PKCS,
        MechanismType::RSA_PKCS_KEY_PAIR_GEN,
        Algorithm::Rsa,
        KeyType::RSA,
        MechanismFlags::empty(),
    ),
    MechanismRecord::pkc(
        MechanismType::DSA,
        MechanismType::DSA_KEY_PAIR_GEN,
        Algorithm::Dsa,
        KeyType::DSA,
        MechanismFlags::empty(),
    ),
    MechanismRecord::pkc(
        MechanismType::ECDSA,
        MechanismType::EC_KEY_PAIR_GEN,
        Algorithm::Ecdsa,
        KeyType::EC,
        MechanismFlags::EC_F_P
            .union(MechanismFlags::EC_NAMEDCURVE)
            .union(MechanismFlags::EC_UNCOMPRESS),
    ),
];

/// Every known mechanism, public-key ones first.
pub fn records() -> impl Iterator<Item = &'static MechanismRecord> {
    PKC_MECHANISMS.iter().chain(CONVENTIONAL_MECHANISMS.iter())
}

/// Finds the record for an algorithm in a given mode.
pub fn lookup(algorithm: Algorithm, mode: Mode) -> Option<&'static MechanismRecord> {
    records().find(|record| record.algorithm == algorithm && record.mode == mode)
}

/// Finds the first record for an algorithm, whatever its mode.
pub fn lookup_algorithm(algorithm: Algorithm) -> Option<&'static MechanismRecord> {
    records().find(|record| record.algorithm == algorithm)
}

/// The records for every mode of an algorithm.
pub fn modes_of(algorithm: Algorithm) -> impl Iterator<Item = &'static MechanismRecord> {
    records().filter(move |record| record.algorithm == algorithm)
}

//------------ NativeCapability ----------------------------------------------

/// What the native implementation of an algorithm supports.
///
/// Sizes are in bytes. Device capabilities are clamped to these bounds.
#[derive(Clone, Debug)]
pub struct NativeCapability {
    pub algorithm: Algorithm,
    pub block_size: usize,
    pub min_key_size: usize,
    pub key_size: usize,
    pub max_key_size: usize,
}

const fn native(
    algorithm: Algorithm,
    block_size: usize,
    min_key_size: usize,
    key_size: usize,
    max_key_size: usize,
) -> NativeCapability {
    NativeCapability {
        algorithm,
        block_size,
        min_key_size,
        key_size,
        max_key_size,
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_algorithm_has_its_own_native_template() {
        for algorithm in Algorithm::ALL {
            let native = algorithm.native();
            assert_eq!(native.algorithm, algorithm);
            assert!(native.min_key_size <= native.key_size, "{}", algorithm);
            assert!(native.key_size <= native.max_key_size, "{}", algorithm);
        }
        for record in records() {
            assert!(Algorithm::ALL.contains(&record.algorithm));
        }
        assert_eq!(Algorithm::Aes.native().block_size, 16);
        assert_eq!(Algorithm::Ecdsa.native().max_key_size, MAX_PKCSIZE_ECC);
    }

    #[test]
    fn lookup_by_mode() {
        let record = lookup(Algorithm::Aes, Mode::Cbc).unwrap();
        assert_eq!(record.mechanism, MechanismType::AES_CBC);
        assert_eq!(record.keygen_mechanism, MechanismType::AES_KEY_GEN);
        assert!(lookup(Algorithm::Rsa, Mode::Cbc).is_none());
        assert_eq!(modes_of(Algorithm::TripleDes).count(), 2);
    }

    #[test]
    fn generic_secret_is_hmac_sha1() {
        assert_eq!(Algorithm::from_key_type(KeyType::GENERIC_SECRET), Some(Algorithm::HmacSha1));
    }
}
