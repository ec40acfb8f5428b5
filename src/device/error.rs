use std::fmt;

use openssl::error::ErrorStack;

use crate::device::{
    mechanism::Algorithm,
    token::{MechanismType, Rv},
};

//------------ DeviceError ---------------------------------------------------

#[derive(Debug)]
pub enum DeviceError {
    /// Out of memory on the host or on the device.
    Memory,
    /// The device was removed or reported a hard error.
    Signalled,
    /// PIN incorrect, expired or locked.
    WrongKey,
    /// Malformed encrypted or wrapped data.
    BadData,
    SignatureInvalid,
    /// Token write-protected or key not extractable.
    Permission,
    /// Data or signature length out of range.
    Overflow,
    AlreadyInitialized,
    NotInitialized,
    RandomFailure,
    /// Another multi-stage operation is in progress on the session.
    Busy,
    NotFound,
    /// A search that must produce one object matched more than one.
    Duplicate,
    Failed,
    NotAvailable,
    /// The device could not be opened.
    Open,
    Argument(String),
    DriverBug(DriverBug),
    OpenSsl(ErrorStack),
    Other(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceError::Memory => write!(f, "Out of memory"),
            DeviceError::Signalled => write!(f, "Device removed or in an error state"),
            DeviceError::WrongKey => write!(f, "Incorrect, expired or locked PIN"),
            DeviceError::BadData => write!(f, "Bad encrypted or wrapped data"),
            DeviceError::SignatureInvalid => write!(f, "Signature is invalid"),
            DeviceError::Permission => write!(f, "Operation not permitted"),
            DeviceError::Overflow => write!(f, "Data length out of range"),
            DeviceError::AlreadyInitialized => write!(f, "Already initialized"),
            DeviceError::NotInitialized => write!(f, "Not initialized"),
            DeviceError::RandomFailure => write!(f, "Random number generation failed"),
            DeviceError::Busy => write!(f, "Another multi-stage operation is in progress"),
            DeviceError::NotFound => write!(f, "Object not found"),
            DeviceError::Duplicate => write!(f, "More than one object matches"),
            DeviceError::Failed => write!(f, "Device operation failed"),
            DeviceError::NotAvailable => write!(f, "Not available on this device"),
            DeviceError::Open => write!(f, "Could not open device"),
            DeviceError::Argument(msg) => write!(f, "Invalid argument: {}", msg),
            DeviceError::DriverBug(bug) => write!(f, "Driver bug: {}", bug),
            DeviceError::OpenSsl(e) => write!(f, "OpenSsl Error: {}", e),
            DeviceError::Other(msg) => write!(f, "Device error: {}", msg),
        }
    }
}

impl std::error::Error for DeviceError {}

impl DeviceError {
    pub fn argument(msg: &str) -> Self {
        DeviceError::Argument(msg.to_string())
    }
}

impl From<ErrorStack> for DeviceError {
    fn from(e: ErrorStack) -> Self {
        DeviceError::OpenSsl(e)
    }
}

impl From<DriverBug> for DeviceError {
    fn from(bug: DriverBug) -> Self {
        DeviceError::DriverBug(bug)
    }
}

/// Maps a token return value to a device error.
///
/// Return values without a natural counterpart map to `default`, which is
/// picked by the caller to describe what it was trying to do.
pub fn map_error(rv: Rv, default: DeviceError) -> DeviceError {
    match rv {
        Rv::HostMemory | Rv::DeviceMemory => DeviceError::Memory,
        Rv::DeviceError | Rv::DeviceRemoved | Rv::TokenNotPresent => DeviceError::Signalled,
        Rv::PinIncorrect | Rv::PinInvalid | Rv::PinLenRange | Rv::PinExpired | Rv::PinLocked => DeviceError::WrongKey,
        Rv::DataInvalid | Rv::EncryptedDataInvalid | Rv::WrappedKeyInvalid => DeviceError::BadData,
        Rv::SignatureInvalid => DeviceError::SignatureInvalid,
        Rv::KeyNotWrappable | Rv::KeyUnextractable | Rv::TokenWriteProtected | Rv::InformationSensitive => {
            DeviceError::Permission
        }
        Rv::DataLenRange
        | Rv::EncryptedDataLenRange
        | Rv::SignatureLenRange
        | Rv::UnwrappingKeySizeRange
        | Rv::WrappingKeySizeRange
        | Rv::WrappedKeyLenRange => DeviceError::Overflow,
        Rv::SessionExists
        | Rv::SessionReadOnlyExists
        | Rv::SessionReadWriteSoExists
        | Rv::UserAlreadyLoggedIn
        | Rv::UserAnotherAlreadyLoggedIn
        | Rv::CryptokiAlreadyInitialized => DeviceError::AlreadyInitialized,
        Rv::UserNotLoggedIn | Rv::UserPinNotInitialized | Rv::CryptokiNotInitialized => DeviceError::NotInitialized,
        Rv::RandomNoRng => DeviceError::RandomFailure,
        Rv::OperationActive => DeviceError::Busy,
        Rv::TokenNotRecognized => DeviceError::NotFound,
        _ => default,
    }
}

//------------ DriverBug -----------------------------------------------------

/// A misbehaviour of a driver that was detected and worked around.
///
/// These are reported in all builds, they describe problems with deployed
/// third-party drivers rather than with this code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DriverBug {
    /// Mechanism info was reported as returned but the output was never
    /// written.
    MechanismInfoUntouched(MechanismType),
    /// The driver reports a user as logged in when no login happened.
    LoginNotEffective,
    /// An object that requires a login could not be used after a login that
    /// the driver reported as already done.
    ObjectUnusableAfterLogin(Rv),
    /// A mechanism lacks flags it must have to be usable.
    MissingRequiredFlags { mechanism: MechanismType, flags: u64 },
    /// Key size bounds were inverted and had to be repaired.
    InconsistentKeySizes { algorithm: Algorithm, min: usize, max: usize },
    /// A public-key capability was reported with only one half of an
    /// encrypt/decrypt or sign/verify pair.
    PartialCapability { algorithm: Algorithm, operation: &'static str },
    /// The token clock reports exactly the host time, suggesting the driver
    /// makes it up.
    FakedClock,
    /// The token reports PIN bounds that make no sense.
    BadPinBounds { min: u64, max: u64 },
}

impl fmt::Display for DriverBug {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DriverBug::MechanismInfoUntouched(mechanism) => {
                write!(f, "mechanism info for {} reported but not returned", mechanism)
            }
            DriverBug::LoginNotEffective => write!(f, "reports 'already logged in' without a login"),
            DriverBug::ObjectUnusableAfterLogin(rv) => {
                write!(f, "objects unusable after login, token returned {}", rv)
            }
            DriverBug::MissingRequiredFlags { mechanism, flags } => {
                write!(f, "mechanism {} lacks required flags {:#x}", mechanism, flags)
            }
            DriverBug::InconsistentKeySizes { algorithm, min, max } => {
                write!(f, "{} key size bounds inverted (min {}, max {})", algorithm, min, max)
            }
            DriverBug::PartialCapability { algorithm, operation } => {
                write!(f, "{} reports {} without its counterpart", algorithm, operation)
            }
            DriverBug::FakedClock => write!(f, "token clock appears to be faked"),
            DriverBug::BadPinBounds { min, max } => write!(f, "nonsensical PIN bounds {}..{}", min, max),
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_return_values() {
        assert!(matches!(map_error(Rv::PinLocked, DeviceError::Failed), DeviceError::WrongKey));
        assert!(matches!(map_error(Rv::DeviceRemoved, DeviceError::Failed), DeviceError::Signalled));
        assert!(matches!(
            map_error(Rv::TokenWriteProtected, DeviceError::Failed),
            DeviceError::Permission
        ));
        assert!(matches!(map_error(Rv::OperationActive, DeviceError::Failed), DeviceError::Busy));
        assert!(matches!(
            map_error(Rv::UserPinNotInitialized, DeviceError::Failed),
            DeviceError::NotInitialized
        ));
        assert!(matches!(
            map_error(Rv::UserAlreadyLoggedIn, DeviceError::Failed),
            DeviceError::AlreadyInitialized
        ));
    }

    #[test]
    fn unknown_return_values_use_default() {
        assert!(matches!(map_error(Rv::GeneralError, DeviceError::Open), DeviceError::Open));
        assert!(matches!(map_error(Rv::Other(0x8000_0001), DeviceError::Failed), DeviceError::Failed));
    }
}
