//! Various crate-wide constants.

//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const P11DEVICE_ENV_LOG_LEVEL: &str = "P11DEVICE_LOG_LEVEL";

/// The environment variable with the log target.
///
/// The variable should contain the name of a
/// [`LogType`][crate::config::LogType]. It will be overwritten by the config
/// file. The default is “stderr.”
pub const P11DEVICE_ENV_LOG_TYPE: &str = "P11DEVICE_LOG_TYPE";

/// The environment variable pointing at a PKCS#11 library for the
/// `hsm-tests-pkcs11` test suite.
pub const P11DEVICE_ENV_TEST_LIB: &str = "P11DEVICE_TEST_PKCS11_LIB";

/// The environment variable with the user PIN for the `hsm-tests-pkcs11`
/// test suite.
pub const P11DEVICE_ENV_TEST_PIN: &str = "P11DEVICE_TEST_PKCS11_PIN";


//------------ Drivers -------------------------------------------------------

/// The maximum number of drivers that can be loaded at once.
pub const MAX_DRIVERS: usize = 5;

/// The maximum number of slots that are looked at for one driver.
pub const MAX_SLOTS: usize = 16;

/// The slot used when a device name carries no token selector.
pub const DEFAULT_SLOT: usize = 0;

/// Driver name selecting whichever driver was registered first.
pub const AUTODETECT_DRIVER: &str = "[Autodetect]";

/// Separator between the driver and the token part of a device name.
pub const DEVICE_NAME_SEPARATOR: &str = "::";

/// Drivers tried when the configuration names none.
#[cfg(unix)]
pub const DEFAULT_DRIVERS: &[&str] = &["libpkcs11.so", "/opt/nfast/toolkits/pkcs11/libcknfast.so"];

#[cfg(not(unix))]
pub const DEFAULT_DRIVERS: &[&str] = &["pkcs11.dll"];

/// The name the built-in software token reports as its driver name.
pub const SOFT_TOKEN_DRIVER_NAME: &str = "Software";


//------------ PINs and labels -----------------------------------------------

/// The smallest PIN length we accept, whatever the token reports.
pub const MIN_PIN_SIZE: usize = 4;

/// The maximum PIN length used when the token reports a nonsensical one.
pub const DEFAULT_MAX_PIN_SIZE: usize = 8;

/// Longest PIN we ever hand to a token.
pub const MAX_PIN_SIZE: usize = 64;

/// Length of the blank-padded label passed to `C_InitToken`.
pub const TOKEN_LABEL_SIZE: usize = 32;

/// Longest label we store for a key object.
pub const MAX_LABEL_SIZE: usize = 64;

/// Label reported for key objects that carry none.
pub const DUMMY_LABEL: &str = "Label-less PKCS #11 key";


//------------ Capabilities ---------------------------------------------------

/// Pre-seeded minimum key size for mechanism info queries.
///
/// A driver that reports success but leaves this value untouched never
/// wrote its output.
pub const MECHANISM_INFO_CANARY_MIN: u64 = 0xA5A5;

/// Pre-seeded maximum key size for mechanism info queries.
pub const MECHANISM_INFO_CANARY_MAX: u64 = 0x5A5A;

/// Smallest conventional key, in bytes.
pub const MIN_KEYSIZE: usize = 8;

/// Largest conventional or MAC key, in bytes.
pub const MAX_KEYSIZE: usize = 256;

/// Smallest RSA/DSA/DH key, in bytes.
pub const MIN_PKCSIZE: usize = 126;

/// Largest RSA/DSA/DH key, in bytes.
pub const MAX_PKCSIZE: usize = 512;

/// Smallest ECC key, in bytes.
pub const MIN_PKCSIZE_ECC: usize = 24;

/// Largest ECC key, in bytes.
pub const MAX_PKCSIZE_ECC: usize = 72;

/// Device-reported minimum key sizes at or above this (in bits) are junk.
pub const REPORTED_MIN_KEYSIZE_LIMIT: u64 = 10_000;

/// Device-reported maximum key sizes at or above this (in bits) are junk.
pub const REPORTED_MAX_KEYSIZE_LIMIT: u64 = 100_000;

/// Repair value for a conventional capability whose bounds are inverted.
pub const CONV_KEYSIZE_REPAIR: usize = 16;

/// Floor used to repair a public-key capability whose bounds are inverted.
pub const PKC_KEYSIZE_REPAIR: usize = 256;


//------------ Search ---------------------------------------------------------

/// Upper bound on objects visited by a single enumeration search.
pub const FAILSAFE_ITERATIONS_LARGE: usize = 1000;

/// Default upper bound on the length of a certificate chain walk.
pub const DEFAULT_MAX_CHAIN_LENGTH: usize = 16;


//------------ Token clock ---------------------------------------------------

/// How far a token clock may drift from the host clock and still be used.
pub const TOKEN_CLOCK_TOLERANCE_SECS: i64 = 86_400;
