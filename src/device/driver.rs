//! Loaded PKCS#11 drivers and opening devices by name.

use std::{fmt, sync::Arc};

use secrecy::SecretString;

use crate::{
    config::{Config, DeviceOptions, DriverConfig},
    constants::{AUTODETECT_DRIVER, DEVICE_NAME_SEPARATOR, MAX_DRIVERS, SOFT_TOKEN_DRIVER_NAME},
    device::{
        Device, DeviceKind,
        error::{DeviceError, map_error},
        token::{Token, UserType, soft::SoftToken, trim_padded},
        traced,
    },
};

//------------ Driver --------------------------------------------------------

/// One loaded driver.
#[derive(Clone)]
pub struct Driver {
    name: String,
    token: Arc<dyn Token>,
    kind: DeviceKind,
    user_pin: Option<SecretString>,
}

impl Driver {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &Arc<dyn Token> {
        &self.token
    }

    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    /// Sets the PIN devices opened through this driver log in with.
    pub fn set_user_pin(&mut self, pin: SecretString) {
        self.user_pin = Some(pin);
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Driver").field("name", &self.name).finish()
    }
}

//------------ DriverRegistry ------------------------------------------------

/// The drivers available to open devices with.
///
/// Dropping the registry finalizes every driver it still holds.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: Vec<Driver>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the drivers named in the configuration.
    ///
    /// A driver that fails to load is logged and left out.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for driver in &config.drivers {
            if let Err(err) = registry.load_configured(driver) {
                info!("Skipping PKCS#11 driver '{}': {}", driver.lib_path.display(), err);
            }
        }
        registry
    }

    #[cfg(feature = "hsm")]
    fn load_configured(&mut self, driver: &DriverConfig) -> Result<(), DeviceError> {
        let user_pin = driver.user_pin.clone();
        let loaded = self.load_mut(&driver.lib_path, driver.name.as_deref())?;
        loaded.user_pin = user_pin;
        Ok(())
    }

    #[cfg(not(feature = "hsm"))]
    fn load_configured(&mut self, _driver: &DriverConfig) -> Result<(), DeviceError> {
        Err(DeviceError::NotAvailable)
    }

    /// Loads a vendor library.
    ///
    /// Without `name`, the driver is named after the library description.
    #[cfg(feature = "hsm")]
    pub fn load(&mut self, lib_path: &std::path::Path, name: Option<&str>) -> Result<&Driver, DeviceError> {
        self.load_mut(lib_path, name).map(|driver| &*driver)
    }

    #[cfg(feature = "hsm")]
    fn load_mut(&mut self, lib_path: &std::path::Path, name: Option<&str>) -> Result<&mut Driver, DeviceError> {
        if self.drivers.len() >= MAX_DRIVERS {
            return Err(DeviceError::Overflow);
        }
        let token = crate::device::token::cryptoki::CryptokiToken::load(lib_path)
            .map_err(|rv| map_error(rv, DeviceError::Open))?;
        let token: Arc<dyn Token> = Arc::new(token);
        let kind = |driver_name: String| DeviceKind::External {
            driver_name,
            lib_path: lib_path.to_path_buf(),
        };
        self.register(token, name, kind)
    }

    /// Registers a software token as a driver.
    pub fn register_soft(&mut self, token: Arc<SoftToken>) -> Result<&mut Driver, DeviceError> {
        let kind = DeviceKind::Soft(token.clone());
        self.register(token, Some(SOFT_TOKEN_DRIVER_NAME), |_| kind)
    }

    fn register(
        &mut self,
        token: Arc<dyn Token>,
        name: Option<&str>,
        kind: impl FnOnce(String) -> DeviceKind,
    ) -> Result<&mut Driver, DeviceError> {
        if self.drivers.len() >= MAX_DRIVERS {
            return Err(DeviceError::Overflow);
        }
        let info = traced("C_GetInfo", token.library_info()).map_err(|rv| map_error(rv, DeviceError::Open))?;
        if info.cryptoki_version.0 < 2 {
            warn!(
                "Driver '{}' implements Cryptoki {}.{}, at least 2.0 is needed",
                trim_padded(&info.description),
                info.cryptoki_version.0,
                info.cryptoki_version.1
            );
            if let Err(rv) = token.finalize() {
                debug!("C_Finalize failed: {}", rv);
            }
            return Err(DeviceError::Open);
        }
        let name = match name {
            Some(name) => name.to_string(),
            None => trim_padded(&info.description),
        };
        info!(
            "Loaded PKCS#11 driver '{}' from {}, Cryptoki {}.{}",
            name,
            trim_padded(&info.manufacturer),
            info.cryptoki_version.0,
            info.cryptoki_version.1
        );
        let kind = kind(name.clone());
        self.drivers.push(Driver {
            name,
            token,
            kind,
            user_pin: None,
        });
        self.drivers.last_mut().ok_or(DeviceError::Failed)
    }

    pub fn drivers(&self) -> &[Driver] {
        &self.drivers
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Finds a driver by name.
    ///
    /// `[Autodetect]` picks the first driver, any other name picks the
    /// first driver whose name starts with it.
    pub fn find(&self, name: &str) -> Result<&Driver, DeviceError> {
        if name == AUTODETECT_DRIVER {
            return self.drivers.first().ok_or(DeviceError::NotFound);
        }
        self.drivers
            .iter()
            .find(|driver| driver.name.starts_with(name))
            .ok_or(DeviceError::NotFound)
    }

    /// Opens a device named `driver::token`.
    ///
    /// The token part is a slot index or a token label and may be left
    /// out, in which case the first slot is used. If the driver has a user
    /// PIN, the device comes back logged in.
    pub fn open_device(&self, name: &str, options: DeviceOptions) -> Result<Arc<Device>, DeviceError> {
        let (driver_name, token) = parse_device_name(name);
        let driver = self.find(driver_name)?;
        debug!("Opening device '{}' through driver '{}'", name, driver.name);
        let device = Device::open(driver.token.clone(), driver.kind.clone(), token, options)?;
        if let Some(pin) = &driver.user_pin {
            device.login(UserType::User, pin)?;
        }
        Ok(device)
    }

    /// Finalizes and forgets every driver.
    pub fn teardown(&mut self) {
        for driver in self.drivers.drain(..) {
            if let Err(rv) = traced("C_Finalize", driver.token.finalize()) {
                error!("Failed to finalize driver '{}': {}", driver.name, rv);
            }
        }
    }
}

impl Drop for DriverRegistry {
    fn drop(&mut self) {
        self.teardown()
    }
}

/// Splits a device name into its driver and token parts.
pub fn parse_device_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once(DEVICE_NAME_SEPARATOR) {
        Some((driver, token)) if !token.is_empty() => (driver, Some(token)),
        Some((driver, _)) => (driver, None),
        None => (name, None),
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::token::soft::{FnIdx, SoftTokenSettings};

    fn soft() -> Arc<SoftToken> {
        Arc::new(SoftToken::new(SoftTokenSettings::default()))
    }

    #[test]
    fn device_names() {
        assert_eq!(parse_device_name("nCipher::2"), ("nCipher", Some("2")));
        assert_eq!(parse_device_name("nCipher::My token"), ("nCipher", Some("My token")));
        assert_eq!(parse_device_name("nCipher::"), ("nCipher", None));
        assert_eq!(parse_device_name("nCipher"), ("nCipher", None));
        assert_eq!(parse_device_name("[Autodetect]::0"), ("[Autodetect]", Some("0")));
    }

    #[test]
    fn driver_lookup() {
        let mut registry = DriverRegistry::new();
        registry.register_soft(soft()).unwrap();
        assert_eq!(registry.find(AUTODETECT_DRIVER).unwrap().name(), SOFT_TOKEN_DRIVER_NAME);
        assert_eq!(registry.find("Soft").unwrap().name(), SOFT_TOKEN_DRIVER_NAME);
        assert!(matches!(registry.find("nCipher"), Err(DeviceError::NotFound)));
        assert!(matches!(
            DriverRegistry::new().find(AUTODETECT_DRIVER),
            Err(DeviceError::NotFound)
        ));
    }

    #[test]
    fn registry_is_bounded() {
        let mut registry = DriverRegistry::new();
        for _ in 0..MAX_DRIVERS {
            registry.register_soft(soft()).unwrap();
        }
        assert!(matches!(registry.register_soft(soft()), Err(DeviceError::Overflow)));
    }

    #[test]
    fn old_cryptoki_is_rejected() {
        let token = Arc::new(SoftToken::new(SoftTokenSettings {
            cryptoki_version: (1, 0),
            ..Default::default()
        }));
        let mut registry = DriverRegistry::new();
        assert!(matches!(registry.register_soft(token.clone()), Err(DeviceError::Open)));
        assert!(registry.is_empty());
        assert_eq!(token.call_counts().get(FnIdx::Finalize), 1);
    }

    #[test]
    fn teardown_finalizes_drivers() {
        let token = soft();
        let mut registry = DriverRegistry::new();
        registry.register_soft(token.clone()).unwrap();
        drop(registry);
        assert_eq!(token.call_counts().get(FnIdx::Finalize), 1);
    }

    #[test]
    fn configured_pin_logs_in() {
        let mut registry = DriverRegistry::new();
        registry
            .register_soft(soft())
            .unwrap()
            .set_user_pin(SecretString::new("1234".to_string()));
        let device = registry.open_device(AUTODETECT_DRIVER, DeviceOptions::default()).unwrap();
        assert!(device.is_logged_in());
        drop(device);

        registry.drivers[0].set_user_pin(SecretString::new("4321".to_string()));
        assert!(matches!(
            registry.open_device(AUTODETECT_DRIVER, DeviceOptions::default()),
            Err(DeviceError::WrongKey)
        ));
    }

    #[test]
    fn open_by_name() {
        let mut registry = DriverRegistry::new();
        registry.register_soft(soft()).unwrap();
        let device = registry.open_device("Software::0", DeviceOptions::default()).unwrap();
        assert_eq!(device.kind().driver_name(), SOFT_TOKEN_DRIVER_NAME);
        assert!(matches!(
            registry.open_device("Software::7", DeviceOptions::default()),
            Err(DeviceError::NotFound)
        ));
        assert!(matches!(
            registry.open_device("Software::No such token", DeviceOptions::default()),
            Err(DeviceError::NotFound)
        ));
    }
}
