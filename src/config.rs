use std::{
    env, fmt,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
};

use log::LevelFilter;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, de};

#[cfg(unix)]
use syslog::Facility;

use crate::constants::{DEFAULT_DRIVERS, DEFAULT_MAX_CHAIN_LENGTH, P11DEVICE_ENV_LOG_LEVEL, P11DEVICE_ENV_LOG_TYPE};

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn log_level() -> LevelFilter {
        match env::var(P11DEVICE_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!("Unrecognized value for log level in env var {}", P11DEVICE_ENV_LOG_LEVEL);
                    LevelFilter::Info
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        match env::var(P11DEVICE_ENV_LOG_TYPE) {
            Ok(log_type) => LogType::from_str(&log_type).unwrap_or(LogType::Stderr),
            _ => LogType::Stderr,
        }
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./p11device.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }

    fn hardware_only() -> bool {
        false
    }

    fn use_hardware_keygen() -> bool {
        true
    }

    fn search_by_enumeration() -> bool {
        true
    }

    fn max_chain_length() -> usize {
        DEFAULT_MAX_CHAIN_LENGTH
    }

    fn drivers() -> Vec<DriverConfig> {
        DEFAULT_DRIVERS
            .iter()
            .map(|lib_path| DriverConfig {
                lib_path: PathBuf::from(lib_path),
                name: None,
                user_pin: None,
            })
            .collect()
    }
}

//------------ Config --------------------------------------------------------

/// Global configuration for the device layer.
///
/// Read from a TOML file, every field has a default so an empty file is a
/// valid configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "deserialize_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,

    #[serde(flatten)]
    pub device: DeviceOptions,

    #[serde(default = "ConfigDefaults::drivers")]
    pub drivers: Vec<DriverConfig>,
}

/// Per-device policy switches.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct DeviceOptions {
    /// Only use mechanisms the token flags as implemented in hardware.
    #[serde(default = "ConfigDefaults::hardware_only")]
    pub hardware_only: bool,

    /// Generate keys on the token rather than generating and loading them.
    #[serde(default = "ConfigDefaults::use_hardware_keygen")]
    pub use_hardware_keygen: bool,

    /// Fall back to walking every certificate when a template search fails.
    #[serde(default = "ConfigDefaults::search_by_enumeration")]
    pub search_by_enumeration: bool,

    /// Upper bound on the number of links followed when building a chain.
    #[serde(default = "ConfigDefaults::max_chain_length")]
    pub max_chain_length: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        DeviceOptions {
            hardware_only: ConfigDefaults::hardware_only(),
            use_hardware_keygen: ConfigDefaults::use_hardware_keygen(),
            search_by_enumeration: ConfigDefaults::search_by_enumeration(),
            max_chain_length: ConfigDefaults::max_chain_length(),
        }
    }
}

/// A PKCS#11 library to load.
#[derive(Clone, Debug, Deserialize)]
pub struct DriverConfig {
    pub lib_path: PathBuf,

    /// Overrides the name the library reports about itself.
    #[serde(default)]
    pub name: Option<String>,

    /// Logs devices opened through this driver in as the user.
    #[serde(default)]
    pub user_pin: Option<SecretString>,
}

impl Config {
    /// Parses a configuration from a TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(toml)?;
        config.verify()?;
        Ok(config)
    }

    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let mut v = String::new();
        let mut f = File::open(file)?;
        f.read_to_string(&mut v)?;

        Self::parse(&v)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.device.max_chain_length == 0 {
            return Err(ConfigError::other("max_chain_length must be at least 1"));
        }
        if self.drivers.len() > crate::constants::MAX_DRIVERS {
            return Err(ConfigError::Other(format!(
                "At most {} drivers can be configured",
                crate::constants::MAX_DRIVERS
            )));
        }
        Ok(())
    }

    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => Err(ConfigError::other("Syslog is only supported on unix")),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!("Failed to open log file '{}': {}", path.display(), err);
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {}", e)))
    }

    /// Creates a syslog logger and configures correctly.
    #[cfg(unix)]
    fn syslog_logger(&self, facility: Facility) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("p11device"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)));
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| ConfigError::Other(format!("Failed to init syslog: {}", e))),
            Err(err) => {
                let msg = format!("Cannot connect to syslog: {}", err);
                Err(ConfigError::Other(msg))
            }
        }
    }

    /// Creates and returns a fern logger.
    ///
    /// Token call tracing is only let through at trace level, it is far too
    /// noisy otherwise.
    pub(crate) fn fern_logger(&self) -> fern::Dispatch {
        let token_level = self.log_level.min(LevelFilter::Debug);
        let token_trace_level = if self.log_level == LevelFilter::Trace {
            LevelFilter::Trace
        } else {
            token_level
        };

        let show_target = self.log_level == LevelFilter::Trace || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("p11device::device::token", token_trace_level)
            .level_for("cryptoki", self.log_level.min(LevelFilter::Warn))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: ConfigDefaults::log_level(),
            log_type: ConfigDefaults::log_type(),
            log_file: ConfigDefaults::log_file(),
            syslog_facility: ConfigDefaults::syslog_facility(),
            device: DeviceOptions::default(),
            drivers: ConfigDefaults::drivers(),
        }
    }
}

fn deserialize_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(|_| de::Error::custom(format!("invalid log level: \"{}\"", string)))
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

impl std::error::Error for ConfigError {}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found : \"{}\"",
                s
            )),
        }
    }
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        LogType::from_str(&string).map_err(de::Error::custom)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn should_parse_empty_config_with_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.device, DeviceOptions::default());
        assert_eq!(config.drivers.len(), DEFAULT_DRIVERS.len());
        assert_eq!(config.syslog_facility, "daemon");
    }

    #[test]
    fn should_parse_full_config() {
        let config = Config::parse(
            r#"
            log_level = "debug"
            log_type = "file"
            log_file = "/tmp/p11.log"
            hardware_only = true
            use_hardware_keygen = false
            search_by_enumeration = false
            max_chain_length = 4

            [[drivers]]
            lib_path = "/usr/lib/softhsm/libsofthsm2.so"
            name = "SoftHSM"
            user_pin = "1234"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(config.log_type, LogType::File);
        assert_eq!(config.log_file, PathBuf::from("/tmp/p11.log"));
        assert!(config.device.hardware_only);
        assert!(!config.device.use_hardware_keygen);
        assert!(!config.device.search_by_enumeration);
        assert_eq!(config.device.max_chain_length, 4);
        assert_eq!(config.drivers.len(), 1);
        let driver = &config.drivers[0];
        assert_eq!(driver.lib_path, PathBuf::from("/usr/lib/softhsm/libsofthsm2.so"));
        assert_eq!(driver.name.as_deref(), Some("SoftHSM"));
        assert_eq!(driver.user_pin.as_ref().map(|pin| pin.expose_secret().as_str()), Some("1234"));
        assert!(!format!("{:?}", driver).contains("1234"));
    }

    #[test]
    fn should_reject_bad_log_type() {
        assert!(matches!(Config::parse(r#"log_type = "journald""#), Err(ConfigError::TomlError(_))));
    }

    #[test]
    fn should_reject_zero_chain_length() {
        assert!(matches!(Config::parse("max_chain_length = 0"), Err(ConfigError::Other(_))));
    }

    #[test]
    fn should_read_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "hardware_only = true").unwrap();
        let config = Config::read_config(file.path()).unwrap();
        assert!(config.device.hardware_only);
    }

    #[test]
    fn should_build_fern_dispatch() {
        let config = Config {
            log_level: LevelFilter::Info,
            ..Default::default()
        };
        let (level, _logger) = config
            .fern_logger()
            .chain(fern::Output::writer(Box::new(io::sink()), ""))
            .into_log();
        assert_eq!(level, LevelFilter::Info);
    }
}
