use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::metadata::LevelFilter;

use crate::error::{Error, Result};

/// The list of devices the server offers.
pub mod devices;

/// Settings for running the server.
///
/// Every field may be left out of a settings file, the default is then used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address to listen on.
    pub address: IpAddr,

    /// Port to listen on.
    pub port: u16,

    /// Path to the device list.
    pub devices: PathBuf,

    /// How much to log.
    /// 0: nothing, 1: server start and stop, 2: connections and devices, 3: every message.
    pub verbose: u8,

    /// Where to log. `-` means standard output.
    pub logfile: String,

    /// How many entries each connection's log of device traffic keeps.
    pub log_tap_capacity: usize,
}

/// The default port to run the server on.
pub const DEFAULT_PORT: u16 = 8082;

impl Default for Settings {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            devices: PathBuf::from("/etc/device/devices.cfg"),
            verbose: 1,
            logfile: "-".into(),
            log_tap_capacity: 1024,
        }
    }
}

impl Settings {
    fn ron() -> ron::Options {
        ron::Options::default().with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self> {
        Self::ron()
            .from_str(input)
            .map_err(|e| Error::BadConfig(format!("bad settings: {e}")))
    }

    /// Settings with every field filled in.
    pub fn example() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            devices: PathBuf::from("devices.cfg"),
            verbose: 2,
            logfile: "/var/log/device-broker.log".into(),
            ..Default::default()
        }
    }

    /// Serialize the settings in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::BadConfig(format!("can't serialize settings: {e}")))
    }

    /// Read settings from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self> {
        let p = p.as_ref();
        let s = std::fs::read_to_string(p)
            .map_err(|e| Error::BadConfig(format!("can't read settings {}: {e}", p.display())))?;

        Self::deserialize(&s)
    }

    /// The log level matching [`Settings::verbose`].
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::OFF,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// The log file, unless logging to standard output.
    pub fn log_file(&self) -> Option<PathBuf> {
        match self.logfile.as_str() {
            "" | "-" => None,
            path => Some(PathBuf::from(path)),
        }
    }
}

/// An example device list.
pub const DEVICES_EXAMPLE: &str = r#"# <device name> <driver name> [-<parameter> <value>]...

# Repeats what it is asked.
echo    test

# A program speaking the Simple Pipe Protocol.
pipe    spp -prog "my_instrument --spp" \
            -read_timeout 10 -idn "My instrument"

# A line based instrument on a serial port.
psu     serial -dev /dev/ttyUSB0 -baud 19200 -parity 8N1
"#;
